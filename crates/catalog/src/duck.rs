// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! DuckDB-backed catalog.
//!
//! The connection sits behind an async mutex. Every query runs in a sync
//! helper after the lock is taken, so no statement outlives the guard or
//! crosses an await point.

use crate::model::{
    AcqId, Acquisition, ArchiveFile, CopyId, FileCopy, FileCopyRequest, FileId, GroupId,
    HasFile, NewNode, NodeId, RequestId, StorageGroup, StorageKind, StorageNode, WantsFile,
};
use crate::store::{RequestOrigin, Store, StoreTransaction, WantsFilter};
use crate::{CatalogError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::types::Type;
use duckdb::{Connection, Params, Row, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA: &str = r"
CREATE SEQUENCE IF NOT EXISTS catalog_ids START 1;

CREATE TABLE IF NOT EXISTS storage_group (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    name VARCHAR NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS storage_node (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    name VARCHAR NOT NULL UNIQUE,
    group_id BIGINT NOT NULL,
    host VARCHAR NOT NULL,
    root VARCHAR NOT NULL,
    address VARCHAR,
    username VARCHAR,
    storage_type VARCHAR NOT NULL,
    active BOOLEAN NOT NULL,
    suspect BOOLEAN NOT NULL,
    min_avail_gb DOUBLE NOT NULL,
    max_total_gb DOUBLE NOT NULL,
    avail_gb DOUBLE,
    avail_gb_last_checked BIGINT
);

CREATE TABLE IF NOT EXISTS acq (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    name VARCHAR NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS archive_file (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    acq_id BIGINT NOT NULL,
    name VARCHAR NOT NULL,
    size_b BIGINT NOT NULL,
    md5sum VARCHAR NOT NULL,
    UNIQUE (acq_id, name)
);

CREATE TABLE IF NOT EXISTS file_copy (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    file_id BIGINT NOT NULL,
    node_id BIGINT NOT NULL,
    has_file VARCHAR NOT NULL,
    wants_file VARCHAR NOT NULL,
    UNIQUE (file_id, node_id)
);

CREATE TABLE IF NOT EXISTS copy_request (
    id BIGINT PRIMARY KEY DEFAULT nextval('catalog_ids'),
    file_id BIGINT NOT NULL,
    node_from BIGINT NOT NULL,
    group_to BIGINT NOT NULL,
    nice INTEGER NOT NULL,
    completed BOOLEAN NOT NULL,
    cancelled BOOLEAN NOT NULL,
    n_requests INTEGER NOT NULL,
    timestamp BIGINT NOT NULL
);
";

const NODE_COLUMNS: &str = "id, name, group_id, host, root, address, username, storage_type, \
     active, suspect, min_avail_gb, max_total_gb, avail_gb, avail_gb_last_checked";

const FILE_COLUMNS: &str = "id, acq_id, name, size_b, md5sum";

const COPY_COLUMNS: &str = "c.id, c.file_id, c.node_id, c.has_file, c.wants_file";

const REQUEST_COLUMNS: &str = "r.id, r.file_id, r.node_from, r.group_to, r.nice, r.completed, \
     r.cancelled, r.n_requests, r.timestamp";

/// Message fragments of DuckDB failures worth retrying: IO errors (which
/// include lock contention on the database file) and transaction conflicts.
const TRANSIENT_MARKERS: [&str; 4] = [
    "io error",
    "could not set lock",
    "database is locked",
    "conflict",
];

pub(crate) fn is_transient_duckdb(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

impl From<duckdb::Error> for CatalogError {
    fn from(e: duckdb::Error) -> Self {
        let message = e.to_string();
        if is_transient_duckdb(&message) {
            CatalogError::ConnectionLost(message)
        } else {
            CatalogError::DuckDb(e)
        }
    }
}

/// Catalog persisted in a DuckDB database file.
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Open (creating if needed) the catalog at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

fn query_all<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> duckdb::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, f)?
        .collect::<duckdb::Result<Vec<T>>>()?;
    Ok(rows)
}

fn query_first<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Option<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> duckdb::Result<T>,
{
    Ok(query_all(conn, sql, params, f)?.into_iter().next())
}

fn decode<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: fn(char) -> Option<T>,
) -> duckdb::Result<T> {
    let raw: String = row.get(idx)?;
    let first = raw.chars().next();
    first.and_then(parse).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(CatalogError::InvalidValue { column, value: raw }),
        )
    })
}

fn code(c: char) -> String {
    c.to_string()
}

fn to_i64(column: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| CatalogError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn node_from_row(row: &Row<'_>) -> duckdb::Result<StorageNode> {
    let root: String = row.get(4)?;
    let checked: Option<i64> = row.get(13)?;
    Ok(StorageNode {
        id: NodeId(row.get(0)?),
        name: row.get(1)?,
        group_id: GroupId(row.get(2)?),
        host: row.get(3)?,
        root: PathBuf::from(root),
        address: row.get(5)?,
        username: row.get(6)?,
        kind: decode(row, 7, "storage_type", StorageKind::from_code)?,
        active: row.get(8)?,
        suspect: row.get(9)?,
        min_avail_gb: row.get(10)?,
        max_total_gb: row.get(11)?,
        avail_gb: row.get(12)?,
        avail_gb_last_checked: checked.and_then(DateTime::from_timestamp_micros),
    })
}

fn group_from_row(row: &Row<'_>) -> duckdb::Result<StorageGroup> {
    Ok(StorageGroup {
        id: GroupId(row.get(0)?),
        name: row.get(1)?,
    })
}

fn acq_from_row(row: &Row<'_>) -> duckdb::Result<Acquisition> {
    Ok(Acquisition {
        id: AcqId(row.get(0)?),
        name: row.get(1)?,
    })
}

fn file_from_row(row: &Row<'_>) -> duckdb::Result<ArchiveFile> {
    let size: i64 = row.get(3)?;
    Ok(ArchiveFile {
        id: FileId(row.get(0)?),
        acq_id: AcqId(row.get(1)?),
        name: row.get(2)?,
        size_b: u64::try_from(size).unwrap_or_default(),
        md5sum: row.get(4)?,
    })
}

fn copy_from_row(row: &Row<'_>) -> duckdb::Result<FileCopy> {
    Ok(FileCopy {
        id: CopyId(row.get(0)?),
        file_id: FileId(row.get(1)?),
        node_id: NodeId(row.get(2)?),
        has_file: decode(row, 3, "has_file", HasFile::from_code)?,
        wants_file: decode(row, 4, "wants_file", WantsFile::from_code)?,
    })
}

fn request_from_row(row: &Row<'_>) -> duckdb::Result<FileCopyRequest> {
    let n_requests: i32 = row.get(7)?;
    let stamp: i64 = row.get(8)?;
    Ok(FileCopyRequest {
        id: RequestId(row.get(0)?),
        file_id: FileId(row.get(1)?),
        node_from: NodeId(row.get(2)?),
        group_to: GroupId(row.get(3)?),
        nice: row.get(4)?,
        completed: row.get(5)?,
        cancelled: row.get(6)?,
        n_requests: u32::try_from(n_requests).unwrap_or_default(),
        timestamp: DateTime::from_timestamp_micros(stamp).unwrap_or_default(),
    })
}

fn select_copy(conn: &Connection, file: FileId, node: NodeId) -> Result<Option<FileCopy>> {
    query_first(
        conn,
        &format!("SELECT {COPY_COLUMNS} FROM file_copy c WHERE c.file_id = ? AND c.node_id = ?"),
        params![file.0, node.0],
        copy_from_row,
    )
}

fn update_copy(conn: &Connection, copy: &FileCopy) -> Result<()> {
    let changed = conn.execute(
        "UPDATE file_copy SET has_file = ?, wants_file = ? WHERE id = ?",
        params![
            code(copy.has_file.code()),
            code(copy.wants_file.code()),
            copy.id.0
        ],
    )?;
    if changed == 0 {
        return Err(CatalogError::not_found("file copy", copy.id));
    }
    Ok(())
}

fn insert_copy(
    conn: &Connection,
    file: FileId,
    node: NodeId,
    has: HasFile,
    wants: WantsFile,
) -> Result<FileCopy> {
    if select_copy(conn, file, node)?.is_some() {
        return Err(CatalogError::duplicate(
            "file copy",
            format!("file {file} on node {node}"),
        ));
    }
    let id: i64 = conn.query_row(
        "INSERT INTO file_copy (file_id, node_id, has_file, wants_file) \
         VALUES (?, ?, ?, ?) RETURNING id",
        params![file.0, node.0, code(has.code()), code(wants.code())],
        |row| row.get(0),
    )?;
    Ok(FileCopy {
        id: CopyId(id),
        file_id: file,
        node_id: node,
        has_file: has,
        wants_file: wants,
    })
}

fn complete_requests(conn: &Connection, file: FileId, group: GroupId) -> Result<u64> {
    let changed = conn.execute(
        "UPDATE copy_request SET completed = true \
         WHERE file_id = ? AND group_to = ? AND NOT completed",
        params![file.0, group.0],
    )?;
    Ok(changed as u64)
}

fn find_group(conn: &Connection, name: &str) -> Result<Option<StorageGroup>> {
    query_first(
        conn,
        "SELECT id, name FROM storage_group WHERE name = ?",
        params![name],
        group_from_row,
    )
}

fn find_node(conn: &Connection, name: &str) -> Result<Option<StorageNode>> {
    query_first(
        conn,
        &format!("SELECT {NODE_COLUMNS} FROM storage_node WHERE name = ?"),
        params![name],
        node_from_row,
    )
}

fn find_acquisition(conn: &Connection, name: &str) -> Result<Option<Acquisition>> {
    query_first(
        conn,
        "SELECT id, name FROM acq WHERE name = ?",
        params![name],
        acq_from_row,
    )
}

fn find_file(conn: &Connection, acq: AcqId, name: &str) -> Result<Option<ArchiveFile>> {
    query_first(
        conn,
        &format!("SELECT {FILE_COLUMNS} FROM archive_file WHERE acq_id = ? AND name = ?"),
        params![acq.0, name],
        file_from_row,
    )
}

fn exists(conn: &Connection, table: &str, id: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {table} WHERE id = ?"),
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[async_trait]
impl Store for DuckDbStore {
    async fn nodes_on_host(&self, host: &str) -> Result<Vec<StorageNode>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!("SELECT {NODE_COLUMNS} FROM storage_node WHERE host = ? ORDER BY id"),
                params![host],
                node_from_row,
            )
        })
        .await
    }

    async fn node(&self, id: NodeId) -> Result<Option<StorageNode>> {
        self.run(|conn| {
            query_first(
                conn,
                &format!("SELECT {NODE_COLUMNS} FROM storage_node WHERE id = ?"),
                params![id.0],
                node_from_row,
            )
        })
        .await
    }

    async fn find_node(&self, name: &str) -> Result<Option<StorageNode>> {
        self.run(|conn| find_node(conn, name)).await
    }

    async fn group(&self, id: GroupId) -> Result<Option<StorageGroup>> {
        self.run(|conn| {
            query_first(
                conn,
                "SELECT id, name FROM storage_group WHERE id = ?",
                params![id.0],
                group_from_row,
            )
        })
        .await
    }

    async fn find_group(&self, name: &str) -> Result<Option<StorageGroup>> {
        self.run(|conn| find_group(conn, name)).await
    }

    async fn create_group(&self, name: &str) -> Result<StorageGroup> {
        self.run(|conn| {
            if find_group(conn, name)?.is_some() {
                return Err(CatalogError::duplicate("group", name));
            }
            let id: i64 = conn.query_row(
                "INSERT INTO storage_group (name) VALUES (?) RETURNING id",
                params![name],
                |row| row.get(0),
            )?;
            Ok(StorageGroup {
                id: GroupId(id),
                name: name.to_string(),
            })
        })
        .await
    }

    async fn create_node(&self, node: NewNode) -> Result<StorageNode> {
        self.run(move |conn| {
            if find_node(conn, &node.name)?.is_some() {
                return Err(CatalogError::duplicate("node", &node.name));
            }
            if !exists(conn, "storage_group", node.group_id.0)? {
                return Err(CatalogError::not_found("group", node.group_id));
            }
            let id: i64 = conn.query_row(
                "INSERT INTO storage_node (name, group_id, host, root, address, username, \
                 storage_type, active, suspect, min_avail_gb, max_total_gb, avail_gb) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                params![
                    node.name,
                    node.group_id.0,
                    node.host,
                    node.root.to_string_lossy().into_owned(),
                    node.address,
                    node.username,
                    code(node.kind.code()),
                    node.active,
                    node.suspect,
                    node.min_avail_gb,
                    node.max_total_gb,
                    node.avail_gb,
                ],
                |row| row.get(0),
            )?;
            Ok(node.into_node(NodeId(id)))
        })
        .await
    }

    async fn set_free_space(
        &self,
        node: NodeId,
        avail_gb: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.run(|conn| {
            let changed = conn.execute(
                "UPDATE storage_node SET avail_gb = ?, avail_gb_last_checked = ? WHERE id = ?",
                params![avail_gb, checked_at.timestamp_micros(), node.0],
            )?;
            if changed == 0 {
                return Err(CatalogError::not_found("node", node));
            }
            Ok(())
        })
        .await
    }

    async fn acquisition(&self, id: AcqId) -> Result<Option<Acquisition>> {
        self.run(|conn| {
            query_first(
                conn,
                "SELECT id, name FROM acq WHERE id = ?",
                params![id.0],
                acq_from_row,
            )
        })
        .await
    }

    async fn find_acquisition(&self, name: &str) -> Result<Option<Acquisition>> {
        self.run(|conn| find_acquisition(conn, name)).await
    }

    async fn ensure_acquisition(&self, name: &str) -> Result<Acquisition> {
        self.run(|conn| {
            if let Some(acq) = find_acquisition(conn, name)? {
                return Ok(acq);
            }
            let id: i64 = conn.query_row(
                "INSERT INTO acq (name) VALUES (?) RETURNING id",
                params![name],
                |row| row.get(0),
            )?;
            Ok(Acquisition {
                id: AcqId(id),
                name: name.to_string(),
            })
        })
        .await
    }

    async fn file(&self, id: FileId) -> Result<Option<ArchiveFile>> {
        self.run(|conn| {
            query_first(
                conn,
                &format!("SELECT {FILE_COLUMNS} FROM archive_file WHERE id = ?"),
                params![id.0],
                file_from_row,
            )
        })
        .await
    }

    async fn find_file(&self, acq: AcqId, name: &str) -> Result<Option<ArchiveFile>> {
        self.run(|conn| find_file(conn, acq, name)).await
    }

    async fn ensure_file(
        &self,
        acq: AcqId,
        name: &str,
        size_b: u64,
        md5sum: &str,
    ) -> Result<ArchiveFile> {
        self.run(|conn| {
            if let Some(file) = find_file(conn, acq, name)? {
                return Ok(file);
            }
            if !exists(conn, "acq", acq.0)? {
                return Err(CatalogError::not_found("acquisition", acq));
            }
            let id: i64 = conn.query_row(
                "INSERT INTO archive_file (acq_id, name, size_b, md5sum) \
                 VALUES (?, ?, ?, ?) RETURNING id",
                params![acq.0, name, to_i64("size_b", size_b)?, md5sum],
                |row| row.get(0),
            )?;
            Ok(ArchiveFile {
                id: FileId(id),
                acq_id: acq,
                name: name.to_string(),
                size_b,
                md5sum: md5sum.to_string(),
            })
        })
        .await
    }

    async fn copy(&self, file: FileId, node: NodeId) -> Result<Option<FileCopy>> {
        self.run(|conn| select_copy(conn, file, node)).await
    }

    async fn copies_on_node(&self, node: NodeId) -> Result<Vec<FileCopy>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {COPY_COLUMNS} FROM file_copy c WHERE c.node_id = ? \
                     ORDER BY c.file_id, c.id"
                ),
                params![node.0],
                copy_from_row,
            )
        })
        .await
    }

    async fn copies_with_state(
        &self,
        node: NodeId,
        has: HasFile,
        limit: usize,
    ) -> Result<Vec<FileCopy>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {COPY_COLUMNS} FROM file_copy c \
                     WHERE c.node_id = ? AND c.has_file = ? ORDER BY c.id LIMIT ?"
                ),
                params![node.0, code(has.code()), limit_param(limit)],
                copy_from_row,
            )
        })
        .await
    }

    async fn reclaim_candidates(
        &self,
        node: NodeId,
        filter: WantsFilter,
        limit: usize,
    ) -> Result<Vec<FileCopy>> {
        let wants = match filter {
            WantsFilter::ExplicitlyUnwanted => "c.wants_file = 'N'",
            WantsFilter::NotWanted => "c.wants_file <> 'Y'",
        };
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {COPY_COLUMNS} FROM file_copy c \
                     WHERE c.node_id = ? AND c.has_file = 'Y' AND {wants} \
                     ORDER BY c.file_id, c.id LIMIT ?"
                ),
                params![node.0, limit_param(limit)],
                copy_from_row,
            )
        })
        .await
    }

    async fn archive_copies_elsewhere(&self, file: FileId, excluding: NodeId) -> Result<u64> {
        self.run(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM file_copy c JOIN storage_node n ON n.id = c.node_id \
                 WHERE c.file_id = ? AND c.node_id <> ? AND c.has_file = 'Y' \
                 AND n.storage_type = 'A'",
                params![file.0, excluding.0],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn archived_bytes(&self, node: NodeId) -> Result<u64> {
        self.run(|conn| {
            let total: i64 = conn.query_row(
                "SELECT CAST(COALESCE(SUM(f.size_b), 0) AS BIGINT) \
                 FROM file_copy c JOIN archive_file f ON f.id = c.file_id \
                 WHERE c.node_id = ? AND c.has_file = 'Y'",
                params![node.0],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(total).unwrap_or_default())
        })
        .await
    }

    async fn set_has_file(&self, file: FileId, node: NodeId, has: HasFile) -> Result<u64> {
        self.run(|conn| {
            let changed = conn.execute(
                "UPDATE file_copy SET has_file = ? WHERE file_id = ? AND node_id = ?",
                params![code(has.code()), file.0, node.0],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn set_wants_file(&self, file: FileId, node: NodeId, wants: WantsFile) -> Result<u64> {
        self.run(|conn| {
            let changed = conn.execute(
                "UPDATE file_copy SET wants_file = ? WHERE file_id = ? AND node_id = ?",
                params![code(wants.code()), file.0, node.0],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn create_request(
        &self,
        file: FileId,
        node_from: NodeId,
        group_to: GroupId,
        nice: i32,
    ) -> Result<FileCopyRequest> {
        self.run(|conn| {
            if !exists(conn, "archive_file", file.0)? {
                return Err(CatalogError::not_found("file", file));
            }
            if !exists(conn, "storage_node", node_from.0)? {
                return Err(CatalogError::not_found("node", node_from));
            }
            let timestamp = Utc::now();
            let id: i64 = conn.query_row(
                "INSERT INTO copy_request (file_id, node_from, group_to, nice, completed, \
                 cancelled, n_requests, timestamp) \
                 VALUES (?, ?, ?, ?, false, false, 1, ?) RETURNING id",
                params![
                    file.0,
                    node_from.0,
                    group_to.0,
                    nice,
                    timestamp.timestamp_micros()
                ],
                |row| row.get(0),
            )?;
            Ok(FileCopyRequest {
                id: RequestId(id),
                file_id: file,
                node_from,
                group_to,
                nice,
                completed: false,
                cancelled: false,
                n_requests: 1,
                timestamp,
            })
        })
        .await
    }

    async fn pending_requests(
        &self,
        group: GroupId,
        origin: RequestOrigin,
    ) -> Result<Vec<FileCopyRequest>> {
        let source = match origin {
            RequestOrigin::Any => "",
            RequestOrigin::Disk => "AND n.storage_type <> 'H'",
            RequestOrigin::Tape => "AND n.storage_type = 'H'",
        };
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM copy_request r \
                     JOIN storage_node n ON n.id = r.node_from \
                     WHERE r.group_to = ? AND NOT r.completed AND NOT r.cancelled {source} \
                     ORDER BY r.file_id, r.id"
                ),
                params![group.0],
                request_from_row,
            )
        })
        .await
    }

    async fn complete_requests(&self, file: FileId, group: GroupId) -> Result<u64> {
        self.run(|conn| complete_requests(conn, file, group)).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        let guard = self.conn.clone().lock_owned().await;
        guard.execute_batch("BEGIN TRANSACTION")?;
        Ok(Box::new(DuckTransaction {
            conn: guard,
            finished: false,
        }))
    }
}

struct DuckTransaction {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

#[async_trait]
impl StoreTransaction for DuckTransaction {
    async fn copy(&mut self, file: FileId, node: NodeId) -> Result<Option<FileCopy>> {
        select_copy(&self.conn, file, node)
    }

    async fn save_copy(&mut self, copy: &FileCopy) -> Result<()> {
        update_copy(&self.conn, copy)
    }

    async fn insert_copy(
        &mut self,
        file: FileId,
        node: NodeId,
        has: HasFile,
        wants: WantsFile,
    ) -> Result<FileCopy> {
        insert_copy(&self.conn, file, node, has, wants)
    }

    async fn complete_requests(&mut self, file: FileId, group: GroupId) -> Result<u64> {
        complete_requests(&self.conn, file, group)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| match CatalogError::from(e) {
                CatalogError::DuckDb(e) => CatalogError::Transaction(format!("commit failed: {e}")),
                transient => transient,
            })?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for DuckTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                diagnostics::log_error!("Rollback on drop failed: {error}", error: e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_duckdb(
            "IO Error: Could not set lock on file \"/data/catalog.duckdb\": Conflicting lock is held"
        ));
        assert!(is_transient_duckdb(
            "TransactionContext Error: Catalog write-write conflict on alter with \"file_copy\""
        ));
        assert!(!is_transient_duckdb("Parser Error: syntax error at or near \"SELEC\""));
        assert!(!is_transient_duckdb(
            "Constraint Error: Duplicate key \"file_id: 1, node_id: 2\" violates unique constraint"
        ));
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let store = DuckDbStore::open_in_memory().expect("open");

        let err = store
            .run(|conn| conn.execute_batch("SELEC 1").map_err(CatalogError::from))
            .await
            .err()
            .expect("syntax error");
        assert!(matches!(err, CatalogError::DuckDb(_)));
        assert!(!err.is_transient());

        let err = store
            .run(|conn| {
                conn.execute_batch("COPY (SELECT 1) TO '/nonexistent-tarn-dir/out.csv'")
                    .map_err(CatalogError::from)
            })
            .await
            .err()
            .expect("io error");
        assert!(err.is_transient(), "unexpected {err}");
    }
}
