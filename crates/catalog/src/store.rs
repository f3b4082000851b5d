// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Store collaborator interface.
//!
//! Single-row reads and filtered updates go straight through [`Store`].
//! Anything that must be atomic with respect to concurrent writers (check
//! then insert of a copy, completing requests together with the copy that
//! satisfies them) runs inside a [`StoreTransaction`], which rolls back when
//! dropped without an explicit commit.

use crate::Result;
use crate::model::{
    Acquisition, AcqId, ArchiveFile, FileCopy, FileCopyRequest, FileId, GroupId, HasFile,
    NewNode, NodeId, StorageGroup, StorageNode, WantsFile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which `wants_file` values make a copy a deletion candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantsFilter {
    /// Only copies explicitly marked `wants_file = no`.
    ExplicitlyUnwanted,
    /// Every copy not marked `wants_file = yes`.
    NotWanted,
}

impl WantsFilter {
    #[must_use]
    pub fn matches(self, wants: WantsFile) -> bool {
        match self {
            WantsFilter::ExplicitlyUnwanted => wants == WantsFile::No,
            WantsFilter::NotWanted => wants != WantsFile::Yes,
        }
    }
}

/// Restriction on the kind of node a request is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Any,
    /// Source is not a tape node.
    Disk,
    /// Source is a tape node.
    Tape,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Nodes and groups

    /// Every node bound to `host`, in id order.
    async fn nodes_on_host(&self, host: &str) -> Result<Vec<StorageNode>>;

    async fn node(&self, id: NodeId) -> Result<Option<StorageNode>>;

    async fn find_node(&self, name: &str) -> Result<Option<StorageNode>>;

    async fn group(&self, id: GroupId) -> Result<Option<StorageGroup>>;

    async fn find_group(&self, name: &str) -> Result<Option<StorageGroup>>;

    async fn create_group(&self, name: &str) -> Result<StorageGroup>;

    async fn create_node(&self, node: NewNode) -> Result<StorageNode>;

    /// Record a free-space measurement without touching other node columns.
    async fn set_free_space(
        &self,
        node: NodeId,
        avail_gb: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    // Acquisitions and files

    async fn acquisition(&self, id: AcqId) -> Result<Option<Acquisition>>;

    async fn find_acquisition(&self, name: &str) -> Result<Option<Acquisition>>;

    /// Fetch the acquisition by name, creating it when absent.
    async fn ensure_acquisition(&self, name: &str) -> Result<Acquisition>;

    async fn file(&self, id: FileId) -> Result<Option<ArchiveFile>>;

    async fn find_file(&self, acq: AcqId, name: &str) -> Result<Option<ArchiveFile>>;

    /// Fetch the file by (acquisition, name), creating it when absent.
    async fn ensure_file(
        &self,
        acq: AcqId,
        name: &str,
        size_b: u64,
        md5sum: &str,
    ) -> Result<ArchiveFile>;

    // Copies

    async fn copy(&self, file: FileId, node: NodeId) -> Result<Option<FileCopy>>;

    /// Every copy row recorded for a node, in file id order.
    async fn copies_on_node(&self, node: NodeId) -> Result<Vec<FileCopy>>;

    /// Copies on `node` in state `has`, up to `limit`, in id order.
    async fn copies_with_state(
        &self,
        node: NodeId,
        has: HasFile,
        limit: usize,
    ) -> Result<Vec<FileCopy>>;

    /// Present copies (`has_file = yes`) on `node` whose `wants_file`
    /// matches `filter`, ordered by ascending file id, up to `limit`.
    async fn reclaim_candidates(
        &self,
        node: NodeId,
        filter: WantsFilter,
        limit: usize,
    ) -> Result<Vec<FileCopy>>;

    /// Number of verified copies of `file` on archive nodes other than
    /// `excluding`.
    async fn archive_copies_elsewhere(&self, file: FileId, excluding: NodeId) -> Result<u64>;

    /// Total size of verified copies on `node`, in bytes.
    async fn archived_bytes(&self, node: NodeId) -> Result<u64>;

    async fn set_has_file(&self, file: FileId, node: NodeId, has: HasFile) -> Result<u64>;

    async fn set_wants_file(&self, file: FileId, node: NodeId, wants: WantsFile) -> Result<u64>;

    // Requests

    async fn create_request(
        &self,
        file: FileId,
        node_from: NodeId,
        group_to: GroupId,
        nice: i32,
    ) -> Result<FileCopyRequest>;

    /// Requests into `group` that are neither completed nor cancelled,
    /// restricted by source kind, ordered by file id then request id.
    async fn pending_requests(
        &self,
        group: GroupId,
        origin: RequestOrigin,
    ) -> Result<Vec<FileCopyRequest>>;

    /// Mark every open request for `file` into `group` completed. Returns
    /// the number of rows changed.
    async fn complete_requests(&self, file: FileId, group: GroupId) -> Result<u64>;

    // Transactions

    async fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;
}

/// Scoped write access to the store. Dropping without [`commit`] rolls back.
///
/// [`commit`]: StoreTransaction::commit
#[async_trait]
pub trait StoreTransaction: Send {
    async fn copy(&mut self, file: FileId, node: NodeId) -> Result<Option<FileCopy>>;

    /// Persist the state columns of an existing copy.
    async fn save_copy(&mut self, copy: &FileCopy) -> Result<()>;

    /// Insert a new copy. Fails with `Duplicate` if (file, node) exists.
    async fn insert_copy(
        &mut self,
        file: FileId,
        node: NodeId,
        has: HasFile,
        wants: WantsFile,
    ) -> Result<FileCopy>;

    async fn complete_requests(&mut self, file: FileId, group: GroupId) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Update the (file, node) copy if it exists, otherwise insert it.
pub async fn upsert_copy<T>(
    tx: &mut T,
    file: FileId,
    node: NodeId,
    has: HasFile,
    wants: WantsFile,
) -> Result<FileCopy>
where
    T: StoreTransaction + ?Sized,
{
    match tx.copy(file, node).await? {
        Some(mut existing) => {
            existing.has_file = has;
            existing.wants_file = wants;
            tx.save_copy(&existing).await?;
            Ok(existing)
        }
        None => tx.insert_copy(file, node, has, wants).await,
    }
}
