// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory store for tests and tools.
//!
//! All rows live behind one async mutex. A transaction holds the mutex for
//! its whole lifetime and keeps a snapshot taken at `begin`, restored on
//! rollback or drop.

use crate::model::{
    AcqId, Acquisition, ArchiveFile, CopyId, FileCopy, FileCopyRequest, FileId, GroupId,
    HasFile, NewNode, NodeId, RequestId, StorageGroup, StorageKind, StorageNode, WantsFile,
};
use crate::store::{RequestOrigin, Store, StoreTransaction, WantsFilter};
use crate::{CatalogError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    groups: BTreeMap<GroupId, StorageGroup>,
    nodes: BTreeMap<NodeId, StorageNode>,
    acqs: BTreeMap<AcqId, Acquisition>,
    files: BTreeMap<FileId, ArchiveFile>,
    copies: BTreeMap<CopyId, FileCopy>,
    requests: BTreeMap<RequestId, FileCopyRequest>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn copy(&self, file: FileId, node: NodeId) -> Option<FileCopy> {
        self.copies
            .values()
            .find(|c| c.file_id == file && c.node_id == node)
            .cloned()
    }

    fn save_copy(&mut self, copy: &FileCopy) -> Result<()> {
        match self.copies.get_mut(&copy.id) {
            Some(row) => {
                row.has_file = copy.has_file;
                row.wants_file = copy.wants_file;
                Ok(())
            }
            None => Err(CatalogError::not_found("file copy", copy.id)),
        }
    }

    fn insert_copy(
        &mut self,
        file: FileId,
        node: NodeId,
        has: HasFile,
        wants: WantsFile,
    ) -> Result<FileCopy> {
        if self.copy(file, node).is_some() {
            return Err(CatalogError::duplicate(
                "file copy",
                format!("file {file} on node {node}"),
            ));
        }
        let copy = FileCopy {
            id: CopyId(self.next_id()),
            file_id: file,
            node_id: node,
            has_file: has,
            wants_file: wants,
        };
        _ = self.copies.insert(copy.id, copy.clone());
        Ok(copy)
    }

    fn complete_requests(&mut self, file: FileId, group: GroupId) -> u64 {
        let mut changed = 0;
        for req in self.requests.values_mut() {
            if req.file_id == file && req.group_to == group && !req.completed {
                req.completed = true;
                changed += 1;
            }
        }
        changed
    }

    fn node_kind(&self, node: NodeId) -> Option<StorageKind> {
        self.nodes.get(&node).map(|n| n.kind)
    }
}

/// In-memory [`Store`]. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    transient_failures: Arc<AtomicUsize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `begin` fail with a lost connection.
    pub fn fail_next_begins(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Apply `f` to a stored node.
    pub async fn update_node<F>(&self, id: NodeId, f: F) -> Result<StorageNode>
    where
        F: FnOnce(&mut StorageNode),
    {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| CatalogError::not_found("node", id))?;
        f(node);
        Ok(node.clone())
    }

    /// Apply `f` to a stored request.
    pub async fn update_request<F>(&self, id: RequestId, f: F) -> Result<FileCopyRequest>
    where
        F: FnOnce(&mut FileCopyRequest),
    {
        let mut state = self.state.lock().await;
        let req = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| CatalogError::not_found("request", id))?;
        f(req);
        Ok(req.clone())
    }

    /// Insert a copy row outside any transaction.
    pub async fn add_copy(
        &self,
        file: FileId,
        node: NodeId,
        has: HasFile,
        wants: WantsFile,
    ) -> Result<FileCopy> {
        self.state.lock().await.insert_copy(file, node, has, wants)
    }

    /// Every copy row, in id order.
    pub async fn all_copies(&self) -> Vec<FileCopy> {
        self.state.lock().await.copies.values().cloned().collect()
    }

    /// Every request row, in id order.
    pub async fn all_requests(&self) -> Vec<FileCopyRequest> {
        self.state.lock().await.requests.values().cloned().collect()
    }

    pub async fn request(&self, id: RequestId) -> Option<FileCopyRequest> {
        self.state.lock().await.requests.get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn nodes_on_host(&self, host: &str) -> Result<Vec<StorageNode>> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .values()
            .filter(|n| n.host == host)
            .cloned()
            .collect())
    }

    async fn node(&self, id: NodeId) -> Result<Option<StorageNode>> {
        Ok(self.state.lock().await.nodes.get(&id).cloned())
    }

    async fn find_node(&self, name: &str) -> Result<Option<StorageNode>> {
        let state = self.state.lock().await;
        Ok(state.nodes.values().find(|n| n.name == name).cloned())
    }

    async fn group(&self, id: GroupId) -> Result<Option<StorageGroup>> {
        Ok(self.state.lock().await.groups.get(&id).cloned())
    }

    async fn find_group(&self, name: &str) -> Result<Option<StorageGroup>> {
        let state = self.state.lock().await;
        Ok(state.groups.values().find(|g| g.name == name).cloned())
    }

    async fn create_group(&self, name: &str) -> Result<StorageGroup> {
        let mut state = self.state.lock().await;
        if state.groups.values().any(|g| g.name == name) {
            return Err(CatalogError::duplicate("group", name));
        }
        let group = StorageGroup {
            id: GroupId(state.next_id()),
            name: name.to_string(),
        };
        _ = state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn create_node(&self, node: NewNode) -> Result<StorageNode> {
        let mut state = self.state.lock().await;
        if state.nodes.values().any(|n| n.name == node.name) {
            return Err(CatalogError::duplicate("node", &node.name));
        }
        if !state.groups.contains_key(&node.group_id) {
            return Err(CatalogError::not_found("group", node.group_id));
        }
        let node = node.into_node(NodeId(state.next_id()));
        _ = state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn set_free_space(
        &self,
        node: NodeId,
        avail_gb: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .nodes
            .get_mut(&node)
            .ok_or_else(|| CatalogError::not_found("node", node))?;
        row.avail_gb = Some(avail_gb);
        row.avail_gb_last_checked = Some(checked_at);
        Ok(())
    }

    async fn acquisition(&self, id: AcqId) -> Result<Option<Acquisition>> {
        Ok(self.state.lock().await.acqs.get(&id).cloned())
    }

    async fn find_acquisition(&self, name: &str) -> Result<Option<Acquisition>> {
        let state = self.state.lock().await;
        Ok(state.acqs.values().find(|a| a.name == name).cloned())
    }

    async fn ensure_acquisition(&self, name: &str) -> Result<Acquisition> {
        let mut state = self.state.lock().await;
        if let Some(acq) = state.acqs.values().find(|a| a.name == name) {
            return Ok(acq.clone());
        }
        let acq = Acquisition {
            id: AcqId(state.next_id()),
            name: name.to_string(),
        };
        _ = state.acqs.insert(acq.id, acq.clone());
        Ok(acq)
    }

    async fn file(&self, id: FileId) -> Result<Option<ArchiveFile>> {
        Ok(self.state.lock().await.files.get(&id).cloned())
    }

    async fn find_file(&self, acq: AcqId, name: &str) -> Result<Option<ArchiveFile>> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .find(|f| f.acq_id == acq && f.name == name)
            .cloned())
    }

    async fn ensure_file(
        &self,
        acq: AcqId,
        name: &str,
        size_b: u64,
        md5sum: &str,
    ) -> Result<ArchiveFile> {
        let mut state = self.state.lock().await;
        if let Some(file) = state
            .files
            .values()
            .find(|f| f.acq_id == acq && f.name == name)
        {
            return Ok(file.clone());
        }
        if !state.acqs.contains_key(&acq) {
            return Err(CatalogError::not_found("acquisition", acq));
        }
        let file = ArchiveFile {
            id: FileId(state.next_id()),
            acq_id: acq,
            name: name.to_string(),
            size_b,
            md5sum: md5sum.to_string(),
        };
        _ = state.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn copy(&self, file: FileId, node: NodeId) -> Result<Option<FileCopy>> {
        Ok(self.state.lock().await.copy(file, node))
    }

    async fn copies_on_node(&self, node: NodeId) -> Result<Vec<FileCopy>> {
        let state = self.state.lock().await;
        let mut copies: Vec<FileCopy> = state
            .copies
            .values()
            .filter(|c| c.node_id == node)
            .cloned()
            .collect();
        copies.sort_by_key(|c| (c.file_id, c.id));
        Ok(copies)
    }

    async fn copies_with_state(
        &self,
        node: NodeId,
        has: HasFile,
        limit: usize,
    ) -> Result<Vec<FileCopy>> {
        let state = self.state.lock().await;
        Ok(state
            .copies
            .values()
            .filter(|c| c.node_id == node && c.has_file == has)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reclaim_candidates(
        &self,
        node: NodeId,
        filter: WantsFilter,
        limit: usize,
    ) -> Result<Vec<FileCopy>> {
        let state = self.state.lock().await;
        let mut copies: Vec<FileCopy> = state
            .copies
            .values()
            .filter(|c| {
                c.node_id == node && c.has_file == HasFile::Yes && filter.matches(c.wants_file)
            })
            .cloned()
            .collect();
        copies.sort_by_key(|c| (c.file_id, c.id));
        copies.truncate(limit);
        Ok(copies)
    }

    async fn archive_copies_elsewhere(&self, file: FileId, excluding: NodeId) -> Result<u64> {
        let state = self.state.lock().await;
        let count = state
            .copies
            .values()
            .filter(|c| {
                c.file_id == file
                    && c.node_id != excluding
                    && c.has_file == HasFile::Yes
                    && state.node_kind(c.node_id) == Some(StorageKind::Archive)
            })
            .count();
        Ok(count as u64)
    }

    async fn archived_bytes(&self, node: NodeId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .copies
            .values()
            .filter(|c| c.node_id == node && c.has_file == HasFile::Yes)
            .filter_map(|c| state.files.get(&c.file_id))
            .map(|f| f.size_b)
            .sum())
    }

    async fn set_has_file(&self, file: FileId, node: NodeId, has: HasFile) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for copy in state.copies.values_mut() {
            if copy.file_id == file && copy.node_id == node {
                copy.has_file = has;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn set_wants_file(&self, file: FileId, node: NodeId, wants: WantsFile) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for copy in state.copies.values_mut() {
            if copy.file_id == file && copy.node_id == node {
                copy.wants_file = wants;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn create_request(
        &self,
        file: FileId,
        node_from: NodeId,
        group_to: GroupId,
        nice: i32,
    ) -> Result<FileCopyRequest> {
        let mut state = self.state.lock().await;
        if !state.files.contains_key(&file) {
            return Err(CatalogError::not_found("file", file));
        }
        if !state.nodes.contains_key(&node_from) {
            return Err(CatalogError::not_found("node", node_from));
        }
        let req = FileCopyRequest {
            id: RequestId(state.next_id()),
            file_id: file,
            node_from,
            group_to,
            nice,
            completed: false,
            cancelled: false,
            n_requests: 1,
            timestamp: Utc::now(),
        };
        _ = state.requests.insert(req.id, req.clone());
        Ok(req)
    }

    async fn pending_requests(
        &self,
        group: GroupId,
        origin: RequestOrigin,
    ) -> Result<Vec<FileCopyRequest>> {
        let state = self.state.lock().await;
        let mut reqs: Vec<FileCopyRequest> = state
            .requests
            .values()
            .filter(|r| r.group_to == group && !r.completed && !r.cancelled)
            .filter(|r| {
                let tape = state.node_kind(r.node_from) == Some(StorageKind::Tape);
                match origin {
                    RequestOrigin::Any => true,
                    RequestOrigin::Disk => !tape,
                    RequestOrigin::Tape => tape,
                }
            })
            .cloned()
            .collect();
        reqs.sort_by_key(|r| (r.file_id, r.id));
        Ok(reqs)
    }

    async fn complete_requests(&self, file: FileId, group: GroupId) -> Result<u64> {
        Ok(self.state.lock().await.complete_requests(file, group))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CatalogError::ConnectionLost(
                "injected connection failure".to_string(),
            ));
        }

        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    /// Present until the transaction is committed.
    snapshot: Option<State>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn copy(&mut self, file: FileId, node: NodeId) -> Result<Option<FileCopy>> {
        Ok(self.guard.copy(file, node))
    }

    async fn save_copy(&mut self, copy: &FileCopy) -> Result<()> {
        self.guard.save_copy(copy)
    }

    async fn insert_copy(
        &mut self,
        file: FileId,
        node: NodeId,
        has: HasFile,
        wants: WantsFile,
    ) -> Result<FileCopy> {
        self.guard.insert_copy(file, node, has, wants)
    }

    async fn complete_requests(&mut self, file: FileId, group: GroupId) -> Result<u64> {
        Ok(self.guard.complete_requests(file, group))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Drop restores the snapshot.
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}
