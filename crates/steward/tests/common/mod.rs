// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Fixtures shared by the steward integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use catalog::{
    ArchiveFile, FileCopyRequest, GroupId, HasFile, MemoryStore, NewNode, StorageKind,
    StorageNode, Store, WantsFile,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use steward::config::RetryConfig;
use steward::transfer::{Blame, TransferExecutor, TransferJob, TransferOutcome, TransferStrategy};
use steward::{BatchScheduler, FreeSpaceProbe, Steward, StewardConfig};
use tempfile::TempDir;

pub const HOST: &str = "host1";
pub const ACQ: &str = "20170101T000000Z_chime_corr";

/// Configuration for tests: no retry delay, tape scripts under `script_dir`.
pub fn test_config(script_dir: Option<PathBuf>) -> StewardConfig {
    let mut config = StewardConfig {
        host: HOST.to_string(),
        retry: RetryConfig {
            delay_ms: 0,
            max_attempts: 3,
        },
        ..StewardConfig::default()
    };
    config.tape.script_dir = script_dir;
    config
}

/// Reports the same free space for every node.
pub struct FixedProbe(pub f64);

#[async_trait]
impl FreeSpaceProbe for FixedProbe {
    async fn available_gb(&self, _node: &StorageNode) -> steward::Result<f64> {
        Ok(self.0)
    }
}

/// Always fails, as an unreachable mount would.
pub struct FailingProbe;

#[async_trait]
impl FreeSpaceProbe for FailingProbe {
    async fn available_gb(&self, node: &StorageNode) -> steward::Result<f64> {
        Err(steward::StewardError::FreeSpace {
            node: node.name.clone(),
            message: "mount unreachable".to_string(),
        })
    }
}

/// Scheduler with a fixed queue length that records submissions.
#[derive(Default)]
pub struct FakeScheduler {
    pub pending: AtomicUsize,
    pub submitted: Mutex<Vec<PathBuf>>,
}

impl FakeScheduler {
    pub fn with_pending(pending: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(pending),
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub fn submissions(&self) -> Vec<PathBuf> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BatchScheduler for FakeScheduler {
    async fn pending_jobs(&self) -> steward::Result<usize> {
        Ok(self.pending.load(Ordering::SeqCst))
    }

    async fn submit(&self, script: &Path) -> steward::Result<()> {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(script.to_path_buf());
        }
        Ok(())
    }
}

/// What a [`FakeCopy`] does with each job.
#[derive(Debug, Clone)]
pub enum CopyBehavior {
    /// Copy the bytes and report their real hash.
    Copy,
    /// Write `bytes` to the destination instead and report their hash.
    Corrupt(Vec<u8>),
    /// Fail without touching the destination.
    Fail(Blame),
}

/// Copy tool that works on local paths only.
pub struct FakeCopy {
    pub behavior: CopyBehavior,
    pub calls: AtomicUsize,
}

impl FakeCopy {
    pub fn new(behavior: CopyBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferStrategy for FakeCopy {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, job: &TransferJob) -> TransferOutcome {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.behavior {
            CopyBehavior::Copy => std::fs::copy(&job.source, &job.dest_path).map(|_| ()),
            CopyBehavior::Corrupt(bytes) => std::fs::write(&job.dest_path, bytes),
            CopyBehavior::Fail(blame) => {
                return TransferOutcome::Failed {
                    diagnostic: "simulated failure".to_string(),
                    blame: *blame,
                    fallback: false,
                };
            }
        };
        if let Err(e) = result {
            return TransferOutcome::Failed {
                diagnostic: e.to_string(),
                blame: Blame::Destination,
                fallback: false,
            };
        }
        match steward::md5sum_file(&job.dest_path).await {
            Ok(md5sum) => TransferOutcome::Success { md5sum },
            Err(e) => TransferOutcome::Failed {
                diagnostic: e.to_string(),
                blame: Blame::Destination,
                fallback: false,
            },
        }
    }
}

/// Executor routing both local and remote jobs through `strategy`.
pub fn executor(strategy: Arc<FakeCopy>) -> TransferExecutor {
    let strategy: Arc<dyn TransferStrategy> = strategy;
    TransferExecutor::new(vec![strategy.clone()], vec![strategy])
}

/// A temporary fleet: one store plus a scratch directory for node roots.
pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn group(&self, name: &str) -> GroupId {
        self.store.create_group(name).await.expect("group").id
    }

    /// Active node with plenty of space, rooted under the scratch dir.
    pub async fn node(
        &self,
        name: &str,
        group: GroupId,
        host: &str,
        kind: StorageKind,
    ) -> StorageNode {
        let root = self.path(name);
        std::fs::create_dir_all(&root).expect("node root");
        self.store
            .create_node(NewNode {
                avail_gb: Some(1000.0),
                ..NewNode::new(name, group, host, root, kind)
            })
            .await
            .expect("node")
    }

    /// Register a catalog file of `size_b` bytes without writing anything.
    pub async fn catalog_file(&self, name: &str, size_b: u64) -> ArchiveFile {
        let acq = self.store.ensure_acquisition(ACQ).await.expect("acq");
        self.store
            .ensure_file(acq.id, name, size_b, "d41d8cd98f00b204e9800998ecf8427e")
            .await
            .expect("file")
    }

    /// Write `contents` as `name` under `node` and register the file.
    pub async fn file_on(&self, node: &StorageNode, name: &str, contents: &[u8]) -> ArchiveFile {
        let path = node.copy_path(ACQ, name);
        std::fs::create_dir_all(node.acq_dir(ACQ)).expect("acq dir");
        std::fs::write(&path, contents).expect("write");
        let md5sum = steward::md5sum_file(&path).await.expect("md5");
        let acq = self.store.ensure_acquisition(ACQ).await.expect("acq");
        let file = self
            .store
            .ensure_file(acq.id, name, contents.len() as u64, &md5sum)
            .await
            .expect("file");
        let _ = self
            .store
            .add_copy(file.id, node.id, HasFile::Yes, WantsFile::Yes)
            .await
            .expect("copy");
        file
    }

    /// Record a copy without touching the filesystem.
    pub async fn copy(&self, file: &ArchiveFile, node: &StorageNode, has: HasFile, wants: WantsFile) {
        let _ = self
            .store
            .add_copy(file.id, node.id, has, wants)
            .await
            .expect("copy");
    }

    pub async fn request(
        &self,
        file: &ArchiveFile,
        from: &StorageNode,
        to: GroupId,
    ) -> FileCopyRequest {
        self.store
            .create_request(file.id, from.id, to, 0)
            .await
            .expect("request")
    }

    pub async fn has_file(&self, file: &ArchiveFile, node: &StorageNode) -> Option<HasFile> {
        self.store
            .copy(file.id, node.id)
            .await
            .expect("copy")
            .map(|c| c.has_file)
    }

    pub async fn completed(&self, req: &FileCopyRequest) -> bool {
        self.store
            .request(req.id)
            .await
            .is_some_and(|r| r.completed)
    }

    /// A steward over this fleet with fixed free space and a fake scheduler.
    pub fn steward(&self, config: StewardConfig, transfers: TransferExecutor) -> Steward {
        Steward::new(self.store.clone(), config)
            .with_transfers(transfers)
            .with_free_space(Arc::new(FixedProbe(1000.0)))
            .with_scheduler(FakeScheduler::with_pending(0))
    }
}
