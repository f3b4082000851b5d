// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Steward - reconciles the storage nodes of one host against the catalog
//!
//! Each cycle the steward walks the nodes bound to its host and, per node,
//! refreshes free space, re-verifies suspect copies, deletes unwanted copies,
//! pulls requested files in with the best available copy tool, and batches
//! tape transfers into scheduler jobs whose completion arrives later as
//! callback marker files.
//!
//! All bookkeeping goes through the [`catalog::Store`] trait. Copy tools,
//! free-space probes and the batch scheduler are trait objects so they can be
//! replaced in tests.

use catalog::{Acquisition, ArchiveFile, CatalogError, FileId, Store};
use std::sync::Arc;
use thiserror::Error;

mod checksum;
pub mod command;
pub mod config;
mod context;
pub mod free_space;
pub mod import;
mod integrity;
mod orchestrator;
mod reclaim;
mod requests;
mod retry;
pub mod tape;
pub mod transfer;
mod verify;

pub use checksum::{is_md5_hash, md5sum_file};
pub use config::{StewardConfig, load_config};
pub use context::CycleContext;
pub use free_space::{ConfiguredProbe, FreeSpaceProbe};
pub use import::{ExtractorRegistry, ImportOutcome, Importer, KeywordMap, MetadataExtractor};
pub use integrity::IntegrityReport;
pub use orchestrator::{CycleReport, NodeOutcome};
pub use reclaim::ReclaimReport;
pub use requests::{RequestOutcome, RequestReport, SkipReason};
pub use retry::with_retry;
pub use tape::{BatchScheduler, Callback, CallbackKind, CallbackReport, SlurmScheduler, TapeReport};
pub use transfer::{TransferExecutor, TransferOutcome, TransferStrategy};
pub use verify::{VerifyOptions, VerifyProblem, VerifyReport};

pub type Result<T> = std::result::Result<T, StewardError>;

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("{kind} not found: {what}")]
    NotFound { kind: &'static str, what: String },

    #[error(
        "Tape transfers need a script directory: set {} or tape.script_dir",
        config::TAPE_SCRIPT_DIR_ENV
    )]
    TapeNotConfigured,

    #[error("Command {program} failed: {message}")]
    Command { program: String, message: String },

    #[error("Free space probe failed for {node}: {message}")]
    FreeSpace { node: String, message: String },
}

impl StewardError {
    pub fn not_found(kind: &'static str, what: impl ToString) -> Self {
        StewardError::NotFound {
            kind,
            what: what.to_string(),
        }
    }
}

/// The reconciliation engine for one host.
pub struct Steward {
    store: Arc<dyn Store>,
    config: StewardConfig,
    transfers: TransferExecutor,
    scheduler: Arc<dyn BatchScheduler>,
    free_space: Arc<dyn FreeSpaceProbe>,
}

impl Steward {
    /// An engine using the system copy tools, statvfs/quota probes and Slurm.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: StewardConfig) -> Self {
        let transfers = TransferExecutor::system(&config.transfer);
        let scheduler = Arc::new(SlurmScheduler::from_config(&config.tape));
        let free_space = Arc::new(ConfiguredProbe::new(&config));
        Self {
            store,
            config,
            transfers,
            scheduler,
            free_space,
        }
    }

    #[must_use]
    pub fn with_transfers(mut self, transfers: TransferExecutor) -> Self {
        self.transfers = transfers;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn BatchScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn with_free_space(mut self, probe: Arc<dyn FreeSpaceProbe>) -> Self {
        self.free_space = probe;
        self
    }

    #[must_use]
    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Look up a file together with its acquisition. `None` when either row
    /// is gone.
    pub(crate) async fn file_with_acq(
        &self,
        file: FileId,
    ) -> Result<Option<(ArchiveFile, Acquisition)>> {
        let Some(file) = self.store.file(file).await? else {
            return Ok(None);
        };
        let Some(acq) = self.store.acquisition(file.acq_id).await? else {
            return Ok(None);
        };
        Ok(Some((file, acq)))
    }
}
