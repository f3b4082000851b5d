// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Tape archive bridge.
//!
//! Tape is only reachable through batch jobs. Pending requests are bundled
//! into one job script per direction and node, the bundled requests are
//! completed when the script is written, and the job reports per-file
//! results later through marker files (see [`callback`]).

mod bundle;
mod callback;
mod scheduler;
mod script;

pub use bundle::{Bundle, BundleEntry};
pub use callback::{Callback, CallbackKind, CallbackReport};
pub use scheduler::{BatchScheduler, SlurmScheduler, count_pending};
pub use script::{ScriptFile, job_name, render_script};

use crate::config::TapeConfig;
use crate::retry::with_retry;
use crate::{Result, Steward, StewardError};
use catalog::{FileCopyRequest, RequestOrigin, StorageNode};
use diagnostics::{log_error, log_info, log_warn};
use std::path::{Path, PathBuf};

/// Stamp format shared by job names and marker files.
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Disk to tape.
    Push,
    /// Tape to disk.
    Pull,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }

    /// Most requests examined for one bundle.
    #[must_use]
    pub fn limit(self, config: &TapeConfig) -> usize {
        match self {
            Direction::Push => config.push_limit,
            Direction::Pull => config.pull_limit,
        }
    }

    /// Pending scheduler jobs tolerated before a new job is held back.
    #[must_use]
    pub fn queue_threshold(self, config: &TapeConfig) -> usize {
        match self {
            Direction::Push => config.inbound_queue_threshold,
            Direction::Pull => config.outbound_queue_threshold,
        }
    }
}

/// Result of one tape pass on a node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TapeReport {
    /// Why nothing was staged, if nothing was.
    pub skipped: Option<&'static str>,
    /// Files in the staged bundle.
    pub bundled: usize,
    pub bytes: u64,
    /// Requests completed because the destination already had the file.
    pub already_present: usize,
    pub script: Option<PathBuf>,
    pub submitted: bool,
}

impl TapeReport {
    fn skipped(reason: &'static str) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

impl Steward {
    /// Push requests into the tape node `node`'s group onto tape.
    pub async fn tape_inbound(&self, node: &StorageNode) -> Result<TapeReport> {
        let Some(script_dir) = self.config.tape.script_dir.clone() else {
            return Err(StewardError::TapeNotConfigured);
        };
        let requests = self
            .store
            .pending_requests(node.group_id, RequestOrigin::Disk)
            .await?;
        if requests.is_empty() {
            return Ok(TapeReport::skipped("no requests"));
        }
        self.run_bundle(node, requests, Direction::Push, &script_dir)
            .await
    }

    /// Pull requests sourced from tape onto `node`.
    pub async fn tape_outbound(&self, node: &StorageNode) -> Result<TapeReport> {
        if node.nearly_full(self.config.request_headroom_gb) {
            log_info!(
                "Node {node} is nearly full. Skip tape pulls.",
                node: node.name.as_str()
            );
            return Ok(TapeReport::skipped("nearly full"));
        }
        let requests = self
            .store
            .pending_requests(node.group_id, RequestOrigin::Tape)
            .await?;
        if requests.is_empty() {
            return Ok(TapeReport::skipped("no requests"));
        }
        let Some(script_dir) = self.config.tape.script_dir.clone() else {
            log_warn!(
                "Tape pulls pending for {node} but no tape script directory is configured",
                node: node.name.as_str()
            );
            return Ok(TapeReport::skipped("not configured"));
        };
        self.run_bundle(node, requests, Direction::Pull, &script_dir)
            .await
    }

    async fn run_bundle(
        &self,
        node: &StorageNode,
        requests: Vec<FileCopyRequest>,
        direction: Direction,
        script_dir: &Path,
    ) -> Result<TapeReport> {
        let bundle = self.check_and_bundle(node, requests, direction).await?;
        if bundle.is_empty() {
            return Ok(TapeReport {
                already_present: bundle.already_present,
                ..TapeReport::skipped("nothing to bundle")
            });
        }

        let queued = self.scheduler.pending_jobs().await?;
        let threshold = direction.queue_threshold(&self.config.tape);
        if queued > threshold {
            log_info!(
                "Skipping {direction} for {node}: {queued} jobs already queued",
                direction: direction.as_str(),
                node: node.name.as_str(),
                queued: queued
            );
            return Ok(TapeReport {
                already_present: bundle.already_present,
                ..TapeReport::skipped("queue busy")
            });
        }

        let script = self.stage(node, &bundle, direction, script_dir).await?;
        let submitted = match self.scheduler.submit(&script).await {
            Ok(()) => {
                log_info!(
                    "Submitted {direction} job {script} with {count} files",
                    direction: direction.as_str(),
                    script: script.display().to_string(),
                    count: bundle.len()
                );
                true
            }
            Err(e) => {
                log_error!(
                    "Could not submit {script}: {error}",
                    script: script.display().to_string(),
                    error: e.to_string()
                );
                false
            }
        };

        Ok(TapeReport {
            skipped: None,
            bundled: bundle.len(),
            bytes: bundle.total_bytes,
            already_present: bundle.already_present,
            script: Some(script),
            submitted,
        })
    }

    /// Complete the bundled requests and write the job script as one unit.
    /// A failed script write leaves the requests pending.
    async fn stage(
        &self,
        node: &StorageNode,
        bundle: &Bundle,
        direction: Direction,
        script_dir: &Path,
    ) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format(STAMP_FORMAT).to_string();
        let files: Vec<ScriptFile> = bundle
            .entries
            .iter()
            .map(|entry| ScriptFile::new(direction, node, entry, script_dir, &stamp))
            .collect();
        let script = render_script(direction, &self.config.tape, &stamp, &files)?;
        let path = script_dir.join(format!("{}_{}.sh", job_name(direction, &stamp), node.id));

        let store = self.store.as_ref();
        let group = node.group_id;
        let tx = with_retry(&self.config.retry, "tape staging", || async move {
            let mut tx = store.begin().await?;
            for entry in &bundle.entries {
                let _ = tx.complete_requests(entry.file.id, group).await?;
            }
            Ok(tx)
        })
        .await?;

        tokio::fs::create_dir_all(script_dir).await?;
        tokio::fs::write(&path, script).await?;
        tx.commit().await?;
        Ok(path)
    }
}
