// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Pulling requested files onto a node.

use crate::context::CycleContext;
use crate::retry::with_retry;
use crate::transfer::{Blame, Route, TransferJob, TransferOutcome};
use crate::{Result, Steward};
use catalog::{
    ArchiveFile, FileCopyRequest, FileId, GIB, GroupId, HasFile, NodeId, RequestOrigin, StorageNode,
    WantsFile, upsert_copy,
};
use diagnostics::{log_debug, log_error, log_info, log_warn};
use std::time::Instant;

/// What happened to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Copied and verified; matching requests completed.
    Transferred,
    /// The destination already held a verified copy; requests completed.
    AlreadyPresent,
    /// Left pending for a later cycle.
    Skipped(SkipReason),
    /// The copy tool failed.
    TransferFailed { source_suspect: bool },
    /// The copy arrived with the wrong hash and was removed.
    HashMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SourceUnknown,
    SourceInactive,
    RemoteTransport,
    SourceMissing,
    InsufficientSpace,
    FileUnknown,
}

/// Summary of one pass over a node's requests.
#[derive(Debug, Default, Clone)]
pub struct RequestReport {
    /// Why the whole pass was skipped, if it was.
    pub not_started: Option<&'static str>,
    pub outcomes: Vec<(FileCopyRequest, RequestOutcome)>,
    /// Requests left unexamined when the time budget ran out.
    pub deferred: usize,
}

impl RequestReport {
    fn not_started(reason: &'static str) -> Self {
        Self {
            not_started: Some(reason),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn count(&self, outcome: RequestOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

impl Steward {
    /// Process requests into `node`'s group whose source is not a tape node,
    /// in ascending file id order.
    pub async fn process_requests(
        &self,
        node: &StorageNode,
        ctx: &mut CycleContext,
    ) -> Result<RequestReport> {
        if node.is_tape() {
            log_error!("Cannot process tape node {node} here", node: node.name.as_str());
            return Ok(RequestReport::not_started("tape node"));
        }
        if node.nearly_full(self.config.request_headroom_gb) {
            log_info!("Node {node} is nearly full. Skip transfers.", node: node.name.as_str());
            return Ok(RequestReport::not_started("nearly full"));
        }
        if node.max_total_gb > 0.0 {
            let current_gb = self.store.archived_bytes(node.id).await? as f64 / GIB;
            if current_gb > node.max_total_gb {
                log_info!(
                    "Node {node} has reached maximum size (current: {current_gb} GB, limit: {limit} GB)",
                    node: node.name.as_str(),
                    current_gb: format!("{current_gb:.1}"),
                    limit: format!("{:.1}", node.max_total_gb)
                );
                return Ok(RequestReport::not_started("maximum size"));
            }
        }
        if node.is_transport() && ctx.transport_done() {
            log_info!("Ignoring transport node {node}", node: node.name.as_str());
            return Ok(RequestReport::not_started("transport done"));
        }

        let requests = self
            .store
            .pending_requests(node.group_id, RequestOrigin::Disk)
            .await?;

        let mut node = node.clone();
        let mut report = RequestReport::default();
        let started = Instant::now();
        let total = requests.len();
        for (index, req) in requests.into_iter().enumerate() {
            if started.elapsed() > self.config.node_budget() {
                report.deferred = total - index;
                log_info!(
                    "Time budget spent on {node}, deferring {deferred} requests",
                    node: node.name.as_str(),
                    deferred: report.deferred
                );
                break;
            }
            match self.handle_request(&mut node, &req, ctx).await {
                Ok(outcome) => report.outcomes.push((req, outcome)),
                Err(e) => log_error!(
                    "Request {request} onto {node} failed: {error}",
                    request: req.id.0,
                    node: node.name.as_str(),
                    error: e.to_string()
                ),
            }
        }
        Ok(report)
    }

    async fn handle_request(
        &self,
        node: &mut StorageNode,
        req: &FileCopyRequest,
        ctx: &mut CycleContext,
    ) -> Result<RequestOutcome> {
        let Some(source) = self.store.node(req.node_from).await? else {
            log_warn!("Request {request} names an unknown source node", request: req.id.0);
            return Ok(RequestOutcome::Skipped(SkipReason::SourceUnknown));
        };
        if !source.active {
            return Ok(RequestOutcome::Skipped(SkipReason::SourceInactive));
        }
        let Some((file, acq)) = self.file_with_acq(req.file_id).await? else {
            log_warn!("Request {request} names an unknown file", request: req.id.0);
            return Ok(RequestOutcome::Skipped(SkipReason::FileUnknown));
        };
        let shortname = format!("{}/{}", acq.name, file.name);

        if node.is_transport() && node.host != source.host {
            log_debug!(
                "Skipping request for {shortname} from remote node {source} onto local transport disks",
                source: source.name.as_str(),
                shortname: shortname.as_str()
            );
            return Ok(RequestOutcome::Skipped(SkipReason::RemoteTransport));
        }

        if self.has_verified_copy(file.id, node.id).await? {
            log_info!(
                "Skipping request for {shortname} since it already exists on {node}; marking it completed",
                node: node.name.as_str(),
                shortname: shortname.as_str()
            );
            let _ = self.store.complete_requests(file.id, node.group_id).await?;
            return Ok(RequestOutcome::AlreadyPresent);
        }

        if !self.has_verified_copy(file.id, source.id).await? {
            log_error!(
                "Skipping request for {shortname} since it is not available on {source} [file_id={file_id}]",
                source: source.name.as_str(),
                file_id: file.id.0,
                shortname: shortname.as_str()
            );
            return Ok(RequestOutcome::Skipped(SkipReason::SourceMissing));
        }

        if node.avail() * GIB < 2.0 * file.size_b as f64 {
            log_warn!(
                "Node {node} is full: not adding {shortname}",
                node: node.name.as_str(),
                shortname: shortname.as_str()
            );
            return Ok(RequestOutcome::Skipped(SkipReason::InsufficientSpace));
        }

        let source_path = source.copy_path(&acq.name, &file.name);
        let route = if source.host == node.host {
            Route::Local
        } else {
            Route::Remote
        };
        let job = TransferJob {
            source: match route {
                Route::Local => source_path.to_string_lossy().into_owned(),
                Route::Remote => source.remote_spec(&source_path),
            },
            dest_dir: node.acq_dir(&acq.name),
            dest_path: node.copy_path(&acq.name, &file.name),
            md5sum: file.md5sum.clone(),
        };
        if !tokio::fs::try_exists(&job.dest_dir).await? {
            log_info!(
                "Creating directory {dir}",
                dir: job.dest_dir.display().to_string()
            );
            tokio::fs::create_dir_all(&job.dest_dir).await?;
        }

        log_info!(
            "Transferring file {shortname}",
            shortname: shortname.as_str()
        );
        let started = Instant::now();
        let md5sum = match self.transfers.transfer(route, &job).await {
            TransferOutcome::Success { md5sum } => md5sum,
            TransferOutcome::Failed {
                diagnostic, blame, ..
            } => {
                let source_suspect = blame == Blame::Source;
                if source_suspect {
                    log_error!(
                        "Copy failed: {diagnostic}. Marking source file suspect.",
                        diagnostic: diagnostic.as_str()
                    );
                    self.mark_suspect(file.id, source.id).await?;
                } else {
                    log_error!(
                        "Copy failed: {diagnostic}",
                        diagnostic: diagnostic.as_str()
                    );
                }
                return Ok(RequestOutcome::TransferFailed { source_suspect });
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        if md5sum != file.md5sum {
            log_error!(
                "Error with md5sum check: {expected} on node {source}, but {actual} on node {node}",
                expected: file.md5sum.as_str(),
                source: source.name.as_str(),
                actual: md5sum.as_str(),
                node: node.name.as_str()
            );
            log_error!(
                "Removing file {path}",
                path: job.dest_path.display().to_string()
            );
            if let Err(e) = tokio::fs::remove_file(&job.dest_path).await {
                log_error!("Could not remove file: {error}", error: e.to_string());
            }
            log_error!("Marking source file suspect.");
            self.mark_suspect(file.id, source.id).await?;
            return Ok(RequestOutcome::HashMismatch);
        }

        let size_mb = file.size_b as f64 / 1_048_576.0;
        log_info!(
            "Pull complete (md5sum correct). Transferred {size_mb} MB in {seconds} seconds [{rate} MB/s]",
            size_mb: format!("{size_mb:.1}"),
            seconds: elapsed as u64,
            rate: format!("{:.1}", size_mb / elapsed.max(f64::EPSILON))
        );

        let completed = self.record_verified_copy(&file, node.id, node.group_id).await?;
        log_debug!(
            "Completed {completed} requests for {shortname}",
            completed: completed,
            shortname: shortname.as_str()
        );

        if node.is_transport() {
            ctx.mark_transport_done();
        }

        match self.refresh_free_space(node).await {
            Ok(avail_gb) => node.avail_gb = Some(avail_gb),
            Err(e) => log_warn!(
                "Could not refresh free space on {node}: {error}",
                node: node.name.as_str(),
                error: e.to_string()
            ),
        }
        Ok(RequestOutcome::Transferred)
    }

    pub(crate) async fn has_verified_copy(&self, file: FileId, node: NodeId) -> Result<bool> {
        Ok(self
            .store
            .copy(file, node)
            .await?
            .is_some_and(|copy| copy.has_file == HasFile::Yes))
    }

    async fn mark_suspect(&self, file: FileId, node: NodeId) -> Result<()> {
        let _ = self
            .store
            .set_has_file(file, node, HasFile::MaybeCorrupt)
            .await?;
        Ok(())
    }

    /// Upsert the destination copy as present and wanted and complete every
    /// open request for the file into `group`, in one transaction. Returns
    /// the number of requests completed.
    pub(crate) async fn record_verified_copy(
        &self,
        file: &ArchiveFile,
        node: NodeId,
        group: GroupId,
    ) -> Result<u64> {
        let store = self.store.as_ref();
        let file_id = file.id;
        let completed = with_retry(&self.config.retry, "copy bookkeeping", || async move {
            let mut tx = store.begin().await?;
            let _ = upsert_copy(tx.as_mut(), file_id, node, HasFile::Yes, WantsFile::Yes).await?;
            let completed = tx.complete_requests(file_id, group).await?;
            tx.commit().await?;
            Ok(completed)
        })
        .await?;
        Ok(completed)
    }
}
