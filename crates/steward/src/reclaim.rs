// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Deleting unwanted copies.

use crate::retry::with_retry;
use crate::{Result, Steward, StewardError};
use catalog::{Acquisition, ArchiveFile, HasFile, StorageNode, WantsFile, WantsFilter};
use diagnostics::{log_error, log_info, log_warn};
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: usize,
    /// Candidates kept because too few archive copies exist elsewhere.
    pub too_few_replicas: usize,
    pub failed: usize,
}

impl Steward {
    /// Delete unwanted copies from `node`, at most `reclaim_limit` per call.
    ///
    /// A node below its free-space minimum (archive nodes excepted) gives up
    /// every copy not explicitly wanted; otherwise only copies marked
    /// unwanted go. A copy is only deleted while enough verified archive
    /// copies of the file remain on other nodes.
    pub async fn reclaim_space(&self, node: &StorageNode) -> Result<ReclaimReport> {
        let filter = if node.below_minimum() && !node.is_archive() {
            log_info!(
                "Hit minimum available space on {node}, considering all unwanted files for deletion",
                node: node.name.as_str()
            );
            WantsFilter::NotWanted
        } else {
            WantsFilter::ExplicitlyUnwanted
        };

        let candidates = self
            .store
            .reclaim_candidates(node.id, filter, usize::MAX)
            .await?;

        let mut report = ReclaimReport::default();
        for copy in candidates {
            if report.deleted >= self.config.reclaim_limit {
                break;
            }
            let Some((file, acq)) = self.file_with_acq(copy.file_id).await? else {
                continue;
            };
            let shortname = format!("{}/{}", acq.name, file.name);

            let elsewhere = self
                .store
                .archive_copies_elsewhere(file.id, node.id)
                .await?;
            if elsewhere < self.config.min_archive_copies {
                log_info!(
                    "Too few backups to delete {shortname} ({elsewhere} archive copies elsewhere)",
                    shortname: shortname.as_str(),
                    elsewhere: elsewhere
                );
                report.too_few_replicas += 1;
                continue;
            }

            match self.delete_copy(node, &file, &acq).await {
                Ok(()) => {
                    log_info!(
                        "Removed file copy {shortname} from {node}",
                        node: node.name.as_str(),
                        shortname: shortname.as_str()
                    );
                    report.deleted += 1;
                }
                Err(e) => {
                    log_error!(
                        "Could not remove {shortname} from {node}: {error}",
                        node: node.name.as_str(),
                        error: e.to_string(),
                        shortname: shortname.as_str()
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Remove the file and record the copy as gone, as one unit. The store
    /// change is only committed once the filesystem remove succeeded.
    async fn delete_copy(
        &self,
        node: &StorageNode,
        file: &ArchiveFile,
        acq: &Acquisition,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let mut tx = with_retry(&self.config.retry, "reclaim", || async move {
            store.begin().await
        })
        .await?;

        let path = node.copy_path(&acq.name, &file.name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => remove_dir_if_empty(&node.acq_dir(&acq.name), &node.name).await,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut copy = tx
            .copy(file.id, node.id)
            .await?
            .ok_or_else(|| StewardError::not_found("file copy", format!("{}/{}", acq.name, file.name)))?;
        copy.has_file = HasFile::No;
        copy.wants_file = WantsFile::No;
        tx.save_copy(&copy).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn remove_dir_if_empty(dir: &Path, node: &str) {
    let empty = match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    };
    if !empty {
        return;
    }
    log_info!(
        "Removing acquisition directory {dir} on {node}",
        dir: dir.display().to_string(),
        node: node
    );
    if let Err(e) = tokio::fs::remove_dir(dir).await {
        log_warn!(
            "Could not remove directory {dir}: {error}",
            dir: dir.display().to_string(),
            error: e.to_string()
        );
    }
}
