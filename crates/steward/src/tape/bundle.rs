// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Choosing which pending requests go into one tape job.

use super::Direction;
use crate::{Result, Steward};
use catalog::{Acquisition, ArchiveFile, FileCopyRequest, FileId, StorageNode};
use diagnostics::{log_debug, log_info, log_warn};
use std::collections::HashSet;

/// One file in a bundle.
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub request: FileCopyRequest,
    pub file: ArchiveFile,
    pub acq: Acquisition,
    pub source: StorageNode,
}

impl BundleEntry {
    #[must_use]
    pub fn shortname(&self) -> String {
        format!("{}/{}", self.acq.name, self.file.name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Bundle {
    pub entries: Vec<BundleEntry>,
    pub total_bytes: u64,
    /// Requests found already satisfied and completed while bundling.
    pub already_present: usize,
}

impl Bundle {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Steward {
    /// Walk at most the direction's request limit of `requests` (ordered by
    /// file id) and collect the transferable ones, stopping before the bundle
    /// would reach the size ceiling. `node` is the destination.
    pub(crate) async fn check_and_bundle(
        &self,
        node: &StorageNode,
        requests: Vec<FileCopyRequest>,
        direction: Direction,
    ) -> Result<Bundle> {
        let tape = &self.config.tape;
        let ceiling = tape.bundle_max_bytes();
        let dest_group = self.store.group(node.group_id).await?;
        let into_online = direction == Direction::Push
            && dest_group.is_some_and(|g| g.name == tape.online_group);

        let mut bundle = Bundle::default();
        let mut seen: HashSet<FileId> = HashSet::new();

        for req in requests.into_iter().take(direction.limit(tape)) {
            let Some(source) = self.store.node(req.node_from).await? else {
                log_warn!("Request {request} names an unknown source node", request: req.id.0);
                continue;
            };
            if source.host != node.host {
                log_debug!(
                    "Skipping request {request}: source {source} is not on {host}",
                    request: req.id.0,
                    source: source.name.as_str(),
                    host: node.host.as_str()
                );
                continue;
            }
            let Some((file, acq)) = self.file_with_acq(req.file_id).await? else {
                log_warn!("Request {request} names an unknown file", request: req.id.0);
                continue;
            };
            let shortname = format!("{}/{}", acq.name, file.name);
            if !seen.insert(file.id) {
                continue;
            }

            if self.has_verified_copy(file.id, node.id).await? {
                log_info!(
                    "Skipping request for {shortname} since it already exists on {node}; marking it completed",
                    node: node.name.as_str(),
                    shortname: shortname.as_str()
                );
                let _ = self.store.complete_requests(file.id, node.group_id).await?;
                bundle.already_present += 1;
                continue;
            }

            if !self.has_verified_copy(file.id, source.id).await? {
                log_info!(
                    "Skipping request for {shortname} since it is not available on {source}",
                    source: source.name.as_str(),
                    shortname: shortname.as_str()
                );
                continue;
            }

            if into_online {
                let source_group = self.store.group(source.group_id).await?;
                if !source_group.is_some_and(|g| g.name == tape.offline_group) {
                    log_debug!(
                        "Skipping request for {shortname}: online tape is only filled from offline tape",
                        shortname: shortname.as_str()
                    );
                    continue;
                }
            }

            if (bundle.total_bytes + file.size_b) as f64 >= ceiling {
                log_debug!(
                    "Bundle for {node} is full at {count} files",
                    node: node.name.as_str(),
                    count: bundle.entries.len()
                );
                break;
            }

            bundle.total_bytes += file.size_b;
            bundle.entries.push(BundleEntry {
                request: req,
                file,
                acq,
                source,
            });
        }
        Ok(bundle)
    }
}
