// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Re-verification of copies flagged maybe-corrupt.

use crate::checksum::md5sum_file;
use crate::{Result, Steward};
use catalog::{HasFile, StorageNode};
use diagnostics::{log_error, log_info, log_warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub verified: usize,
    pub corrupt: usize,
    pub missing: usize,
}

impl Steward {
    /// Check up to `integrity_batch` suspect copies on `node`. A present file
    /// whose hash matches becomes `yes`, a mismatch becomes `corrupt`, and a
    /// missing file becomes `no`.
    pub async fn check_integrity(&self, node: &StorageNode) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let suspects = self
            .store
            .copies_with_state(node.id, HasFile::MaybeCorrupt, self.config.integrity_batch)
            .await?;

        for copy in suspects {
            let Some((file, acq)) = self.file_with_acq(copy.file_id).await? else {
                log_warn!(
                    "Suspect copy {copy_id} refers to an unknown file",
                    copy_id: copy.id.0
                );
                continue;
            };
            let path = node.copy_path(&acq.name, &file.name);
            log_info!(
                "Checking file {path} on node {node}",
                path: path.display().to_string(),
                node: node.name.as_str()
            );

            let state = if tokio::fs::try_exists(&path).await? {
                let md5sum = md5sum_file(&path).await?;
                if md5sum == file.md5sum {
                    log_info!("File {acq}/{file} is intact", acq: acq.name.as_str(), file: file.name.as_str());
                    report.verified += 1;
                    HasFile::Yes
                } else {
                    log_error!(
                        "File {acq}/{file} is corrupted on {node}",
                        acq: acq.name.as_str(),
                        file: file.name.as_str(),
                        node: node.name.as_str()
                    );
                    report.corrupt += 1;
                    HasFile::Corrupt
                }
            } else {
                log_error!(
                    "File {acq}/{file} does not exist on {node}",
                    acq: acq.name.as_str(),
                    file: file.name.as_str(),
                    node: node.name.as_str()
                );
                report.missing += 1;
                HasFile::No
            };

            let _ = self.store.set_has_file(file.id, node.id, state).await?;
        }
        Ok(report)
    }
}
