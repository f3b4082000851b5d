// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Operator check of a node's files against the catalog.

use crate::checksum::md5sum_file;
use crate::{Result, Steward};
use catalog::{HasFile, StorageNode};
use diagnostics::{log_info, log_warn};
use std::fmt;
use std::io::ErrorKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Also hash every file. Slow.
    pub check_md5: bool,
    /// Mark problem copies maybe-corrupt so the integrity check revisits them.
    pub flag_suspect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyProblem {
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
}

impl fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyProblem::Missing => write!(f, "missing"),
            VerifyProblem::SizeMismatch { expected, actual } => {
                write!(f, "size {actual} bytes, expected {expected}")
            }
            VerifyProblem::HashMismatch { expected, actual } => {
                write!(f, "md5 {actual}, expected {expected}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    /// `(acq/file, problem)` for every copy that failed.
    pub problems: Vec<(String, VerifyProblem)>,
    /// Copies marked maybe-corrupt.
    pub flagged: usize,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

impl Steward {
    /// Compare every copy `node` is recorded as holding against the disk.
    pub async fn verify_node(
        &self,
        node: &StorageNode,
        options: VerifyOptions,
    ) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let copies = self.store.copies_on_node(node.id).await?;

        for copy in copies.into_iter().filter(|c| c.has_file == HasFile::Yes) {
            let Some((file, acq)) = self.file_with_acq(copy.file_id).await? else {
                continue;
            };
            let shortname = format!("{}/{}", acq.name, file.name);
            let path = node.copy_path(&acq.name, &file.name);
            report.checked += 1;

            let problem = match tokio::fs::metadata(&path).await {
                Err(e) if e.kind() == ErrorKind::NotFound => Some(VerifyProblem::Missing),
                Err(e) => return Err(e.into()),
                Ok(meta) if meta.len() != file.size_b => Some(VerifyProblem::SizeMismatch {
                    expected: file.size_b,
                    actual: meta.len(),
                }),
                Ok(_) if options.check_md5 => {
                    let actual = md5sum_file(&path).await?;
                    (actual != file.md5sum).then(|| VerifyProblem::HashMismatch {
                        expected: file.md5sum.clone(),
                        actual,
                    })
                }
                Ok(_) => None,
            };

            let Some(problem) = problem else {
                continue;
            };
            log_warn!(
                "{shortname} on {node}: {problem}",
                node: node.name.as_str(),
                problem: problem.to_string(),
                shortname: shortname.as_str()
            );
            if options.flag_suspect {
                let _ = self
                    .store
                    .set_has_file(file.id, node.id, HasFile::MaybeCorrupt)
                    .await?;
                report.flagged += 1;
            }
            report.problems.push((shortname, problem));
        }

        log_info!(
            "Verified {checked} copies on {node}: {problems} problems",
            checked: report.checked,
            node: node.name.as_str(),
            problems: report.problems.len()
        );
        Ok(report)
    }
}
