// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Free-space probes.
//!
//! Most nodes report the space the filesystem says is available to an
//! unprivileged user. Nodes on quota-managed Lustre mounts report what is
//! left of their group quota instead.

use crate::command::run_command;
use crate::config::{QuotaProbeConfig, StewardConfig};
use crate::{Result, Steward, StewardError};
use async_trait::async_trait;
use catalog::{GIB, StorageNode};
use chrono::Utc;
use diagnostics::log_info;
use regex::Regex;
use std::path::PathBuf;

/// KiB blocks per GiB, the unit `lfs quota` reports in.
const KIB_PER_GIB: f64 = 1_048_576.0;

#[async_trait]
pub trait FreeSpaceProbe: Send + Sync {
    /// Space available on `node`, in GiB.
    async fn available_gb(&self, node: &StorageNode) -> Result<f64>;
}

/// Filesystem free space at the node root.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

#[async_trait]
impl FreeSpaceProbe for StatvfsProbe {
    async fn available_gb(&self, node: &StorageNode) -> Result<f64> {
        let root: PathBuf = node.root.clone();
        let bytes = tokio::task::spawn_blocking(move || fs2::available_space(&root))
            .await
            .map_err(std::io::Error::other)?
            .map_err(|e| StewardError::FreeSpace {
                node: node.name.clone(),
                message: e.to_string(),
            })?;
        Ok(bytes as f64 / GIB)
    }
}

/// Remaining Lustre group quota.
#[derive(Debug, Clone)]
pub struct LustreQuotaProbe {
    config: QuotaProbeConfig,
}

impl LustreQuotaProbe {
    #[must_use]
    pub fn new(config: QuotaProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FreeSpaceProbe for LustreQuotaProbe {
    async fn available_gb(&self, node: &StorageNode) -> Result<f64> {
        let lfs = self.config.lfs.to_string_lossy().into_owned();
        let args = [
            "quota".to_string(),
            "-q".to_string(),
            "-g".to_string(),
            self.config.group.clone(),
            self.config.path.to_string_lossy().into_owned(),
        ];
        let out = run_command(&lfs, &args).await?;
        if !out.success() {
            return Err(StewardError::Command {
                program: lfs,
                message: out.stderr.trim().to_string(),
            });
        }
        parse_lfs_quota(&out.stdout, self.config.fixed_quota_kb).ok_or_else(|| {
            StewardError::FreeSpace {
                node: node.name.clone(),
                message: format!("unparseable lfs quota output: {}", out.stdout.trim()),
            }
        })
    }
}

/// Turn `lfs quota -q` output into free GiB.
///
/// The first two numbers on the line are the used blocks and the quota, both
/// in KiB. Non-numeric decorations (such as the `*` marking an exceeded
/// quota) are ignored. `fixed_quota_kb` replaces the reported quota.
#[must_use]
pub fn parse_lfs_quota(stdout: &str, fixed_quota_kb: Option<u64>) -> Option<f64> {
    let strip = Regex::new(r"[^\d\s]+").ok()?;
    let cleaned = strip.replace_all(stdout, " ");
    let mut numbers = cleaned.split_whitespace().map(str::parse::<u64>);
    let used = numbers.next()?.ok()?;
    let quota = match fixed_quota_kb {
        Some(quota) => quota,
        None => numbers.next()?.ok()?,
    };
    Some((quota as f64 - used as f64) / KIB_PER_GIB)
}

/// Chooses the quota probe for configured nodes and statvfs for the rest.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredProbe {
    config: StewardConfig,
}

impl ConfiguredProbe {
    #[must_use]
    pub fn new(config: &StewardConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl FreeSpaceProbe for ConfiguredProbe {
    async fn available_gb(&self, node: &StorageNode) -> Result<f64> {
        match self.config.quota_probe(&node.name) {
            Some(quota) => {
                LustreQuotaProbe::new(quota.clone())
                    .available_gb(node)
                    .await
            }
            None => StatvfsProbe.available_gb(node).await,
        }
    }
}

impl Steward {
    /// Measure free space on `node` and record it. Only the free-space
    /// columns are written so concurrent edits to the node survive.
    pub async fn refresh_free_space(&self, node: &StorageNode) -> Result<f64> {
        let avail_gb = self.free_space.available_gb(node).await?;
        self.store
            .set_free_space(node.id, avail_gb, Utc::now())
            .await?;
        log_info!(
            "Node {node} has {avail_gb} GB available",
            node: node.name.as_str(),
            avail_gb: format!("{avail_gb:.2}")
        );
        Ok(avail_gb)
    }
}
