// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! Loaded from YAML; every field has a default so an empty file (or no file)
//! yields a working configuration for the local host. A few values may be
//! overridden from the environment, see [`StewardConfig::apply_env`].

use crate::{Result, StewardError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the configuration file.
pub const CONFIG_ENV: &str = "TARN_CONFIG";
/// Directory for generated tape scripts and their callback markers.
pub const TAPE_SCRIPT_DIR_ENV: &str = "TARN_TAPE_SCRIPT_DIR";
/// Host identity used to select the nodes this daemon manages.
pub const HOST_ENV: &str = "TARN_HOST";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StewardConfig {
    /// Short name of the host whose nodes are reconciled.
    pub host: String,
    /// Location of the DuckDB catalog.
    pub catalog: PathBuf,
    /// Minimum period between the starts of two cycles, in seconds.
    pub cycle_secs: u64,
    /// Time budget for request handling on one node, in seconds.
    pub node_budget_secs: u64,
    /// Suspect copies re-verified per node per cycle.
    pub integrity_batch: usize,
    /// Deletions per node per cycle.
    pub reclaim_limit: usize,
    /// Free space required above a node's minimum before it accepts transfers.
    pub request_headroom_gb: f64,
    /// Verified archive copies that must remain elsewhere before a deletion.
    pub min_archive_copies: u64,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub tape: TapeConfig,
    /// Nodes whose free space comes from a Lustre group quota.
    pub quota_probes: Vec<QuotaProbeConfig>,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            host: local_hostname(),
            catalog: PathBuf::from("tarn.duckdb"),
            cycle_secs: 60,
            node_budget_secs: 300,
            integrity_batch: 25,
            reclaim_limit: 500,
            request_headroom_gb: 10.0,
            min_archive_copies: 2,
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            tape: TapeConfig::default(),
            quota_probes: Vec::new(),
        }
    }
}

impl StewardConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `TARN_HOST` and `TARN_TAPE_SCRIPT_DIR` when set.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var(HOST_ENV) {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var(TAPE_SCRIPT_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.tape.script_dir = Some(PathBuf::from(dir.trim()));
            }
        }
    }

    #[must_use]
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_secs)
    }

    #[must_use]
    pub fn node_budget(&self) -> Duration {
        Duration::from_secs(self.node_budget_secs)
    }

    /// Quota probe configured for `node`, if any.
    #[must_use]
    pub fn quota_probe(&self, node: &str) -> Option<&QuotaProbeConfig> {
        self.quota_probes.iter().find(|probe| probe.node == node)
    }
}

/// Fixed-delay retry of transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5_000,
            max_attempts: 12,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Options for the external copy tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub rsync_opts: Vec<String>,
    /// `--rsync-path` used on the remote side of network rsyncs.
    pub remote_rsync_path: String,
    /// `--rsh` used for network rsyncs.
    pub rsh: String,
    pub bbcp_port: u16,
    pub bbcp_window: String,
    pub bbcp_streams: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_opts: [
                "--quiet",
                "--times",
                "--protect-args",
                "--perms",
                "--group",
                "--owner",
                "--copy-links",
                "--sparse",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            remote_rsync_path: "ionice -c2 -n4 rsync".to_string(),
            rsh: "ssh -q".to_string(),
            bbcp_port: 4200,
            bbcp_window: "4M".to_string(),
            bbcp_streams: 16,
        }
    }
}

/// Tape bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapeConfig {
    /// Where scripts are written and callback markers appear. Tape inbound
    /// refuses to run without it; outbound and callback ingestion skip.
    pub script_dir: Option<PathBuf>,
    pub bundle_max_gb: f64,
    pub push_limit: usize,
    pub pull_limit: usize,
    /// Inbound is skipped while more than this many archive jobs are pending.
    pub inbound_queue_threshold: usize,
    /// Outbound is skipped while more than this many archive jobs are pending.
    pub outbound_queue_threshold: usize,
    pub partition: String,
    pub walltime: String,
    pub online_group: String,
    pub offline_group: String,
    /// Host that accepts `sbatch` submissions.
    pub submit_host: String,
    /// Queue owner; defaults to the current user.
    pub user: Option<String>,
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            script_dir: None,
            bundle_max_gb: 800.0,
            push_limit: 500,
            pull_limit: 40,
            inbound_queue_threshold: 0,
            outbound_queue_threshold: 1,
            partition: "archivelong".to_string(),
            walltime: "4:00:00".to_string(),
            online_group: "hpss_online".to_string(),
            offline_group: "hpss_offline".to_string(),
            submit_host: "localhost".to_string(),
            user: None,
        }
    }
}

impl TapeConfig {
    /// Bundle ceiling in bytes.
    #[must_use]
    pub fn bundle_max_bytes(&self) -> f64 {
        self.bundle_max_gb * catalog::GIB
    }
}

/// Free space from `lfs quota -q -g <group> <path>` instead of statvfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaProbeConfig {
    /// Node name the probe applies to.
    pub node: String,
    pub group: String,
    pub path: PathBuf,
    /// Fixed quota in KiB blocks, replacing the reported limit.
    #[serde(default)]
    pub fixed_quota_kb: Option<u64>,
    #[serde(default = "default_lfs")]
    pub lfs: PathBuf,
}

fn default_lfs() -> PathBuf {
    PathBuf::from("/usr/bin/lfs")
}

/// Load configuration from a YAML file, then apply environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StewardConfig> {
    let content = std::fs::read_to_string(&path).map_err(|e| {
        StewardError::Config(format!(
            "Failed to read config file {}: {e}",
            path.as_ref().display()
        ))
    })?;
    let mut config = parse_config(&content)?;
    config.apply_env();
    validate_config(&config)?;
    Ok(config)
}

/// Parse YAML text without consulting the environment.
pub fn parse_config(content: &str) -> Result<StewardConfig> {
    if content.trim().is_empty() {
        return Ok(StewardConfig::default());
    }
    let config: StewardConfig = serde_yaml_ng::from_str(content)?;
    Ok(config)
}

/// Validate configuration
pub fn validate_config(config: &StewardConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(StewardError::Config("host cannot be empty".to_string()));
    }
    if config.cycle_secs == 0 {
        return Err(StewardError::Config(
            "cycle_secs must be greater than 0".to_string(),
        ));
    }
    if config.integrity_batch == 0 || config.reclaim_limit == 0 {
        return Err(StewardError::Config(
            "integrity_batch and reclaim_limit must be greater than 0".to_string(),
        ));
    }
    if config.request_headroom_gb < 0.0 {
        return Err(StewardError::Config(
            "request_headroom_gb cannot be negative".to_string(),
        ));
    }
    if config.retry.max_attempts == 0 {
        return Err(StewardError::Config(
            "retry.max_attempts must be greater than 0".to_string(),
        ));
    }
    let tape = &config.tape;
    if tape.bundle_max_gb <= 0.0 {
        return Err(StewardError::Config(
            "tape.bundle_max_gb must be greater than 0".to_string(),
        ));
    }
    if tape.push_limit == 0 || tape.pull_limit == 0 {
        return Err(StewardError::Config(
            "tape push_limit and pull_limit must be greater than 0".to_string(),
        ));
    }
    for probe in &config.quota_probes {
        if probe.node.is_empty() || probe.group.is_empty() {
            return Err(StewardError::Config(
                "quota probe needs a node and a group".to_string(),
            ));
        }
    }
    Ok(())
}

/// Short host name of this machine, `TARN_HOST` aside.
#[must_use]
pub fn local_hostname() -> String {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    raw.trim()
        .split('.')
        .next()
        .unwrap_or("localhost")
        .to_string()
}
