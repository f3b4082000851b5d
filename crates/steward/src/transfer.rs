// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Moving one file between nodes.
//!
//! A [`TransferExecutor`] holds two ordered strategy lists, one for copies
//! between nodes on the same host and one for copies across hosts. Each
//! strategy is tried in order; a failure that allows fallback moves on to
//! the next available strategy.

use crate::command::{command_available, run_command};
use crate::config::TransferConfig;
use async_trait::async_trait;
use diagnostics::{log_debug, log_warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

static BBCP_MD5: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"md5 ([a-f0-9]{32})").ok());

/// Where the source lives relative to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Same host; the source is a local path.
    Local,
    /// Different host; the source is a `user@address:path` spec.
    Remote,
}

/// One file to move.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Local path or remote spec of the source copy.
    pub source: String,
    /// Acquisition directory on the destination node.
    pub dest_dir: PathBuf,
    /// Final path of the copy on the destination node.
    pub dest_path: PathBuf,
    /// Recorded hash of the file.
    pub md5sum: String,
}

impl TransferJob {
    fn dest_dir_arg(&self) -> String {
        format!("{}/", self.dest_dir.display())
    }
}

/// Which end a failed transfer implicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blame {
    /// The source copy may be bad and should be re-verified.
    Source,
    /// A destination-side or tooling problem; the source is not suspect.
    Destination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The file arrived. `md5sum` is the hash the tool vouches for.
    Success { md5sum: String },
    Failed {
        diagnostic: String,
        blame: Blame,
        /// Whether the next strategy in line should be tried.
        fallback: bool,
    },
}

impl TransferOutcome {
    fn failed(diagnostic: impl Into<String>, blame: Blame, fallback: bool) -> Self {
        TransferOutcome::Failed {
            diagnostic: diagnostic.into(),
            blame,
            fallback,
        }
    }
}

#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    async fn execute(&self, job: &TransferJob) -> TransferOutcome;
}

/// Hard link within one filesystem. The bytes cannot change, so the
/// recorded hash is reported without reading the file.
#[derive(Debug, Default)]
pub struct HardLink;

#[async_trait]
impl TransferStrategy for HardLink {
    fn name(&self) -> &'static str {
        "link"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, job: &TransferJob) -> TransferOutcome {
        if tokio::fs::try_exists(&job.dest_path).await.unwrap_or(true) {
            return TransferOutcome::failed(
                format!(
                    "File {} already exists. Clean up manually.",
                    job.dest_path.display()
                ),
                Blame::Destination,
                false,
            );
        }
        match tokio::fs::hard_link(&job.source, &job.dest_path).await {
            Ok(()) => TransferOutcome::Success {
                md5sum: job.md5sum.clone(),
            },
            Err(e) => TransferOutcome::failed(format!("link failed: {e}"), Blame::Source, true),
        }
    }
}

/// rsync, locally or over ssh. rsync 3 verifies a whole-file checksum while
/// writing, so success reports the recorded hash.
#[derive(Debug, Clone)]
pub struct Rsync {
    args: Vec<String>,
}

impl Rsync {
    #[must_use]
    pub fn local(config: &TransferConfig) -> Self {
        Self {
            args: config.rsync_opts.clone(),
        }
    }

    #[must_use]
    pub fn remote(config: &TransferConfig) -> Self {
        let mut args = vec!["--compress".to_string()];
        args.extend(config.rsync_opts.iter().cloned());
        args.push(format!("--rsync-path={}", config.remote_rsync_path));
        args.push(format!("--rsh={}", config.rsh));
        Self { args }
    }
}

/// Whether rsync's stderr points at the destination rather than the source.
fn rsync_destination_fault(stderr: &str) -> bool {
    stderr.contains("mkstemp") || stderr.contains("write failed on")
}

#[async_trait]
impl TransferStrategy for Rsync {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn is_available(&self) -> bool {
        command_available("rsync")
    }

    async fn execute(&self, job: &TransferJob) -> TransferOutcome {
        let mut args = self.args.clone();
        args.push(job.source.clone());
        args.push(job.dest_dir_arg());
        let out = match run_command("rsync", &args).await {
            Ok(out) => out,
            Err(e) => {
                return TransferOutcome::failed(
                    format!("rsync could not start: {e}"),
                    Blame::Destination,
                    false,
                );
            }
        };
        if out.success() {
            return TransferOutcome::Success {
                md5sum: job.md5sum.clone(),
            };
        }
        let blame = if rsync_destination_fault(&out.stderr) {
            log_warn!(
                "rsync failed on the destination side: {stderr}",
                stderr: out.stderr.trim()
            );
            Blame::Destination
        } else {
            Blame::Source
        };
        TransferOutcome::failed(out.stderr.trim().to_string(), blame, false)
    }
}

/// bbcp parallel network copy. Computes an md5 while streaming and prints it
/// on stderr.
#[derive(Debug, Clone)]
pub struct Bbcp {
    args: Vec<String>,
}

impl Bbcp {
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        let args = vec![
            "-V".to_string(),
            "-f".to_string(),
            "-z".to_string(),
            "--port".to_string(),
            config.bbcp_port.to_string(),
            "-W".to_string(),
            config.bbcp_window.clone(),
            "-s".to_string(),
            config.bbcp_streams.to_string(),
            "-e".to_string(),
            "-E".to_string(),
            "%md5=".to_string(),
        ];
        Self { args }
    }
}

/// Extract the hash bbcp reports on stderr.
#[must_use]
pub fn parse_bbcp_md5(stderr: &str) -> Option<String> {
    let re = BBCP_MD5.as_ref()?;
    re.captures(stderr)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl TransferStrategy for Bbcp {
    fn name(&self) -> &'static str {
        "bbcp"
    }

    fn is_available(&self) -> bool {
        command_available("bbcp")
    }

    async fn execute(&self, job: &TransferJob) -> TransferOutcome {
        let mut args = self.args.clone();
        args.push(job.source.clone());
        args.push(job.dest_dir_arg());
        let out = match run_command("bbcp", &args).await {
            Ok(out) => out,
            Err(e) => {
                return TransferOutcome::failed(
                    format!("bbcp could not start: {e}"),
                    Blame::Destination,
                    true,
                );
            }
        };
        if !out.success() {
            return TransferOutcome::failed(out.stderr.trim().to_string(), Blame::Source, true);
        }
        match parse_bbcp_md5(&out.stderr) {
            Some(md5sum) => TransferOutcome::Success { md5sum },
            None => TransferOutcome::failed(
                format!(
                    "BBCP transfer has gone awry. STDOUT: {} STDERR: {}",
                    out.stdout.trim(),
                    out.stderr.trim()
                ),
                Blame::Source,
                true,
            ),
        }
    }
}

/// Ordered strategy lists for local and remote routes.
#[derive(Clone)]
pub struct TransferExecutor {
    local: Vec<Arc<dyn TransferStrategy>>,
    remote: Vec<Arc<dyn TransferStrategy>>,
}

impl TransferExecutor {
    #[must_use]
    pub fn new(
        local: Vec<Arc<dyn TransferStrategy>>,
        remote: Vec<Arc<dyn TransferStrategy>>,
    ) -> Self {
        Self { local, remote }
    }

    /// Hard link then rsync locally; bbcp then rsync over the network.
    #[must_use]
    pub fn system(config: &TransferConfig) -> Self {
        Self::new(
            vec![Arc::new(HardLink), Arc::new(Rsync::local(config))],
            vec![Arc::new(Bbcp::new(config)), Arc::new(Rsync::remote(config))],
        )
    }

    /// Move `job` using the first strategy for `route` that succeeds or
    /// refuses fallback. Running out of usable tools is a failure that does
    /// not implicate the source.
    pub async fn transfer(&self, route: Route, job: &TransferJob) -> TransferOutcome {
        let strategies = match route {
            Route::Local => &self.local,
            Route::Remote => &self.remote,
        };
        let mut previous: Option<String> = None;
        for strategy in strategies {
            if !strategy.is_available() {
                log_debug!("Transfer tool {tool} unavailable", tool: strategy.name());
                continue;
            }
            match strategy.execute(job).await {
                TransferOutcome::Failed {
                    diagnostic,
                    fallback: true,
                    ..
                } => {
                    log_debug!(
                        "Transfer with {tool} failed, trying next: {diagnostic}",
                        tool: strategy.name(),
                        diagnostic: diagnostic.as_str()
                    );
                    previous = Some(format!("{}: {diagnostic}", strategy.name()));
                }
                outcome => return outcome,
            }
        }
        let diagnostic = match previous {
            Some(previous) => format!("No commands available to complete this transfer ({previous})"),
            None => "No commands available to complete this transfer".to_string(),
        };
        TransferOutcome::failed(diagnostic, Blame::Destination, false)
    }
}
