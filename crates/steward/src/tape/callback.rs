// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Callback marker files written by tape jobs.
//!
//! A finished job leaves one empty file per transferred file in the script
//! directory, named
//! `hpss-<stamp>-<push|pull>_<success|failed>-<file_id>-<node_id>.callback`.
//! Ingestion holds an exclusive lock file in that directory so two
//! processes never handle the same marker.

use crate::retry::with_retry;
use crate::{Result, Steward, StewardError};
use catalog::{FileId, HasFile, NodeId, WantsFile, upsert_copy};
use diagnostics::{log_debug, log_error, log_info, log_warn};
use fs2::FileExt;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

const LOCK_FILE: &str = ".callbacks.lock";

static MARKER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^hpss-[^-]+-(push|pull)_(success|failed)-([0-9]+)-([0-9]+)\.callback$").ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    PushSuccess,
    PushFailed,
    PullSuccess,
    PullFailed,
}

impl CallbackKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackKind::PushSuccess => "push_success",
            CallbackKind::PushFailed => "push_failed",
            CallbackKind::PullSuccess => "pull_success",
            CallbackKind::PullFailed => "pull_failed",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, CallbackKind::PushSuccess | CallbackKind::PullSuccess)
    }

    fn from_parts(direction: &str, outcome: &str) -> Option<Self> {
        match (direction, outcome) {
            ("push", "success") => Some(CallbackKind::PushSuccess),
            ("push", "failed") => Some(CallbackKind::PushFailed),
            ("pull", "success") => Some(CallbackKind::PullSuccess),
            ("pull", "failed") => Some(CallbackKind::PullFailed),
            _ => None,
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackKind {
    type Err = StewardError;

    /// Accepts `push_success` and `push-success` spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.replace('-', "_");
        normalized
            .split_once('_')
            .and_then(|(direction, outcome)| Self::from_parts(direction, outcome))
            .ok_or_else(|| StewardError::Config(format!("unknown callback kind {s}")))
    }
}

/// A decoded marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callback {
    pub kind: CallbackKind,
    pub file_id: FileId,
    /// Node that received the file.
    pub node_id: NodeId,
}

impl Callback {
    /// Decode a marker file name. Anything not matching the grammar exactly
    /// is rejected.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let caps = MARKER.as_ref()?.captures(name)?;
        let kind = CallbackKind::from_parts(caps.get(1)?.as_str(), caps.get(2)?.as_str())?;
        let file_id = caps.get(3)?.as_str().parse::<i64>().ok()?;
        let node_id = caps.get(4)?.as_str().parse::<i64>().ok()?;
        Some(Self {
            kind,
            file_id: FileId(file_id),
            node_id: NodeId(node_id),
        })
    }

    /// File name a job writes for this callback.
    #[must_use]
    pub fn marker_name(&self, stamp: &str) -> String {
        format!(
            "hpss-{stamp}-{}-{}-{}.callback",
            self.kind, self.file_id, self.node_id
        )
    }
}

/// Result of one ingestion pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallbackReport {
    pub handled: usize,
    /// Names that did not match the marker grammar; left in place.
    pub malformed: Vec<String>,
    /// Well-formed markers whose handling failed; left in place.
    pub failed: Vec<String>,
}

/// Take the ingestion lock in `dir`. `None` when another process holds it;
/// the lock is released when the returned file is dropped.
async fn lock_callbacks(dir: &Path) -> Result<Option<std::fs::File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .await?
        .into_std()
        .await;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a directory entry looks like a marker at all.
fn is_marker_candidate(name: &str) -> bool {
    name.starts_with("hpss-") && name.ends_with(".callback")
}

impl Steward {
    /// Apply one callback. Success upserts the receiving copy as present and
    /// wanted; failure is only logged.
    pub async fn handle_callback(&self, callback: Callback) -> Result<()> {
        let Some((file, acq)) = self.file_with_acq(callback.file_id).await? else {
            return Err(StewardError::not_found("file", callback.file_id));
        };
        let Some(node) = self.store.node(callback.node_id).await? else {
            return Err(StewardError::not_found("node", callback.node_id));
        };

        let (verb, preposition) = match callback.kind {
            CallbackKind::PushSuccess | CallbackKind::PushFailed => ("push", "into"),
            CallbackKind::PullSuccess | CallbackKind::PullFailed => ("pull", "onto"),
        };

        if !callback.kind.is_success() {
            log_warn!(
                "Failed {verb}: {acq}/{file} {preposition} node {node}",
                acq: acq.name.as_str(),
                file: file.name.as_str(),
                node: node.name.as_str(),
                verb: verb,
                preposition: preposition
            );
            return Ok(());
        }

        let store = self.store.as_ref();
        let (file_id, node_id) = (file.id, node.id);
        let _ = with_retry(&self.config.retry, "tape callback", || async move {
            let mut tx = store.begin().await?;
            let copy = upsert_copy(tx.as_mut(), file_id, node_id, HasFile::Yes, WantsFile::Yes).await?;
            tx.commit().await?;
            Ok(copy)
        })
        .await?;

        log_info!(
            "Successful {verb}: {acq}/{file} {preposition} node {node}",
            acq: acq.name.as_str(),
            file: file.name.as_str(),
            node: node.name.as_str(),
            verb: verb,
            preposition: preposition
        );
        Ok(())
    }

    /// Process every marker in the script directory, in name order. Handled
    /// markers are deleted; malformed markers and markers whose handling
    /// failed stay for inspection. Without a script directory this does
    /// nothing.
    pub async fn ingest_callbacks(&self) -> Result<CallbackReport> {
        let mut report = CallbackReport::default();
        let Some(dir) = self.config.tape.script_dir.as_ref() else {
            return Ok(report);
        };
        log_debug!("Processing tape callbacks in {dir}", dir: dir.display().to_string());

        let Some(_lock) = lock_callbacks(dir).await? else {
            log_info!(
                "Callbacks in {dir} are being processed elsewhere",
                dir: dir.display().to_string()
            );
            return Ok(report);
        };

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_marker_candidate(&name) {
                names.push(name);
            }
        }
        names.sort();

        for name in names {
            let path: PathBuf = dir.join(&name);
            let Some(callback) = Callback::parse(&name) else {
                log_error!(
                    "Incomprehensible callback: {name}",
                    name: name.as_str()
                );
                report.malformed.push(name);
                continue;
            };
            match self.handle_callback(callback).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log_error!(
                            "Could not remove callback {name}: {error}",
                            error: e.to_string(),
                            name: name.as_str()
                        );
                    }
                    report.handled += 1;
                }
                Err(e) => {
                    log_error!(
                        "Callback {name} failed: {error}",
                        error: e.to_string(),
                        name: name.as_str()
                    );
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }
}
