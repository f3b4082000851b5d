// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use catalog::{FileId, NodeId};
use diagnostics::log_info;
use steward::{Callback, CallbackKind, CallbackReport, Steward};

/// Process the marker files tape jobs have left in the script directory.
#[allow(clippy::print_stdout)]
pub async fn ingest_command(steward: &Steward) -> Result<CallbackReport> {
    let report = steward.ingest_callbacks().await?;
    println!(
        "{} handled, {} malformed, {} failed",
        report.handled,
        report.malformed.len(),
        report.failed.len()
    );
    for name in report.malformed.iter().chain(&report.failed) {
        println!("  left in place: {name}");
    }
    Ok(report)
}

/// Apply one callback directly, as a tape job would through its marker.
pub async fn callback_command(
    steward: &Steward,
    kind: &str,
    file_id: i64,
    node_id: i64,
) -> Result<()> {
    let kind: CallbackKind = kind
        .parse()
        .with_context(|| format!("Invalid callback kind {kind}"))?;
    let callback = Callback {
        kind,
        file_id: FileId(file_id),
        node_id: NodeId(node_id),
    };
    steward
        .handle_callback(callback)
        .await
        .with_context(|| format!("Callback {kind} for file {file_id} on node {node_id} failed"))?;
    log_info!(
        "Handled {kind} for file {file_id} on node {node_id}",
        kind: kind.as_str(),
        file_id: file_id,
        node_id: node_id
    );
    Ok(())
}
