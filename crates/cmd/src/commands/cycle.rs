// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use diagnostics::{log_error, log_info};
use steward::{CycleReport, RequestOutcome, Steward};

/// Run update cycles until Ctrl-C.
pub async fn serve_command(steward: &Steward) -> Result<()> {
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log_info!("Interrupted, finishing after the current cycle"),
            Err(e) => {
                log_error!("Cannot listen for Ctrl-C: {error}", error: e.to_string());
                std::future::pending::<()>().await;
            }
        }
    };
    steward.run_forever(shutdown).await;
    Ok(())
}

/// Run a single update cycle and print what it did.
#[allow(clippy::print_stdout)]
pub async fn cycle_command(steward: &Steward) -> Result<CycleReport> {
    let report = steward.run_cycle().await?;
    for line in summarize_cycle(&report) {
        println!("{line}");
    }
    Ok(report)
}

/// One line per node, then one per failure.
#[must_use]
pub fn summarize_cycle(report: &CycleReport) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(callbacks) = &report.callbacks {
        if callbacks.handled > 0 || !callbacks.malformed.is_empty() || !callbacks.failed.is_empty()
        {
            lines.push(format!(
                "callbacks: {} handled, {} malformed, {} failed",
                callbacks.handled,
                callbacks.malformed.len(),
                callbacks.failed.len()
            ));
        }
    }

    for node in &report.nodes {
        let mut parts = Vec::new();
        if let Some(reason) = node.skipped {
            parts.push(format!("skipped ({reason})"));
        }
        if let Some(integrity) = &node.integrity {
            if integrity.verified + integrity.corrupt + integrity.missing > 0 {
                parts.push(format!(
                    "integrity {} ok/{} corrupt/{} missing",
                    integrity.verified, integrity.corrupt, integrity.missing
                ));
            }
        }
        if let Some(reclaim) = &node.reclaim {
            if reclaim.deleted > 0 {
                parts.push(format!("deleted {}", reclaim.deleted));
            }
        }
        if let Some(requests) = &node.requests {
            match requests.not_started {
                Some(reason) => parts.push(format!("requests not started ({reason})")),
                None => {
                    let done = requests.count(RequestOutcome::Transferred)
                        + requests.count(RequestOutcome::AlreadyPresent);
                    parts.push(format!(
                        "requests {done}/{} done",
                        requests.outcomes.len()
                    ));
                }
            }
        }
        for (label, tape) in [("tape in", &node.tape_inbound), ("tape out", &node.tape_outbound)] {
            let Some(tape) = tape else { continue };
            match tape.skipped {
                Some(reason) => parts.push(format!("{label} skipped ({reason})")),
                None => parts.push(format!("{label} bundled {}", tape.bundled)),
            }
        }
        if parts.is_empty() {
            parts.push("idle".to_string());
        }
        lines.push(format!("{}: {}", node.node, parts.join(", ")));
    }

    for (node, error) in &report.failed {
        lines.push(format!("{node}: FAILED {error}"));
    }
    lines
}
