// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Result, anyhow};
use steward::{Steward, VerifyOptions, VerifyReport};

/// Check a node's recorded copies against its disk and print each problem.
#[allow(clippy::print_stdout)]
pub async fn verify_command(
    steward: &Steward,
    node_name: &str,
    options: VerifyOptions,
) -> Result<VerifyReport> {
    let node = steward
        .store()
        .find_node(node_name)
        .await?
        .ok_or_else(|| anyhow!("No such node: {node_name}"))?;

    let report = steward.verify_node(&node, options).await?;
    for (shortname, problem) in &report.problems {
        println!("{shortname}: {problem}");
    }
    println!(
        "{}: {} checked, {} problems, {} flagged",
        node.name,
        report.checked,
        report.problems.len(),
        report.flagged
    );
    Ok(report)
}
