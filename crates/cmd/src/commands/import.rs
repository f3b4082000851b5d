// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use catalog::Store;
use steward::{ExtractorRegistry, ImportOutcome, Importer, StewardConfig};

/// Register a file already sitting on a node.
#[allow(clippy::print_stdout)]
pub async fn import_command(
    store: Arc<dyn Store>,
    config: &StewardConfig,
    node: &str,
    acq: &str,
    file: &str,
) -> Result<ImportOutcome> {
    let importer = Importer::new(store, ExtractorRegistry::new(), config.retry.clone());
    let outcome = importer
        .import_named(node, acq, file)
        .await
        .with_context(|| format!("Failed to import {acq}/{file} on {node}"))?;

    match &outcome {
        ImportOutcome::Locked => println!("{acq}/{file}: locked, not imported"),
        ImportOutcome::NotAcquisition => println!("{acq}: not an acquisition directory"),
        ImportOutcome::AlreadyRegistered => println!("{acq}/{file}: already registered"),
        ImportOutcome::Registered { file: row, suspect, .. } => {
            let note = if *suspect { " (disagrees with catalog)" } else { "" };
            println!("{acq}/{file}: registered as file {}{note}", row.id);
        }
    }
    Ok(outcome)
}
