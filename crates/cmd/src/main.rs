// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use diagnostics::LogLevel;
use steward::VerifyOptions;

use cmd::commands;
use cmd::common::{load_steward_config, open_steward, open_store};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "tarn")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Configuration file (defaults to $TARN_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run update cycles for this host until interrupted
    Serve,
    /// Run a single update cycle and exit
    Cycle,
    /// Process tape job callback markers
    IngestCallbacks,
    /// Apply one tape job callback
    Callback {
        /// push-success, push-failed, pull-success or pull-failed
        kind: String,
        file_id: i64,
        /// Node that received the file
        node_id: i64,
    },
    /// Check a node's recorded copies against its disk
    Verify {
        node: String,
        /// Also compare md5 sums
        #[arg(long)]
        md5: bool,
        /// Mark problem copies for re-verification
        #[arg(long)]
        flag: bool,
    },
    /// Show the nodes on this host
    Status,
    /// Register a file already present on a node
    Import {
        node: String,
        acq: String,
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Commands::Serve | Commands::Cycle => LogLevel::Info,
        _ => LogLevel::Warn,
    };
    diagnostics::init_with_default(default_level);

    let config = load_steward_config(cli.config)?;

    match cli.command {
        Commands::Serve => commands::serve_command(&open_steward(config)?).await?,
        Commands::Cycle => {
            let report = commands::cycle_command(&open_steward(config)?).await?;
            if !report.failed.is_empty() {
                bail!("{} nodes failed to update", report.failed.len());
            }
        }
        Commands::IngestCallbacks => {
            let _ = commands::ingest_command(&open_steward(config)?).await?;
        }
        Commands::Callback {
            kind,
            file_id,
            node_id,
        } => {
            let steward = open_steward(config)?;
            commands::callback_command(&steward, &kind, file_id, node_id).await?;
        }
        Commands::Verify { node, md5, flag } => {
            let options = VerifyOptions {
                check_md5: md5,
                flag_suspect: flag,
            };
            let steward = open_steward(config)?;
            let report = commands::verify_command(&steward, &node, options).await?;
            if !report.is_clean() {
                bail!("{} problems on {node}", report.problems.len());
            }
        }
        Commands::Status => {
            let _ = commands::status_command(&open_steward(config)?).await?;
        }
        Commands::Import { node, acq, file } => {
            let store = open_store(&config)?;
            let _ = commands::import_command(store, &config, &node, &acq, &file).await?;
        }
    }
    Ok(())
}
