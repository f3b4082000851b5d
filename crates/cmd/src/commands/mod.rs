// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub mod callback;
pub mod cycle;
pub mod import;
pub mod status;
pub mod verify;

pub use callback::{callback_command, ingest_command};
pub use cycle::{cycle_command, serve_command, summarize_cycle};
pub use import::import_command;
pub use status::{NodeStatus, collect_status, status_command};
pub use verify::verify_command;
