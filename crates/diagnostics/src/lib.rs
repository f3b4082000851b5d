// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging facade shared by every tarn crate.
//!
//! The level comes from the `TARN_LOG` environment variable:
//! - `off` (default for libraries and tools) - no output
//! - `error`, `warn`, `info`, `debug` - minimum level written to stderr
//!
//! The daemon calls [`init_with_default`] so that an unset variable still
//! yields `info` output.

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable naming the minimum log level.
pub const LOG_ENV: &str = "TARN_LOG";

static INIT: Once = Once::new();

/// Parsed value of `TARN_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Parse a level name, case-insensitively. `None` for unknown names.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn min_level(self) -> Option<emit::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(emit::Level::Error),
            LogLevel::Warn => Some(emit::Level::Warn),
            LogLevel::Info => Some(emit::Level::Info),
            LogLevel::Debug => Some(emit::Level::Debug),
        }
    }
}

/// Initialize diagnostics from `TARN_LOG`, defaulting to off.
///
/// Safe to call more than once; only the first call installs an emitter.
pub fn init_diagnostics() {
    init_with_default(LogLevel::Off);
}

/// Initialize diagnostics from `TARN_LOG`, using `default` when it is unset.
pub fn init_with_default(default: LogLevel) {
    INIT.call_once(|| {
        let (level, unknown) = match std::env::var(LOG_ENV) {
            Ok(value) => match LogLevel::parse(&value) {
                Some(level) => (level, None),
                None => (LogLevel::Info, Some(value)),
            },
            Err(_) => (default, None),
        };

        let Some(min) = level.min_level() else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(min))
            .init();

        if let Some(value) = unknown {
            emit::warn!(
                "Unknown {env} value {value}, using info",
                env: LOG_ENV,
                value: value
            );
        }

        // The emitter lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log basic operations (node updates, transfers, deletions)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (per-request decisions, probe output)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log policy skips and recoverable problems
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures and anomalies
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
