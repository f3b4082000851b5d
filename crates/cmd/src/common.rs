// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use catalog::{DuckDbStore, Store};
use steward::config::CONFIG_ENV;
use steward::{Steward, StewardConfig, load_config};

/// Load the daemon configuration from `override_path`, else from the file
/// named by `TARN_CONFIG`, else from defaults plus environment overrides.
pub fn load_steward_config(override_path: Option<PathBuf>) -> Result<StewardConfig> {
    let path = override_path.or_else(|| {
        env::var(CONFIG_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    });

    match path {
        Some(path) => load_config(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(StewardConfig::from_env()),
    }
}

/// Open the catalog named in the configuration.
pub fn open_store(config: &StewardConfig) -> Result<Arc<dyn Store>> {
    let store = DuckDbStore::open(&config.catalog)
        .with_context(|| format!("Failed to open catalog at {}", config.catalog.display()))?;
    Ok(Arc::new(store))
}

pub fn open_steward(config: StewardConfig) -> Result<Steward> {
    let store = open_store(&config)?;
    Ok(Steward::new(store, config))
}

/// Render a free-space figure, `-` when it was never measured.
#[must_use]
pub fn format_gb(avail_gb: Option<f64>) -> String {
    match avail_gb {
        Some(gb) => format!("{gb:.1} GiB"),
        None => "-".to_string(),
    }
}
