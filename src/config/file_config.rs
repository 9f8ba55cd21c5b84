use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub upstream_url: Option<String>,
    pub accelerator_url: Option<String>,
    pub min_call_spacing_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub response_cache_ttl_secs: Option<u64>,

    // Feature configs
    pub import: Option<ImportConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ImportConfig {
    pub batch_size: Option<usize>,
    pub check_interval_hours: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
