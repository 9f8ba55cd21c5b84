mod file_config;

pub use file_config::{FileConfig, ImportConfig};

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.scryfall.com";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub upstream_url: Option<String>,
    pub accelerator_url: Option<String>,
    pub min_call_spacing_ms: u64,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub response_cache_ttl_secs: u64,
    pub import_batch_size: usize,
    pub import_check_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub upstream_url: String,
    pub accelerator_url: Option<String>,
    pub min_call_spacing: Duration,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub response_cache_ttl: Duration,
    pub import_batch_size: usize,
    pub import_check_interval: Duration,
}

impl EngineConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        let upstream_url = file
            .upstream_url
            .or_else(|| cli.upstream_url.clone())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());

        let accelerator_url = file.accelerator_url.or_else(|| cli.accelerator_url.clone());

        let min_call_spacing_ms = file.min_call_spacing_ms.unwrap_or(cli.min_call_spacing_ms);
        let request_timeout_secs = file.request_timeout_secs.unwrap_or(cli.request_timeout_secs);
        let probe_timeout_secs = file.probe_timeout_secs.unwrap_or(cli.probe_timeout_secs);
        let response_cache_ttl_secs = file
            .response_cache_ttl_secs
            .unwrap_or(cli.response_cache_ttl_secs);

        let import_file = file.import.unwrap_or_default();
        let import_batch_size = import_file.batch_size.unwrap_or(cli.import_batch_size);
        let import_check_interval_hours = import_file
            .check_interval_hours
            .unwrap_or(cli.import_check_interval_hours);

        Ok(Self {
            db_path,
            upstream_url,
            accelerator_url,
            min_call_spacing: Duration::from_millis(min_call_spacing_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            probe_timeout: Duration::from_secs(probe_timeout_secs),
            response_cache_ttl: Duration::from_secs(response_cache_ttl_secs),
            import_batch_size,
            import_check_interval: Duration::from_secs(import_check_interval_hours * 60 * 60),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> CliConfig {
        CliConfig {
            db_path: Some(PathBuf::from("/data/cards.db")),
            upstream_url: None,
            accelerator_url: None,
            min_call_spacing_ms: 100,
            request_timeout_secs: 10,
            probe_timeout_secs: 2,
            response_cache_ttl_secs: 3600,
            import_batch_size: 10_000,
            import_check_interval_hours: 6,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let config = EngineConfig::resolve(&base_cli(), None).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/data/cards.db"));
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert!(config.accelerator_url.is_none());
        assert_eq!(config.min_call_spacing, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.import_batch_size, 10_000);
        assert_eq!(config.import_check_interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let file_config = FileConfig {
            db_path: Some("/toml/cards.db".to_string()),
            upstream_url: Some("https://mirror.example".to_string()),
            accelerator_url: Some("http://localhost:9100".to_string()),
            min_call_spacing_ms: Some(250),
            import: Some(ImportConfig {
                batch_size: Some(500),
                check_interval_hours: None,
            }),
            ..Default::default()
        };

        let config = EngineConfig::resolve(&base_cli(), Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_path, PathBuf::from("/toml/cards.db"));
        assert_eq!(config.upstream_url, "https://mirror.example");
        assert_eq!(
            config.accelerator_url.as_deref(),
            Some("http://localhost:9100")
        );
        assert_eq!(config.min_call_spacing, Duration::from_millis(250));
        assert_eq!(config.import_batch_size, 500);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.import_check_interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let cli = CliConfig::default();
        let result = EngineConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_file_config_parses_toml() {
        let parsed: FileConfig = toml::from_str(
            r#"
            db_path = "/srv/cardex/cards.db"
            accelerator_url = "http://localhost:9100"

            [import]
            batch_size = 2500
            "#,
        )
        .unwrap();
        assert_eq!(parsed.db_path.as_deref(), Some("/srv/cardex/cards.db"));
        assert_eq!(parsed.import.unwrap().batch_size, Some(2500));
    }
}
