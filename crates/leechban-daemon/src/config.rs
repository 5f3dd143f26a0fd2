//! Daemon configuration, read from a JSON file (default `leechban.json`).

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use leechban_core::{output::OutputFormat, RuleConfig, ServerConfig};
use serde::{Deserialize, Serialize};

const DEFAULT_INTERVAL_MINUTES: i64 = 30;
const RECOMMENDED_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: i64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            log_level: default_log_level(),
            dry_run: false,
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_dat_file")]
    pub dat_file: String,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dat_file: default_dat_file(),
            format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind: String,
    #[serde(default)]
    pub admin_token: String,
}

fn default_interval_minutes() -> i64 {
    DEFAULT_INTERVAL_MINUTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> String {
    "leechban-state.json".to_string()
}

fn default_dat_file() -> String {
    "ipfilter.dat".to_string()
}

impl AppConfig {
    /// Scan interval. Non-positive values fall back to the default.
    pub fn interval(&self) -> Duration {
        let minutes = if self.interval_minutes > 0 {
            self.interval_minutes
        } else {
            DEFAULT_INTERVAL_MINUTES
        };
        Duration::from_secs(minutes as u64 * 60)
    }
}

impl ApiConfig {
    pub fn token_is_weak(&self) -> bool {
        !self.admin_token.is_empty() && self.admin_token.len() < RECOMMENDED_TOKEN_LEN
    }
}

/// Load and validate the configuration file.
pub async fn load_config(path: &Path) -> Result<DaemonConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: DaemonConfig =
        serde_json::from_str(&content).context("Failed to parse config file")?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &DaemonConfig) -> Result<()> {
    if config.servers.is_empty() {
        return Err(anyhow::anyhow!("At least one server must be configured"));
    }

    for server in &config.servers {
        if server.name.trim().is_empty() {
            return Err(anyhow::anyhow!("Server name must not be empty"));
        }
        if !(server.url.starts_with("http://") || server.url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "Invalid url for server '{}': {} (must start with http:// or https://)",
                server.name,
                server.url
            ));
        }
    }

    if let Some(api) = &config.api {
        let addr: std::net::SocketAddr = api
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid api.bind '{}': {}", api.bind, e))?;
        if !addr.ip().is_loopback() && api.admin_token.is_empty() {
            return Err(anyhow::anyhow!(
                "Binding the API to non-localhost address {} requires api.admin_token to be set",
                addr.ip()
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<DaemonConfig> {
        let config: DaemonConfig = serde_json::from_str(json)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse(r#"{"servers": [{"name": "home", "url": "http://localhost:8080"}]}"#)
            .unwrap();
        assert_eq!(config.app.interval_minutes, 30);
        assert_eq!(config.app.log_level, "info");
        assert_eq!(config.app.state_file, "leechban-state.json");
        assert!(!config.app.dry_run);
        assert_eq!(config.output.dat_file, "ipfilter.dat");
        assert_eq!(config.output.format, OutputFormat::Ipfilter);
        assert!(config.api.is_none());
        assert!(config.rules.is_empty());
        assert!(config.servers[0].username.is_empty());
    }

    #[test]
    fn full_config() {
        let config = parse(
            r#"{
                "app": {"interval_minutes": 5, "dry_run": true},
                "servers": [{"name": "seedbox", "url": "https://seed.example:8080",
                             "username": "admin", "password": "pw"}],
                "whitelist": {"ips": ["192.168.0.0/16"]},
                "output": {"dat_file": "/tmp/bans.txt", "format": "plain"},
                "api": {"bind": "127.0.0.1:8734"},
                "rules": [{
                    "name": "leech",
                    "ban_duration": "24h",
                    "max_ban_count": 3,
                    "filters": [{"field": "progress", "operator": "<", "value": "1%"}]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.app.interval(), Duration::from_secs(300));
        assert_eq!(config.output.format, OutputFormat::Plain);
        assert_eq!(config.whitelist.ips, vec!["192.168.0.0/16"]);
        assert_eq!(config.rules[0].max_ban_count, 3);
        assert!(config.rules[0].enabled);
        assert_eq!(config.rules[0].action, "ban");
    }

    #[test]
    fn non_positive_interval_uses_default() {
        let app = AppConfig {
            interval_minutes: 0,
            ..AppConfig::default()
        };
        assert_eq!(app.interval(), Duration::from_secs(30 * 60));
        let app = AppConfig {
            interval_minutes: -4,
            ..AppConfig::default()
        };
        assert_eq!(app.interval(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn servers_are_required() {
        assert!(parse("{}").is_err());
    }

    #[test]
    fn server_url_needs_http_scheme() {
        let err = parse(r#"{"servers": [{"name": "a", "url": "localhost:8080"}]}"#).unwrap_err();
        assert!(err.to_string().contains("http://"));
    }

    #[test]
    fn public_bind_requires_token() {
        let json = r#"{"servers": [{"name": "a", "url": "http://x"}],
                       "api": {"bind": "0.0.0.0:8734"}}"#;
        assert!(parse(json).is_err());

        let json = r#"{"servers": [{"name": "a", "url": "http://x"}],
                       "api": {"bind": "0.0.0.0:8734", "admin_token": "short"}}"#;
        let config = parse(json).unwrap();
        assert!(config.api.unwrap().token_is_weak());
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leechban.json");
        tokio::fs::write(&path, r#"{"servers": [{"name": "a", "url": "http://x"}]}"#)
            .await
            .unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.servers.len(), 1);

        assert!(load_config(&dir.path().join("missing.json")).await.is_err());
    }
}
