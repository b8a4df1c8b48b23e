//! # Dashboard configuration
//!
//! Broker settings, the topics to watch and the history size, stored as a single
//! TOML file. A missing file is not an error: the defaults are used and the
//! dashboard refuses to connect until a broker URL is filled in.
//!
//! ```toml
//! history_limit = 100
//! topics = ["1/devices/d1/state"]
//! variable = "relay"
//!
//! [broker]
//! url = "ws://localhost:8083/mqtt"
//! connect_timeout_ms = 4000
//!
//! [broker.credentials]
//! username = "alice"
//! password = "secret"
//!
//! [broker.reconnect]
//! period_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::config::{
    ConnectOptions, ReconnectPolicy, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE,
};
use crate::mqtt::history::DEFAULT_HISTORY_LIMIT;

const CONFIG_DIR: &str = "iot-dashboard";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    pub history_limit: usize,
    /// Topics subscribed at startup.
    pub topics: Vec<String>,
    /// Only show this variable on the indicators, all variables when unset.
    pub variable: Option<String>,
    pub broker: BrokerConfig,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            topics: Vec::new(),
            variable: None,
            broker: BrokerConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub client_id: Option<String>,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            keep_alive_secs: DEFAULT_KEEP_ALIVE.as_secs(),
            credentials: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl DashboardConfig {
    /// `<config dir>/iot-dashboard/config.toml`, falling back to the working
    /// directory when the platform has no config dir.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads the file at `path`, or returns the defaults when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!(
                "Config file {} does not exist, using default",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        info!("Loaded config from {}", path.display());
        debug!("{:?}", config.topics);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Connection options for the configured broker.
    ///
    /// Logged-in users get the client id `dashboard_user_<username>` unless one is
    /// configured explicitly, everyone else a random one.
    pub fn connect_options(&self) -> crate::Result<ConnectOptions> {
        let broker = &self.broker;
        if broker.url.trim().is_empty() {
            return Err(crate::Error::ConfigurationMissing);
        }

        let mut options = ConnectOptions::new(broker.url.trim())
            .with_connect_timeout(Duration::from_millis(broker.connect_timeout_ms))
            .with_reconnect(broker.reconnect.clone());
        options.keep_alive = Duration::from_secs(broker.keep_alive_secs);

        if let Some(credentials) = &broker.credentials {
            options = options.with_credentials(&credentials.username, &credentials.password);
            if broker.client_id.is_none() {
                let client_id = format!("dashboard_user_{}", credentials.username);
                options = options.with_client_id(client_id);
            }
        }
        if let Some(client_id) = &broker.client_id {
            options = options.with_client_id(client_id);
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::Backoff;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DashboardConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();

        assert_eq!(config, DashboardConfig::default());
        assert_eq!(config.history_limit, 100);
        assert_eq!(
            config.connect_options().unwrap_err(),
            crate::Error::ConfigurationMissing
        );
    }

    #[tokio::test]
    async fn test_load_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
            history_limit = 20
            topics = ["1/devices/d1/state", "1/devices/d2/state"]
            variable = "relay"

            [broker]
            url = "wss://broker.example.com:8084/mqtt"
            connect_timeout_ms = 2500

            [broker.credentials]
            username = "alice"
            password = "secret"

            [broker.reconnect]
            period_ms = 500
            backoff = { kind = "exponential", max_delay_ms = 10000 }
            "#,
        )
        .await
        .unwrap();

        let config = DashboardConfig::load(&path).await.unwrap();
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.topics.len(), 2);
        assert_eq!(config.variable.as_deref(), Some("relay"));

        let options = config.connect_options().unwrap();
        assert_eq!(options.url, "wss://broker.example.com:8084/mqtt");
        assert_eq!(options.connect_timeout, Duration::from_millis(2500));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.client_id.as_deref(), Some("dashboard_user_alice"));
        assert_eq!(
            options.reconnect.backoff,
            Backoff::Exponential { max_delay_ms: 10000 }
        );
    }

    #[test]
    fn test_explicit_client_id_wins() {
        let mut config = DashboardConfig::default();
        config.broker.url = "mqtt://localhost".to_string();
        config.broker.client_id = Some("panel-1".to_string());
        config.broker.credentials = Some(Credentials {
            username: "bob".to_string(),
            password: "pw".to_string(),
        });

        let options = config.connect_options().unwrap();
        assert_eq!(options.client_id.as_deref(), Some("panel-1"));
    }

    #[test]
    fn test_anonymous_gets_random_id() {
        let mut config = DashboardConfig::default();
        config.broker.url = "mqtt://localhost".to_string();

        let options = config.connect_options().unwrap();
        assert!(options.client_id.is_none());
        assert!(options.client_id_or_random().starts_with("iot_dash_"));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = DashboardConfig::default();
        config.broker.url = "ws://localhost:8083/mqtt".to_string();
        config.topics.push("t".to_string());

        config.save(&path).await.unwrap();
        let loaded = DashboardConfig::load(&path).await.unwrap();

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "history_limit = \"many\"").await.unwrap();

        let err = DashboardConfig::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
