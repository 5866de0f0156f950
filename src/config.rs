use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_port() -> u16 {
    8081
}

fn default_environment() -> String {
    "local".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_analysis_endpoint() -> String {
    "http://127.0.0.1:4000/api/analyze-flow".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl AnalysisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_analysis_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Free analysis credits granted to anonymous accounts. The shipped
    /// default is zero: anonymous users must complete the auth handshake
    /// before analyzing.
    #[serde(default = "default_free_credits")]
    pub free_credits: u32,
}

fn default_free_credits() -> u32 {
    0
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            free_credits: default_free_credits(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_completion_delay_ms")]
    pub completion_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    #[serde(default = "default_portal_base_url")]
    pub portal_base_url: String,
}

fn default_token_ttl_secs() -> u64 {
    600
}

fn default_completion_delay_ms() -> u64 {
    1_500
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_portal_base_url() -> String {
    "http://localhost:8081/auth-portal".to_string()
}

impl BridgeSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            completion_delay_ms: default_completion_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_failures: default_max_poll_failures(),
            portal_base_url: default_portal_base_url(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse flowlens.toml")?;
        Ok(config)
    }

    /// Missing config file is not an error; everything has a default.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
