use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::DEFAULT_PREFIXES;

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_api_base_path")]
    pub api_base_path: String,
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub log_payloads: bool,
    #[serde(default = "default_log_payload_limit")]
    pub log_payload_limit: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocketConfig {
    #[serde(default = "default_socket_url")]
    pub url: String,
    #[serde(default = "default_socket_path")]
    pub path: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_timeout_secs")]
    pub ack_timeout_secs: u64,
}

fn default_host() -> String {
    "10.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8082
}

fn default_api_base_path() -> String {
    "/v1".to_string()
}

fn default_prefixes() -> Vec<String> {
    DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_payload_limit() -> usize {
    4000
}

fn default_socket_url() -> String {
    "http://10.0.0.1:8083".to_string()
}

fn default_socket_path() -> String {
    "/socket.io".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            api_base_path: default_api_base_path(),
            prefixes: default_prefixes(),
            timeout_secs: default_timeout_secs(),
            log_payloads: true,
            log_payload_limit: default_log_payload_limit(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: default_socket_url(),
            path: default_socket_path(),
            device_id: String::new(),
            name: None,
            country_code: None,
            debug: false,
            ack_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join("vaonis-link").join("config.toml"))
}
