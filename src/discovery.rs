//! Base URL detection.
//!
//! The instrument serves its API either directly (`http://host:port/v1`) or
//! under a simulation root such as `/stellina/http/v1`. Candidates are tried
//! in configured order against [`HEALTH_PATH`]; the first success wins.

use std::future::Future;

use tracing::{debug, info};

use crate::error::{Result, VaonisError};

/// Prefixes tried when none are configured.
pub const DEFAULT_PREFIXES: [&str; 3] = ["", "/stellina/http", "/vespera/http"];

/// Unauthenticated endpoint used for probing and for status snapshots.
pub const HEALTH_PATH: &str = "/app/status";

#[derive(Debug, Clone)]
pub struct BaseUrlResolver {
    host: String,
    port: u16,
    api_base_path: String,
    prefixes: Vec<String>,
}

impl BaseUrlResolver {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        api_base_path: impl Into<String>,
        prefixes: Vec<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            api_base_path: api_base_path.into(),
            prefixes,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// `http://<host>:<port><prefix><apiBasePath>` without a trailing slash.
    pub fn candidate(&self, prefix: &str) -> String {
        format!(
            "http://{}:{}{}{}",
            self.host, self.port, prefix, self.api_base_path
        )
        .trim_end_matches('/')
        .to_string()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.prefixes.iter().map(|p| self.candidate(p)).collect()
    }

    /// Returns the first candidate whose health URL satisfies `is_up`.
    ///
    /// `is_up` receives the full health URL and reports whether it answered
    /// with a success status. Candidates are evaluated strictly in order.
    pub async fn detect<F, Fut>(&self, mut is_up: F) -> Result<String>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut tried = Vec::with_capacity(self.prefixes.len());

        for candidate in self.candidates() {
            let health = format!("{}{}", candidate, HEALTH_PATH);
            debug!(url = %health, "Checking base URL candidate");
            if is_up(health).await {
                info!(base_url = %candidate, "Detected instrument base URL");
                return Ok(candidate);
            }
            tried.push(candidate);
        }

        Err(VaonisError::BaseUrlNotDetected { tried })
    }
}
