//! Paired-server credentials.
//!
//! Pairing itself happens out of band: a sidecar drives the vendor push
//! flow and writes the resulting credentials to a JSON file. This module
//! reads that file and, when a sidecar URL is configured, asks it for
//! fresh credentials after the server starts rejecting the current ones.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::DEFAULT_APP_PORT;

/// Credentials for one paired server, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCredentials {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub player_id: u64,
    pub player_token: i64,
}

fn default_port() -> u16 {
    DEFAULT_APP_PORT
}

/// Source of paired-session credentials.
#[async_trait]
pub trait PairingClient: Send + Sync {
    /// Load the paired credentials. `Ok(None)` when no server has been
    /// paired yet.
    async fn load(&self) -> Result<Option<ServerCredentials>>;

    /// One refresh attempt through the pairing flow, returning and
    /// persisting fresh credentials.
    async fn refresh(&self, current: &ServerCredentials) -> Result<ServerCredentials>;
}

/// File-backed credentials with an optional HTTP sidecar for refresh.
pub struct FilePairing {
    path: PathBuf,
    refresh_url: Option<String>,
    http: reqwest::Client,
}

impl FilePairing {
    pub fn new(path: impl Into<PathBuf>, refresh_url: Option<String>) -> Self {
        Self {
            path: path.into(),
            refresh_url,
            http: reqwest::Client::new(),
        }
    }

    fn read_file(&self) -> Result<Option<ServerCredentials>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let creds = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(creds))
    }

    fn write_file(&self, creds: &ServerCredentials) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(creds).context("failed to serialize credentials")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl PairingClient for FilePairing {
    async fn load(&self) -> Result<Option<ServerCredentials>> {
        self.read_file()
    }

    async fn refresh(&self, current: &ServerCredentials) -> Result<ServerCredentials> {
        let base = self
            .refresh_url
            .as_deref()
            .context("no pairing sidecar configured for credential refresh")?;
        let url = format!("{}/api/pairing/refresh", base.trim_end_matches('/'));
        info!(%url, "requesting fresh credentials from pairing sidecar");

        let fresh: ServerCredentials = self
            .http
            .post(&url)
            .json(current)
            .send()
            .await
            .context("pairing sidecar unreachable")?
            .error_for_status()
            .context("pairing sidecar rejected the refresh request")?
            .json()
            .await
            .context("pairing sidecar returned malformed credentials")?;

        self.write_file(&fresh)?;
        Ok(fresh)
    }
}

/// Load credentials directly from a file path, for probes and one-shot
/// tools that do not need refresh.
pub fn load_credentials(path: &Path) -> Result<Option<ServerCredentials>> {
    FilePairing::new(path, None).read_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_round_trip_camel_case() {
        let creds = ServerCredentials {
            host: "203.0.113.9".to_string(),
            port: 28183,
            player_id: 76561198000000001,
            player_token: -987654321,
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"playerId\""));
        assert!(json.contains("\"playerToken\""));
        let back: ServerCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back, creds);
    }

    #[test]
    fn missing_port_falls_back_to_default() {
        let creds: ServerCredentials = serde_json::from_str(
            r#"{"host": "203.0.113.9", "playerId": 1, "playerToken": 2}"#,
        )
        .unwrap();
        assert_eq!(creds.port, DEFAULT_APP_PORT);
    }

    #[test]
    fn negative_player_token_survives() {
        let creds: ServerCredentials = serde_json::from_str(
            r#"{"host": "h", "port": 28082, "playerId": 9, "playerToken": -2004050113}"#,
        )
        .unwrap();
        assert_eq!(creds.player_token, -2004050113);
    }

    #[test]
    fn missing_file_is_not_paired() {
        let pairing = FilePairing::new("/nonexistent/vendwatch-creds.json", None);
        assert!(pairing.read_file().unwrap().is_none());
    }
}
