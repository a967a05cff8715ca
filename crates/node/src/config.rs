//! Node Configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bisection_game::VerifierConfig;
use ledger_forest::DEFAULT_COMMIT_INTERVAL;

/// Default tree dimension for builds and verification
pub const DEFAULT_DIM: usize = 50;

/// Node configuration, loadable from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Sled database directory
    pub db: PathBuf,
    /// Ledger server bind address
    pub addr: String,
    /// Build settings
    pub build: BuildConfig,
    /// Verification settings
    pub verify: VerifyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db: PathBuf::from("./data"),
            addr: "127.0.0.1:8000".to_string(),
            build: BuildConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a config file; keys missing from the file keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Ledger build settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    /// Tree dimension
    pub dim: usize,
    /// Leaves appended between durable commits
    pub commit_interval: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dim: DEFAULT_DIM,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
        }
    }
}

/// Verifier settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Tree dimension every peer must use
    pub dim: usize,
    /// Tournaments per verifier
    pub runs: usize,
    /// Verifiers running side by side
    pub parallel: usize,
    /// Per-round deadline in milliseconds (none waits forever)
    pub round_timeout_ms: Option<u64>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            dim: DEFAULT_DIM,
            runs: 1,
            parallel: 1,
            round_timeout_ms: None,
        }
    }
}

impl VerifyConfig {
    pub fn verifier_config(&self) -> VerifierConfig {
        let config = VerifierConfig::new(self.dim);
        match self.round_timeout_ms {
            Some(ms) => config.with_round_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }
}
