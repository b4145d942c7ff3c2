//! Wait configuration
//!
//! Timeouts and check intervals are tuned per call site ("certificate-issued",
//! "domain-ready", ...) and supplied by the caller. There is no global default.
//!
//! ```json
//! {
//!   "policies": {
//!     "certificate-issued": { "max_wait": 1800, "interval": 10 },
//!     "domain-ready": { "max_wait": 1200, "interval": 240, "prompt_on_timeout": true }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wait::PollPolicy;

/// Errors that can occur when loading wait configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid wait configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid poll policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: &'static str },
}

/// Poll policies keyed by call site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default)]
    pub policies: HashMap<String, PollPolicy>,
}

impl WaitConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: WaitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn policy(&self, name: &str) -> Option<&PollPolicy> {
        self.policies.get(name)
    }

    /// Policy for `name`, or `fallback` when the call site is not configured
    pub fn policy_or(&self, name: &str, fallback: PollPolicy) -> PollPolicy {
        self.policy(name).cloned().unwrap_or(fallback)
    }

    pub fn with_policy(mut self, name: impl Into<String>, policy: PollPolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in &self.policies {
            policy
                .validate()
                .map_err(|reason| ConfigError::InvalidPolicy {
                    name: name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}
