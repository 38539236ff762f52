use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use permission_kernel_core::ResolutionPolicy;
use serde::{Deserialize, Serialize};

const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_CACHE_IDLE_SECS: u64 = 120;

fn default_audit_interval_secs() -> u64 {
    DEFAULT_AUDIT_INTERVAL_SECS
}

fn default_cache_idle_secs() -> u64 {
    DEFAULT_CACHE_IDLE_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(default)]
    pub policy: ResolutionPolicy,
    /// Seconds between sweeps that remove expired nodes.
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    /// Seconds a cached entry may go unread before the audit sweep drops it.
    #[serde(default = "default_cache_idle_secs")]
    pub cache_idle_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            policy: ResolutionPolicy::default(),
            audit_interval_secs: DEFAULT_AUDIT_INTERVAL_SECS,
            cache_idle_secs: DEFAULT_CACHE_IDLE_SECS,
        }
    }
}

impl KernelConfig {
    /// Load a config file, choosing the format from its extension.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, has an unsupported
    /// extension, or fails to parse or validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        let config = match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&raw),
            "json" => Self::from_json_str(&raw),
            other => Err(anyhow!("unsupported config extension `{other}`")),
        };
        config.with_context(|| format!("invalid config {}", path.display()))
    }

    /// # Errors
    /// Returns an error on malformed YAML, unknown fields, or invalid values.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error on malformed JSON, unknown fields, or invalid values.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("failed to parse JSON config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.audit_interval_secs == 0 {
            bail!("audit_interval_secs MUST be greater than zero");
        }
        if self.cache_idle_secs == 0 {
            bail!("cache_idle_secs MUST be greater than zero");
        }
        Ok(())
    }

    #[must_use]
    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    #[must_use]
    pub fn cache_idle(&self) -> Duration {
        Duration::from_secs(self.cache_idle_secs)
    }
}
