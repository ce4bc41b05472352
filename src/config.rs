use crate::error::{OpError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Multiply-accumulate count below which kernels stay on the calling thread.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 16;

pub const ENV_PROVIDER: &str = "QFUSE_PROVIDER";
pub const ENV_NUM_THREADS: &str = "QFUSE_NUM_THREADS";
pub const ENV_PARALLEL_THRESHOLD: &str = "QFUSE_PARALLEL_THRESHOLD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Optimized first, reference as fallback.
    #[default]
    Auto,
    Reference,
    Optimized,
}

impl FromStr for ProviderKind {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ProviderKind::Auto),
            "reference" | "ref" => Ok(ProviderKind::Reference),
            "optimized" | "opt" => Ok(ProviderKind::Optimized),
            other => Err(OpError::Config(format!("unknown provider '{}'", other))),
        }
    }
}

/// Engine settings, read from a toml file or the environment.
///
/// ```toml
/// provider = "optimized"
/// num_threads = 4
/// parallel_threshold = 65536
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    /// Dedicated pool size; `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
    pub parallel_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Auto,
            num_threads: None,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| OpError::Config(e.to_string()))?;
        config.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| OpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by any `QFUSE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_PROVIDER) {
            config.provider = v.parse()?;
        }
        if let Some(v) = lookup(ENV_NUM_THREADS) {
            config.num_threads = Some(parse_usize(ENV_NUM_THREADS, &v)?);
        }
        if let Some(v) = lookup(ENV_PARALLEL_THRESHOLD) {
            config.parallel_threshold = parse_usize(ENV_PARALLEL_THRESHOLD, &v)?;
        }
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.num_threads == Some(0) {
            return Err(OpError::Config("num_threads must be at least 1".into()));
        }
        Ok(self)
    }
}

fn parse_usize(key: &str, v: &str) -> Result<usize> {
    v.trim()
        .parse()
        .map_err(|_| OpError::Config(format!("{}: expected an unsigned integer, got '{}'", key, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_toml_partial() {
        let cfg = EngineConfig::from_toml_str("provider = \"reference\"\nnum_threads = 2\n").unwrap();
        assert_eq!(cfg.provider, ProviderKind::Reference);
        assert_eq!(cfg.num_threads, Some(2));
        assert_eq!(cfg.parallel_threshold, DEFAULT_PARALLEL_THRESHOLD);

        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
        assert!(EngineConfig::from_toml_str("provider = \"gpu\"").is_err());
        assert!(EngineConfig::from_toml_str("num_threads = 0").is_err());
    }

    #[test]
    fn test_env_lookup() {
        let vars: HashMap<&str, &str> = [(ENV_PROVIDER, "Optimized"), (ENV_PARALLEL_THRESHOLD, "128")].into();
        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.provider, ProviderKind::Optimized);
        assert_eq!(cfg.num_threads, None);
        assert_eq!(cfg.parallel_threshold, 128);

        let bad = EngineConfig::from_lookup(|k| (k == ENV_NUM_THREADS).then(|| "many".to_string()));
        assert!(matches!(bad, Err(OpError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/qfuse.toml").unwrap_err();
        assert!(err.to_string().contains("qfuse.toml"));
    }
}
