//! Bridge configuration: dispatch sizing and shader compile options.
//!
//! Defaults match what the dispatch helpers clamp to. Overrides come from a
//! JSON file or from `METAL_BRIDGE_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

pub const ENV_MAX_THREADS: &str = "METAL_BRIDGE_MAX_THREADS";
pub const ENV_TILE_SIDE: &str = "METAL_BRIDGE_TILE_SIDE";
pub const ENV_FAST_MATH: &str = "METAL_BRIDGE_FAST_MATH";
pub const ENV_LABEL: &str = "METAL_BRIDGE_LABEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound on threads per threadgroup for 1D dispatches.
    pub max_threads_per_threadgroup: usize,
    /// Side of the square threadgroup used for 2D dispatches.
    pub tile_side: usize,
    /// Compile shaders with fast math. Off by default so results are reproducible.
    pub fast_math: bool,
    /// Label attached to queues and command buffers (shows up in GPU captures).
    pub label: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_threads_per_threadgroup: 256,
            tile_side: 16,
            fast_math: false,
            label: "metal-bridge".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by any `METAL_BRIDGE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| BridgeError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment, in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_MAX_THREADS) {
            self.max_threads_per_threadgroup = parse_usize(ENV_MAX_THREADS, &v)?;
        }
        if let Some(v) = lookup(ENV_TILE_SIDE) {
            self.tile_side = parse_usize(ENV_TILE_SIDE, &v)?;
        }
        if let Some(v) = lookup(ENV_FAST_MATH) {
            self.fast_math = parse_bool(ENV_FAST_MATH, &v)?;
        }
        if let Some(v) = lookup(ENV_LABEL) {
            self.label = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads_per_threadgroup == 0 {
            return Err(BridgeError::Config(
                "max_threads_per_threadgroup must be positive".into(),
            ));
        }
        if self.tile_side == 0 || self.tile_side * self.tile_side > self.max_threads_per_threadgroup
        {
            return Err(BridgeError::Config(format!(
                "tile_side {} does not fit in {} threads per threadgroup",
                self.tile_side, self.max_threads_per_threadgroup
            )));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .replace('_', "")
        .parse()
        .map_err(|e| BridgeError::Config(format!("{key}='{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::Config(format!(
            "{key}='{value}': expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_threads_per_threadgroup, 256);
        assert_eq!(config.tile_side, 16);
        assert!(!config.fast_math);
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::default()
            .with_overrides(lookup(&[
                (ENV_MAX_THREADS, "1_024"),
                (ENV_TILE_SIDE, "32"),
                (ENV_FAST_MATH, "on"),
                (ENV_LABEL, "bench"),
            ]))
            .unwrap();
        assert_eq!(config.max_threads_per_threadgroup, 1024);
        assert_eq!(config.tile_side, 32);
        assert!(config.fast_math);
        assert_eq!(config.label, "bench");
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = BridgeConfig::default().with_overrides(|_| None).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_invalid_overrides() {
        assert!(BridgeConfig::default()
            .with_overrides(lookup(&[(ENV_MAX_THREADS, "abc")]))
            .is_err());
        assert!(BridgeConfig::default()
            .with_overrides(lookup(&[(ENV_FAST_MATH, "maybe")]))
            .is_err());
        // 32x32 tiles need 1024 threads
        let err = BridgeConfig::default()
            .with_overrides(lookup(&[(ENV_TILE_SIDE, "32")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_from_json_partial() {
        let config = BridgeConfig::from_json(r#"{"fast_math": true}"#).unwrap();
        assert!(config.fast_math);
        assert_eq!(config.tile_side, 16);
    }

    #[test]
    fn test_from_json_rejects_zero_threads() {
        assert!(BridgeConfig::from_json(r#"{"max_threads_per_threadgroup": 0}"#).is_err());
        assert!(BridgeConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"label": "from-file", "tile_side": 8}}"#).unwrap();
        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.label, "from-file");
        assert_eq!(config.tile_side, 8);

        let missing = file.path().with_extension("missing");
        assert!(BridgeConfig::from_file(&missing).is_err());
    }
}
