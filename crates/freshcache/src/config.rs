//! Facade configuration and a format-agnostic file loader

use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    envelope::EnvelopeCodec,
    keyspace::{instance_id, KeySpace},
    CacheError, Result,
};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace seed for physical keys; defaults to the application instance id
    pub key_prefix: Option<String>,
    /// TTL in seconds applied when a write does not pass one; 0 = never expire
    pub default_ttl: u64,
    /// Deflate envelopes whose JSON exceeds this many bytes
    pub compression_threshold: Option<usize>,
    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: None,
            default_ttl: 0,
            compression_threshold: None,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone().unwrap_or_else(instance_id))
    }

    pub fn codec(&self) -> EnvelopeCodec {
        match self.compression_threshold {
            Some(threshold) => EnvelopeCodec::with_compression_threshold(threshold),
            None => EnvelopeCodec::new(),
        }
    }
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parse configuration text in the given format
pub fn load_from_str<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> Result<T> {
    let parsed = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| {
        CacheError::configuration(format!("failed to parse {:?} configuration: {}", format, message))
    })
}

/// Load configuration from a file, picking the format from its extension
pub fn load_from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ConfigFormat::from_extension)
        .ok_or_else(|| {
            CacheError::configuration(format!(
                "unsupported configuration file format: {}",
                path.display()
            ))
        })?;
    let content = std::fs::read_to_string(path).map_err(|e| {
        CacheError::configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    load_from_str(&content, format)
}
