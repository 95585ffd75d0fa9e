// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine configuration.
//!
//! Settings are stored as RON:
//!
//! ```ron
//! (
//!     phase1_workers: 4,
//!     default_width: 512,
//!     default_height: 512,
//!     default_pixel_format: Rgba16F,
//! )
//! ```
//!
//! Every field is optional and falls back to [`EngineConfig::default`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use texgraph_gpu::PixelFormat;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads running parameter resolution. Zero resolves inline.
    pub phase1_workers: usize,
    /// Width given to new nodes
    pub default_width: u32,
    /// Height given to new nodes
    pub default_height: u32,
    /// Pixel format given to new graphs and nodes
    pub default_pixel_format: PixelFormat,
    /// Whether new nodes go through the scheduler
    pub default_asynchronous: bool,
    /// Directory, relative to a graph or archive, holding sub-graph resources
    pub resource_dir: String,
    /// Extension of plain-text graph files
    pub graph_extension: String,
    /// Extension of archived graphs
    pub archive_extension: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phase1_workers: 2,
            default_width: 256,
            default_height: 256,
            default_pixel_format: PixelFormat::Rgba,
            default_asynchronous: false,
            resource_dir: "resources".to_string(),
            graph_extension: "mtg".to_string(),
            archive_extension: "mtga".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse settings from RON text
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a RON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_ron_str(&text)
    }

    /// Serialize settings to pretty RON
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_width == 0 || self.default_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "default size must be non-zero, got {}x{}",
                self.default_width, self.default_height
            )));
        }
        if self.graph_extension.is_empty() || self.archive_extension.is_empty() {
            return Err(ConfigError::Invalid("file extensions must not be empty".to_string()));
        }
        if self.graph_extension.eq_ignore_ascii_case(&self.archive_extension) {
            return Err(ConfigError::Invalid(
                "graph and archive extensions must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `path` names an archived graph
    pub fn is_archive_path(&self, path: &str) -> bool {
        has_extension(path, &self.archive_extension)
    }

    /// Whether `path` names a plain-text graph
    pub fn is_graph_path(&self, path: &str) -> bool {
        has_extension(path, &self.graph_extension)
    }
}

fn has_extension(path: &str, ext: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Configuration failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(String),
    /// RON could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}
