pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Streaming device node; an empty string selects auto-detection.
    pub device: String,
    /// Sensor sub-device carrying focus and test-pattern controls.
    pub subdevice: String,
    pub width: u32,
    pub height: u32,
    /// Buffers requested from the kernel; the granted count may be lower.
    pub buffer_count: u32,
    /// Export a DMA descriptor for every mapped plane.
    pub dma_export: bool,
    /// Stop after this many rendered frames; 0 keeps capturing until quit.
    pub capture_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video3".into(),
            subdevice: "/dev/v4l-subdev10".into(),
            width: 1920,
            height: 1080,
            buffer_count: 4,
            dma_export: false,
            capture_count: 0,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fullscreen: true,
        }
    }
}

impl Config {
    /// Layer defaults, an optional `helios.toml`, and `HELIOS_*` overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name("helios").required(false))
            .add_source(config::Environment::with_prefix("HELIOS").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_options() {
        let config = Config::default();
        assert_eq!(config.capture.device, "/dev/video3");
        assert_eq!(config.capture.subdevice, "/dev/v4l-subdev10");
        assert_eq!(config.capture.buffer_count, 4);
        assert!(!config.capture.dma_export);
        assert_eq!(config.capture.capture_count, 0);
        assert_eq!((config.capture.width, config.capture.height), (1920, 1080));
    }
}
