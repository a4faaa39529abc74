pub mod capture;
pub mod display;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{AcquisitionError, Result};
pub use manager::AcquisitionManager;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Camera to open when none is given on the command line
    pub device_id: String,
    pub buffer_count: usize,
    /// Upper bound for a device command to report completion
    pub command_timeout_ms: u64,
    /// First completion poll interval, doubled on every retry
    pub command_poll_interval_us: u64,
    /// Run the GigE packet size negotiation after opening
    pub adjust_packet_size: bool,
}

/// Initial output size; `0x0` delivers frames unscaled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device_id: "DEV_SIM_0".into(),
            buffer_count: 3,
            command_timeout_ms: 5000,
            command_poll_interval_us: 100,
            adjust_packet_size: true,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl Config {
    /// Defaults, overridden by an optional TOML file, overridden by
    /// `ACQVIEW__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix("ACQVIEW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.acquisition.buffer_count, 3);
        assert_eq!(config.acquisition.command_timeout_ms, 5000);
        assert!(config.acquisition.adjust_packet_size);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[acquisition]\ndevice_id = \"DEV_1234\"\nbuffer_count = 5\n\n[display]\nwidth = 320"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.acquisition.device_id, "DEV_1234");
        assert_eq!(config.acquisition.buffer_count, 5);
        assert_eq!(config.acquisition.command_poll_interval_us, 100);
        assert_eq!(config.display.width, 320);
        assert_eq!(config.display.height, 600);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/acqview.toml"))).unwrap_err();
        assert!(matches!(err, AcquisitionError::Config(_)));
    }
}
