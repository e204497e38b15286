//! Runtime configuration
//!
//! All settings have defaults matching the reference hardware and can be overridden through
//! the environment:
//!
//! | Variable                     | Setting                         | Default       |
//! |------------------------------|---------------------------------|---------------|
//! | `HWC_BACKEND`                | [`Config::backend`]             | `oneplane-du` |
//! | `HWC_ONE_LAYER_ENHANCEMENT`  | [`Config::one_layer_enhancement`] | `1`         |
//! | `HWC_BO_CACHE_SIZE`          | [`Config::cache_capacity`]      | `6`           |
//! | `HWC_HW_ALIGN`               | [`Config::hw_align`]            | `64`          |

use std::{env, num::ParseIntError};

use tracing::debug;

use crate::backend::composition::{BackendKind, UnknownBackend};

/// Environment variable selecting the composition backend
pub const BACKEND_VAR: &str = "HWC_BACKEND";
/// Environment variable toggling the single layer fast path
pub const ONE_LAYER_ENHANCEMENT_VAR: &str = "HWC_ONE_LAYER_ENHANCEMENT";
/// Environment variable setting the buffer cache capacity
pub const BO_CACHE_SIZE_VAR: &str = "HWC_BO_CACHE_SIZE";
/// Environment variable setting the scan-out width alignment
pub const HW_ALIGN_VAR: &str = "HWC_HW_ALIGN";

/// Errors thrown when reading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The backend name is not known
    #[error("invalid value for HWC_BACKEND: {0}")]
    Backend(#[from] UnknownBackend),
    /// A boolean setting could not be parsed
    #[error("invalid boolean value `{value}` for {var}")]
    Bool {
        /// Variable holding the value
        var: &'static str,
        /// The offending value
        value: String,
    },
    /// A numeric setting could not be parsed
    #[error("invalid number `{value}` for {var}")]
    Number {
        /// Variable holding the value
        var: &'static str,
        /// The offending value
        value: String,
        /// Underlying parse error
        #[source]
        source: ParseIntError,
    },
    /// The alignment is zero or not a power of two
    #[error("hardware alignment must be a non-zero power of two, got {0}")]
    InvalidAlignment(u32),
}

/// Configuration of the composition backend and buffer cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Composition policy
    pub backend: BackendKind,
    /// Present a single importable layer directly, see [`Backend`](crate::backend::composition::Backend)
    pub one_layer_enhancement: bool,
    /// Number of bindings the buffer cache holds before releases start sweeping it
    pub cache_capacity: usize,
    /// Alignment in pixels of scan-out line widths
    pub hw_align: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendKind::OnePlane,
            one_layer_enhancement: true,
            cache_capacity: 6,
            hw_align: 64,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// Unset variables keep their default value.
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|var| env::var(var).ok())
    }

    /// Read the configuration from an arbitrary key-value source.
    ///
    /// `lookup` is queried with the variable names listed in the [module docs](self).
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Config::default();
        let lookup = |var| lookup(var).map(|value| value.trim().to_owned());

        if let Some(value) = lookup(BACKEND_VAR) {
            config.backend = value.parse()?;
        }
        if let Some(value) = lookup(ONE_LAYER_ENHANCEMENT_VAR) {
            config.one_layer_enhancement = parse_bool(ONE_LAYER_ENHANCEMENT_VAR, value)?;
        }
        if let Some(value) = lookup(BO_CACHE_SIZE_VAR) {
            config.cache_capacity = value.parse().map_err(|source| ConfigError::Number {
                var: BO_CACHE_SIZE_VAR,
                value,
                source,
            })?;
        }
        if let Some(value) = lookup(HW_ALIGN_VAR) {
            config.hw_align = value.parse().map_err(|source| ConfigError::Number {
                var: HW_ALIGN_VAR,
                value,
                source,
            })?;
        }

        if !config.hw_align.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(config.hw_align));
        }

        debug!(?config, "loaded configuration");
        Ok(config)
    }
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::Bool { var, value }),
    }
}
