//! Universe configuration.
//!
//! A [`Config`] is built with builder methods or read from the environment.
//!
//! # Environment Variables
//!
//! | Field | Variable | Description |
//! |-------|----------|-------------|
//! | `universe_size` | `MPIRT_UNIVERSE_SIZE` | Maximum number of live processes |
//! | `default_errors` | `MPIRT_ERRORS` | `fatal` or `return` |
//! | `hostname` | `MPIRT_HOSTNAME` | Host name reported by the runtime |

use crate::error::{Error, ErrorMode, Result};
use std::env;

/// Default host name when none is configured.
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Runtime configuration shared by every process of a universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of simultaneously live processes; `None` is unbounded.
    pub universe_size: Option<usize>,
    /// Error mode given to every new world and self communicator.
    pub default_errors: ErrorMode,
    /// Host name used for processor names and port addresses.
    pub hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            universe_size: None,
            default_errors: ErrorMode::Fatal,
            hostname: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl Config {
    /// Read the configuration from `MPIRT_*` variables, falling back to the
    /// defaults for unset ones.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(size) = env::var("MPIRT_UNIVERSE_SIZE") {
            let size = size.trim().parse::<usize>().map_err(|_| {
                Error::InvalidArg(format!("MPIRT_UNIVERSE_SIZE '{size}' is not a count"))
            })?;
            config.universe_size = Some(size);
        }
        if let Ok(mode) = env::var("MPIRT_ERRORS") {
            config.default_errors = mode.parse()?;
        }
        if let Ok(host) = env::var("MPIRT_HOSTNAME") {
            if !host.trim().is_empty() {
                config.hostname = host.trim().to_string();
            }
        }
        Ok(config)
    }

    /// Bound the number of live processes.
    pub fn with_universe_size(mut self, size: usize) -> Self {
        self.universe_size = Some(size);
        self
    }

    /// Set the error mode of new world and self communicators.
    pub fn with_errors(mut self, mode: ErrorMode) -> Self {
        self.default_errors = mode;
        self
    }

    /// Set the host name.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::default()
            .with_universe_size(8)
            .with_errors(ErrorMode::Return)
            .with_hostname("node01");
        assert_eq!(config.universe_size, Some(8));
        assert_eq!(config.default_errors, ErrorMode::Return);
        assert_eq!(config.hostname, "node01");
    }

    #[test]
    fn from_env_without_variables() {
        // Only meaningful when the variables are not set by the harness.
        if env::var("MPIRT_UNIVERSE_SIZE").is_err()
            && env::var("MPIRT_ERRORS").is_err()
            && env::var("MPIRT_HOSTNAME").is_err()
        {
            assert_eq!(Config::from_env().unwrap(), Config::default());
        }
    }
}
