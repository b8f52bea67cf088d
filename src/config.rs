//! Sandbox configuration.

use crate::error::{Result, SandboxError};
use std::path::PathBuf;

pub const ALLOWED_ORIGINS_ENV: &str = "REALM_SANDBOX_ALLOWED_ORIGINS";
pub const ECHO_CONSOLE_ENV: &str = "REALM_SANDBOX_ECHO_CONSOLE";
pub const HOST_DIR_ENV: &str = "REALM_SANDBOX_HOST_DIR";

/// Configuration shared by every realm a sandbox creates.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base directory for relative `require` specifiers
    pub host_base_dir: PathBuf,
    /// Allowed origins for fetch() (empty = fetch disabled)
    pub allowed_origins: Vec<String>,
    /// Also print captured console output to stderr
    pub echo_console: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host_base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            allowed_origins: vec![],
            echo_console: false,
        }
    }
}

impl SandboxConfig {
    /// Defaults overlaid with the `REALM_SANDBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(origins) = std::env::var(ALLOWED_ORIGINS_ENV) {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(|o| o.trim_end_matches('/').to_string())
                .collect();
        }

        if let Ok(echo) = std::env::var(ECHO_CONSOLE_ENV) {
            config.echo_console = parse_bool(ECHO_CONSOLE_ENV, &echo)?;
        }

        if let Ok(dir) = std::env::var(HOST_DIR_ENV) {
            config.host_base_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

/// Strict boolean parsing for text boundaries: anything but `true`/`false`
/// is rejected.
pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(SandboxError::InvalidArgument(format!(
            "{} must be true or false, got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert!(config.allowed_origins.is_empty());
        assert!(!config.echo_console);
    }

    #[test]
    fn test_parse_bool_is_strict() {
        assert!(parse_bool("insulation", "true").unwrap());
        assert!(!parse_bool("insulation", " false ").unwrap());
        let err = parse_bool("insulation", "yes").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument(_)));
        assert!(err.to_string().contains("insulation"));
    }
}
