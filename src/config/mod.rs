//! Daemon configuration: loading, env interpolation, and validation.
//!
//! # Configuration file location
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via `--config` CLI flag
//! 2. Default location:
//!    - **Linux/macOS:** `~/.config/mcpd/config.toml`
//!    - **Windows:** `%APPDATA%\mcpd\config.toml`
//!
//! # Format
//!
//! A `[daemon]` table of daemon-wide settings and one `[[server]]` table
//! per supervised MCP server. See [`settings::DaemonConfig`] for field
//! documentation.

mod settings;

pub use settings::{DaemonConfig, DaemonSettings, RestartPolicyConfig, ServerSpec};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mcpd"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.toml"))
}

/// Returns the default control socket path.
#[must_use]
pub fn default_socket_path() -> Option<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|p| p.join("mcpd.sock"))
}

/// Returns the default PID file path, alongside the socket.
#[must_use]
pub fn default_pid_path() -> Option<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|p| p.join("mcpd.pid"))
}

/// Loads, interpolates, and validates the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location.
///
/// # Errors
///
/// Returns an error if the file cannot be found or read, the TOML is
/// malformed, or validation fails (duplicate server ids, empty argv,
/// malformed duration suffixes).
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from("<default config path>"),
        })?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let raw = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let interpolated = interpolate_env(&raw);

    let config: DaemonConfig =
        toml::from_str(&interpolated).map_err(|e| ConfigError::ParseError {
            path: config_path.clone(),
            source: Box::new(e),
        })?;

    config.validate()?;

    Ok(config)
}

/// Expands `$VAR` and `${VAR}` references against the process environment.
///
/// An unset variable is left untouched (including its `$`/`${}` syntax)
/// rather than erroring or collapsing to an empty string, so a config file
/// that simply doesn't use env interpolation never depends on this
/// function's behaviour.
#[must_use]
pub fn interpolate_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c2) in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c2);
                }
                if closed {
                    if let Ok(value) = std::env::var(&name) {
                        out.push_str(&value);
                    } else {
                        out.push_str("${");
                        out.push_str(&name);
                        out.push('}');
                    }
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(&(_, c2)) if c2.is_ascii_alphabetic() || c2 == '_' => {
                let mut name = String::new();
                while let Some(&(_, c3)) = chars.peek() {
                    if c3.is_ascii_alphanumeric() || c3 == '_' {
                        name.push(c3);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Ok(value) = std::env::var(&name) {
                    out.push_str(&value);
                } else {
                    out.push('$');
                    out.push_str(&name);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Expands `~` to the user's home directory in a path string.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_with_path() {
        let expanded = expand_tilde("~/.config/mcpd/config.toml");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("mcpd/config.toml"));
    }

    #[test]
    fn expand_tilde_no_tilde() {
        let path = "/absolute/path/to/config.toml";
        assert_eq!(expand_tilde(path), PathBuf::from(path));
    }

    #[test]
    fn interpolate_env_curly_form() {
        std::env::set_var("MCPD_TEST_TOKEN", "secret123");
        let result = interpolate_env("token = \"${MCPD_TEST_TOKEN}\"");
        assert_eq!(result, "token = \"secret123\"");
        std::env::remove_var("MCPD_TEST_TOKEN");
    }

    #[test]
    fn interpolate_env_bare_form() {
        std::env::set_var("MCPD_TEST_HOME", "/home/fake");
        let result = interpolate_env("path = \"$MCPD_TEST_HOME/bin\"");
        assert_eq!(result, "path = \"/home/fake/bin\"");
        std::env::remove_var("MCPD_TEST_HOME");
    }

    #[test]
    fn interpolate_env_leaves_unset_vars_untouched() {
        let result = interpolate_env("x = \"${MCPD_DEFINITELY_UNSET_VAR}\"");
        assert_eq!(result, "x = \"${MCPD_DEFINITELY_UNSET_VAR}\"");
    }

    #[test]
    fn default_config_path_contains_mcpd() {
        let path = default_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().to_string_lossy().contains("mcpd"));
    }
}
