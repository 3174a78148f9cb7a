//! Configuration structures for deserialisation.
//!
//! These map directly onto the TOML configuration file format: one
//! `[daemon]` table and a list of `[[server]]` tables.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::Level;

use crate::error::ConfigError;

/// Root configuration structure, matching the TOML config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Daemon-wide settings. Optional; every field has a default.
    #[serde(default)]
    pub daemon: DaemonSettings,

    /// One entry per supervised MCP server.
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerSpec>,
}

impl DaemonConfig {
    /// Validates the configuration as a whole.
    ///
    /// # Errors
    ///
    /// Returns an error if `server_id`s are empty or duplicated, if any
    /// server's command is empty, or if a duration field fails to parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daemon.validate()?;

        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError {
                message: "at least one [[server]] must be configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.server_id.clone()) {
                return Err(ConfigError::ValidationError {
                    message: format!("duplicate server_id: {}", server.server_id),
                });
            }
        }

        Ok(())
    }
}

/// Daemon-wide settings shared by every supervised server.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSettings {
    /// Path to the control socket. Defaults to the platform runtime
    /// directory when unset.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Where to write structured logs. `None` means stderr.
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,

    /// Minimum log level, used when neither `-v`/`-q` was given on the
    /// command line. One of `trace`, `debug`, `info`, `warn`, `error`
    /// (case-insensitive).
    #[serde(default)]
    log_level: Option<String>,

    /// The deadline applied to a `tool_call` that does not override its
    /// own `timeout`.
    #[serde(default = "default_call_timeout")]
    default_call_timeout: String,

    /// How long to wait for a child's `initialize` response before treating
    /// startup as failed.
    #[serde(default = "default_handshake_timeout")]
    handshake_timeout: String,

    /// How often a ready connection is health-checked with its
    /// `health_check_tool`, if it has one.
    #[serde(default = "default_health_check_interval")]
    health_check_interval: String,

    /// Restart policy applied after an unexpected child exit.
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_file_path: None,
            log_level: None,
            default_call_timeout: default_call_timeout(),
            handshake_timeout: default_handshake_timeout(),
            health_check_interval: default_health_check_interval(),
            restart_policy: RestartPolicyConfig::default(),
        }
    }
}

impl DaemonSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        parse_duration(&self.default_call_timeout)?;
        parse_duration(&self.handshake_timeout)?;
        parse_duration(&self.health_check_interval)?;
        if let Some(level) = &self.log_level {
            parse_log_level(level)?;
        }
        self.restart_policy.validate()
    }

    #[must_use]
    pub fn default_call_timeout(&self) -> Duration {
        parse_duration(&self.default_call_timeout).expect("validated at load time")
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        parse_duration(&self.handshake_timeout).expect("validated at load time")
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        parse_duration(&self.health_check_interval).expect("validated at load time")
    }

    /// The configured minimum log level, if the config file set one.
    ///
    /// # Panics
    ///
    /// Never panics on a config that already passed [`DaemonConfig::validate`].
    #[must_use]
    pub fn log_level(&self) -> Option<Level> {
        self.log_level
            .as_deref()
            .map(|level| parse_log_level(level).expect("validated at load time"))
    }
}

fn default_call_timeout() -> String {
    "30s".to_string()
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

fn default_health_check_interval() -> String {
    "60s".to_string()
}

fn parse_log_level(input: &str) -> Result<Level, ConfigError> {
    Level::from_str(input).map_err(|_| ConfigError::ValidationError {
        message: format!("invalid log level '{input}': expected trace, debug, info, warn, or error"),
    })
}

/// Exponential backoff policy for automatic restarts.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicyConfig {
    /// Delay before the first restart attempt.
    #[serde(default = "default_initial_backoff")]
    initial_backoff: String,

    /// Upper bound the backoff delay never exceeds.
    #[serde(default = "default_max_backoff")]
    max_backoff: String,

    /// Consecutive failures after which the supervisor gives up and moves
    /// to the `Error` state instead of restarting again.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl RestartPolicyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        parse_duration(&self.initial_backoff)?;
        parse_duration(&self.max_backoff)?;
        Ok(())
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        parse_duration(&self.initial_backoff).expect("validated at load time")
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        parse_duration(&self.max_backoff).expect("validated at load time")
    }
}

fn default_initial_backoff() -> String {
    "500ms".to_string()
}

fn default_max_backoff() -> String {
    "5s".to_string()
}

const fn default_max_restarts() -> u32 {
    3
}

/// One supervised MCP server: how to launch it and with what priority its
/// tools win collisions against other servers.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSpec {
    /// Unique identifier used for qualified tool lookup (`server_id/tool`)
    /// and in control-plane responses.
    pub server_id: String,

    /// A human-readable description, surfaced in `server_status`/`daemon_status`.
    #[serde(default)]
    pub description: Option<String>,

    /// Executable to spawn.
    pub command: String,

    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables set on the child, merged over the
    /// daemon's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child. Defaults to the daemon's own cwd.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Collision priority: lower wins. Servers with equal priority fall
    /// back to discovery order (first-discovered wins).
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// If `false`, the server is parsed but never started automatically;
    /// it can still be started on demand via the control socket.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// How long this server may sit idle (no in-flight calls) before its
    /// supervisor stops it to free resources. Zero means never idle-shut.
    /// Use the [`ServerSpec::idle_timeout`] accessor to get a parsed
    /// [`Duration`].
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// Name of a tool invoked periodically to verify the server is still
    /// responsive. `None` disables health checking for this server.
    #[serde(default)]
    pub health_check_tool: Option<String>,
}

impl ServerSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server_id cannot be empty".to_string(),
            });
        }
        if self.command.is_empty() {
            return Err(ConfigError::ValidationError {
                message: format!("server '{}' has an empty command", self.server_id),
            });
        }
        parse_duration(&self.idle_timeout)?;
        Ok(())
    }

    /// The idle timeout as a parsed [`Duration`]. Zero means idle-reap is
    /// disabled for this server.
    ///
    /// # Panics
    ///
    /// Never panics on a config that already passed [`DaemonConfig::validate`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.idle_timeout).expect("validated at load time")
    }
}

const fn default_priority() -> i32 {
    0
}

const fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> String {
    "10m".to_string()
}

/// Parses a duration string with a mandatory unit suffix: `s`, `m`, or `h`.
///
/// This is deliberately stricter than a bare integer (which unit would it
/// be?) and deliberately does not accept compound forms like `1h30m`.
fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::ValidationError {
        message: format!("invalid duration '{input}': expected a number followed by s, m, or h"),
    };

    let suffix_len = if input.ends_with("ms") { 2 } else { 1 };
    if input.len() <= suffix_len {
        return Err(invalid());
    }
    let (number, unit) = input.split_at(input.len() - suffix_len);
    let number: u64 = number.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(invalid()),
    }
}
