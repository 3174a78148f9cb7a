//! mcpd: a universal MCP client daemon.
//!
//! Supervises a set of configured Model Context Protocol server processes,
//! aggregates their tools into one namespace, and exposes both over a
//! local Unix control socket.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

use mcpd::config;
use mcpd::daemon::{self, DaemonOptions};

/// Universal MCP client daemon.
#[derive(Parser, Debug)]
#[command(name = "mcpd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the control socket. Overrides both the config file and the
    /// platform default.
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors).
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments, falling back to the
/// config file's level, and finally a hardcoded default: explicit flag >
/// config file level > default.
fn get_log_level(verbose: u8, quiet: bool, config_level: Option<Level>) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => config_level.unwrap_or(Level::WARN),
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging, writing to `log_file` if
/// given and openable, otherwise stderr.
fn init_tracing(level: Level, log_file: Option<&Path>) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("failed to open log file {}: {e}, logging to stderr instead", path.display()))
            .ok()
    });

    match file {
        Some(file) => subscriber.with_writer(std::sync::Mutex::new(file)).init(),
        None => subscriber.with_writer(std::io::stderr).init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // A best-effort preliminary load purely to learn the log level and log
    // file path before tracing is initialised; daemon::run loads the
    // configuration again, validated, once logging is already live.
    let preliminary_config = config::load_config(args.config.as_deref()).ok();
    let config_level = preliminary_config.as_ref().and_then(|c| c.daemon.log_level());
    let config_log_file = preliminary_config.as_ref().and_then(|c| c.daemon.log_file_path.clone());

    let log_level = get_log_level(args.verbose, args.quiet, config_level);
    init_tracing(log_level, config_log_file.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let options = DaemonOptions {
        config_path: args.config,
        socket_path: args.socket,
    };

    match runtime.block_on(daemon::run(options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon exited with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn log_level_quiet_wins_over_verbose() {
        assert_eq!(get_log_level(3, true, Some(Level::DEBUG)), Level::ERROR);
    }

    #[test]
    fn log_level_defaults_to_warn_with_no_config() {
        assert_eq!(get_log_level(0, false, None), Level::WARN);
    }

    #[test]
    fn log_level_uses_config_when_no_flags_given() {
        assert_eq!(get_log_level(0, false, Some(Level::DEBUG)), Level::DEBUG);
    }

    #[test]
    fn log_level_explicit_flag_wins_over_config() {
        assert_eq!(get_log_level(2, false, Some(Level::TRACE)), Level::DEBUG);
    }
}
