//! mcpd: a universal MCP client daemon.
//!
//! The daemon supervises a set of configured Model Context Protocol server
//! processes, aggregates their tool catalogs into one namespace with
//! deterministic collision resolution, and exposes both to local clients
//! over a Unix control socket.
//!
//! # Modules
//!
//! - [`error`] — Error types shared across every subsystem
//! - [`protocol`] — JSON-RPC 2.0 wire types and line framing for the MCP
//!   child protocol
//! - [`connection`] — A single stdio connection to one MCP server child:
//!   request/response correlation, progress, cancellation, deadlines
//! - [`config`] — Daemon configuration loading and validation
//! - [`supervisor`] — Child process lifecycle: spawn, handshake, health,
//!   restart policy
//! - [`registry`] — The aggregated tool catalog and collision resolution
//! - [`router`] — Resolves a tool call to a server and drives it through
//!   its supervisor's connection
//! - [`control`] — The control-plane Unix socket server and wire protocol
//! - [`daemon`] — Process bootstrap, signal handling, shutdown sequencing

pub mod config;
pub mod connection;
pub mod control;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod supervisor;
