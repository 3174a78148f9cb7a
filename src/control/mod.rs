//! The control plane: a Unix domain socket clients use to call tools and
//! inspect or manage supervised servers.
//!
//! See [`protocol`] for the wire format and [`server`] for the socket
//! accept loop and per-connection request dispatch.

pub mod protocol;
pub mod server;

pub use protocol::{ControlRequest, ControlResponse};
pub use server::{bind, serve};
