//! evt-core: Shared library for the everterm protocol and types.
//!
//! This crate provides:
//! - Packet definitions and the wire frame codec
//! - Tunnel specification parsing
//! - Endpoint and session credential types
//! - Error types
//! - Logging setup

pub mod console;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod logging;
pub mod protocol;

pub use endpoint::{SessionCredentials, SocketEndpoint};
pub use error::{Error, Result};
pub use logging::init_logging;
