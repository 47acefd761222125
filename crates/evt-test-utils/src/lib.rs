//! Test support for everterm.
//!
//! Provides deterministic substitutes for the client's external edges:
//! - [`PipeConsole`]: a console backed by in-memory pipes
//! - [`MockServer`]: an in-process server speaking the resume handshake and
//!   frame codec, with scripted drops and packet capture

mod mock_server;
mod pipe_console;

pub use mock_server::MockServer;
pub use pipe_console::{pipe_console, PipeConsole, PipeConsoleHandle};
