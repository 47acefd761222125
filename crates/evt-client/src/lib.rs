//! evt-client: the everterm client.
//!
//! Provides the session engine and its collaborators:
//! - TCP transport and the reliable reconnecting channel
//! - Console abstraction with a raw-mode terminal implementation
//! - Port-forward handler for source and reverse tunnels
//! - CLI parsing and ssh-based session bootstrap

pub mod channel;
pub mod cli;
pub mod console;
pub mod engine;
pub mod forward;
pub mod ssh;
pub mod transport;

pub use channel::{ChannelConfig, ReliableChannel};
pub use cli::Cli;
pub use console::{Console, PtyConsole};
pub use engine::{EngineConfig, SessionEngine};
pub use forward::PortForwardHandler;
pub use transport::TcpTransport;
