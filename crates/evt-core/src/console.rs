//! Console capability used by the session engine.
//!
//! Implementations wrap the process's controlling terminal in production and
//! deterministic pipe pairs in tests.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::protocol::TerminalInfo;

/// Local terminal abstraction.
#[async_trait]
pub trait Console: Send {
    /// Put the terminal into raw mode. Must be balanced by `teardown`.
    fn setup(&mut self) -> Result<()>;

    /// Restore the terminal. Idempotent; runs on every engine exit path.
    fn teardown(&mut self);

    /// Read the next chunk of input bytes. Cancel-safe. `None` is EOF.
    async fn read(&mut self) -> Result<Option<Bytes>>;

    /// Write server output to the display.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Current terminal dimensions.
    fn terminal_info(&self) -> TerminalInfo;
}
