//! Console backed by in-memory pipes for deterministic engine tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use evt_core::console::Console;
use evt_core::error::Result;
use evt_core::protocol::TerminalInfo;

/// Console half: handed to the engine.
pub struct PipeConsole {
    input: DuplexStream,
    output: DuplexStream,
    info: Arc<Mutex<TerminalInfo>>,
    set_up: Arc<AtomicBool>,
    torn_down: Arc<AtomicBool>,
}

/// Test half: drives input, observes output and lifecycle.
pub struct PipeConsoleHandle {
    input: DuplexStream,
    output: DuplexStream,
    info: Arc<Mutex<TerminalInfo>>,
    set_up: Arc<AtomicBool>,
    torn_down: Arc<AtomicBool>,
}

/// Build a connected console/handle pair.
///
/// The console starts with a 24x80 terminal; tests change it with
/// [`PipeConsoleHandle::set_terminal_info`].
pub fn pipe_console() -> (PipeConsole, PipeConsoleHandle) {
    let (input_writer, input_reader) = tokio::io::duplex(64 * 1024);
    let (output_writer, output_reader) = tokio::io::duplex(64 * 1024);
    let info = Arc::new(Mutex::new(TerminalInfo {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    }));
    let set_up = Arc::new(AtomicBool::new(false));
    let torn_down = Arc::new(AtomicBool::new(false));

    let console = PipeConsole {
        input: input_reader,
        output: output_writer,
        info: Arc::clone(&info),
        set_up: Arc::clone(&set_up),
        torn_down: Arc::clone(&torn_down),
    };
    let handle = PipeConsoleHandle {
        input: input_writer,
        output: output_reader,
        info,
        set_up,
        torn_down,
    };
    (console, handle)
}

#[async_trait]
impl Console for PipeConsole {
    fn setup(&mut self) -> Result<()> {
        self.set_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }

    async fn read(&mut self) -> Result<Option<Bytes>> {
        let mut buf = [0u8; 16 * 1024];
        match self.input.read(&mut buf).await? {
            0 => Ok(None),
            n => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.output.write_all(data).await?;
        Ok(())
    }

    fn terminal_info(&self) -> TerminalInfo {
        *self.info.lock().unwrap()
    }
}

impl PipeConsoleHandle {
    /// Feed bytes to the engine as if typed.
    pub async fn write_input(&mut self, data: &[u8]) {
        self.input.write_all(data).await.unwrap();
    }

    /// Signal EOF on the console input.
    pub async fn close_input(&mut self) {
        self.input.shutdown().await.unwrap();
    }

    /// Read whatever output the engine has written so far.
    pub async fn read_output(&mut self) -> Vec<u8> {
        let mut buf = [0u8; 16 * 1024];
        let n = self.output.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    /// Change the reported terminal dimensions (a resize event).
    pub fn set_terminal_info(&self, info: TerminalInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn was_set_up(&self) -> bool {
        self.set_up.load(Ordering::SeqCst)
    }

    pub fn was_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}
