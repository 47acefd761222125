//! Console abstraction for the local terminal.
//!
//! The session engine talks to a [`Console`] trait so tests can substitute a
//! deterministic pipe-backed pair. The production implementation wraps the
//! process's controlling terminal: raw-mode setup with guaranteed
//! restoration, an async non-blocking stdin reader, and a stdout writer that
//! tolerates a slow terminal.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use evt_core::constants::CONSOLE_BUF_SIZE;
use evt_core::error::{Error, Result};
use evt_core::protocol::TerminalInfo;

pub use evt_core::console::Console;

/// Console backed by the process's controlling terminal.
pub struct PtyConsole {
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    saved_termios: Option<libc::termios>,
    stdin: Option<AsyncFd<RawFd>>,
}

impl PtyConsole {
    pub fn new() -> Self {
        Self {
            stdin_fd: io::stdin().as_raw_fd(),
            stdout_fd: io::stdout().as_raw_fd(),
            saved_termios: None,
            stdin: None,
        }
    }
}

impl Default for PtyConsole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Console for PtyConsole {
    fn setup(&mut self) -> Result<()> {
        // Save current terminal attributes
        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(self.stdin_fd, termios.as_mut_ptr()) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let original = unsafe { termios.assume_init() };
        self.saved_termios = Some(original);

        // Raw mode: no echo, no canonical buffering, no signal generation,
        // no flow control, 8-bit clean
        let mut raw = original;
        raw.c_iflag &= !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
        raw.c_oflag &= !libc::OPOST;
        raw.c_cflag |= libc::CS8;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::IEXTEN | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        if unsafe { libc::tcsetattr(self.stdin_fd, libc::TCSAFLUSH, &raw) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Non-blocking stdin for readiness-driven reads
        unsafe {
            let flags = libc::fcntl(self.stdin_fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(self.stdin_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        self.stdin = Some(AsyncFd::new(self.stdin_fd)?);

        debug!("entered raw terminal mode");
        Ok(())
    }

    fn teardown(&mut self) {
        self.stdin = None;
        unsafe {
            let flags = libc::fcntl(self.stdin_fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(self.stdin_fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
            }
        }
        if let Some(original) = self.saved_termios.take() {
            if unsafe { libc::tcsetattr(self.stdin_fd, libc::TCSAFLUSH, &original) } != 0 {
                warn!("failed to restore terminal settings");
            } else {
                debug!("restored terminal settings");
            }
        }
    }

    async fn read(&mut self) -> Result<Option<Bytes>> {
        let async_fd = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::protocol("console read before setup"))?;
        let mut buf = [0u8; CONSOLE_BUF_SIZE];

        loop {
            let mut guard = async_fd.readable().await.map_err(Error::Io)?;

            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        *inner.get_ref(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    debug!("console EOF");
                    return Ok(None);
                }
                Ok(Ok(n)) => return Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(Error::Io(e)),
                // Spurious wakeup, wait again
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        // Synchronous writes with a short yield on a full terminal buffer;
        // stdout stays in blocking mode so partial progress is rare.
        let mut written = 0;
        let mut retries = 0u32;
        const MAX_RETRIES: u32 = 10;

        while written < data.len() {
            let n = unsafe {
                libc::write(
                    self.stdout_fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if n >= 0 {
                written += n as usize;
                retries = 0;
                continue;
            }
            let e = io::Error::last_os_error();
            match e.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        warn!(written, total = data.len(), "terminal too slow, dropping output");
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_micros(100)).await;
                }
                _ => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn terminal_info(&self) -> TerminalInfo {
        let mut winsize = std::mem::MaybeUninit::<libc::winsize>::uninit();
        let result = unsafe { libc::ioctl(self.stdout_fd, libc::TIOCGWINSZ, winsize.as_mut_ptr()) };
        if result != 0 {
            // Not a tty (pipes, CI): fall back to a sane default
            return TerminalInfo {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            };
        }
        let winsize = unsafe { winsize.assume_init() };
        TerminalInfo {
            rows: winsize.ws_row,
            cols: winsize.ws_col,
            pixel_width: winsize.ws_xpixel,
            pixel_height: winsize.ws_ypixel,
        }
    }
}

impl Drop for PtyConsole {
    fn drop(&mut self) {
        // Engine teardown normally runs first; this covers panics.
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_info_has_sane_fallback() {
        // In CI stdout is a pipe; either path must yield nonzero dimensions
        let console = PtyConsole::new();
        let info = console.terminal_info();
        assert!(info.rows > 0);
        assert!(info.cols > 0);
    }

    #[test]
    fn teardown_without_setup_is_harmless() {
        let mut console = PtyConsole::new();
        console.teardown();
        console.teardown();
    }
}
