//! Tracing integration for structured logging.
//!
//! The client logs to a file by default so terminal output stays clean;
//! `--logtostdout` redirects to stdout and `--silent` disables logging.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Initialize the logging system.
///
/// # Arguments
///
/// * `verbosity` - Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace)
/// * `log_file` - Path to append logs to when not logging to stdout
/// * `to_stdout` - Route logs to stdout instead of the file
/// * `silent` - Disable logging entirely
pub fn init_logging(verbosity: u8, log_file: &Path, to_stdout: bool, silent: bool) -> Result<()> {
    if silent {
        return Ok(());
    }

    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    // Build filter with level and allow RUST_LOG override
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("evt_core={level},evt_client={level}")));

    if to_stdout {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init()
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init()
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_mode_never_touches_the_filesystem() {
        init_logging(9, Path::new("/nonexistent/dir/evt.log"), false, true).unwrap();
    }

    // Note: init_logging can only be exercised once per process since the
    // tracing subscriber is global. Behavior is covered in integration runs.
}
