//! evt: resilient remote shell client.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use evt_client::{Cli, EngineConfig, PtyConsole, ReliableChannel, SessionEngine};
use evt_core::init_logging;

const LOG_FILE: &str = "/tmp/evtclient.log";

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage and parse failures both land on exit 1
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cli.apply_destination() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_logging(cli.verbose, Path::new(LOG_FILE), cli.logtostdout, cli.silent) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let setup = evt_client::ssh::SshSetup {
        user: cli.effective_user(),
        host: cli.host.clone(),
        prefix: cli.prefix.clone(),
        kill_other_sessions: cli.kill_other_sessions,
        verbose: cli.verbose,
        noratelimit: cli.noratelimit,
    };
    let credentials = match evt_client::ssh::setup_session(&setup).await {
        Ok(creds) => creds,
        Err(e) => {
            eprintln!("Could not make initial connection to {}: {e}", cli.host);
            return ExitCode::FAILURE;
        }
    };
    info!(id = %credentials.id, "session registered");

    let endpoint = cli.endpoint();
    let channel = ReliableChannel::new(endpoint, credentials);
    let console = Box::new(PtyConsole::new());
    let engine = SessionEngine::new(channel, console, EngineConfig::default());

    let command = cli.command.clone().unwrap_or_default();
    match engine.run(&command, &cli.tunnels, &cli.reverse_tunnels).await {
        Ok(()) => {
            println!("Session terminated");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Connection closing because of error: {e}");
            ExitCode::FAILURE
        }
    }
}
