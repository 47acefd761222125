//! Command-line interface for the evt client.

use clap::Parser;

use evt_core::constants::DEFAULT_PORT;
use evt_core::error::{Error, Result};
use evt_core::SocketEndpoint;

/// Resilient remote shell with TCP tunneling.
///
/// Survives transient network loss: the connection to the server is a
/// sequenced logical channel that reconnects and replays transparently.
#[derive(Parser, Debug, Clone)]
#[command(name = "evt", version, about, long_about = None)]
pub struct Cli {
    /// Remote destination: [user@]host[:port]
    pub destination: Option<String>,

    /// Username to log in as
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Host to join
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port to connect on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Command to run immediately after connecting; the session exits when
    /// it finishes
    #[arg(short = 'c', long)]
    pub command: Option<String>,

    /// Command prefix to launch the server-side terminal handler
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Tunnels: source:destination port pairs or srcStart-srcEnd:dstStart-dstEnd
    /// inclusive ranges (e.g. 10080:80,10443:443 or 10090-10092:8000-8002)
    #[arg(short = 't', long = "tunnel", default_value = "")]
    pub tunnels: String,

    /// Reverse tunnels, same grammar as --tunnel
    #[arg(short = 'r', long = "reverse-tunnel", alias = "rt", default_value = "")]
    pub reverse_tunnels: String,

    /// Jumphost between localhost and the destination
    #[arg(long)]
    pub jumphost: Option<String>,

    /// Port to connect on the jumphost
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub jport: u16,

    /// Kill all old sessions belonging to the user before starting
    #[arg(short = 'x', long)]
    pub kill_other_sessions: bool,

    /// Verbosity level
    #[arg(short = 'v', long = "verbose", default_value_t = 0)]
    pub verbose: u8,

    /// Route logs to stdout instead of the log file
    #[arg(long)]
    pub logtostdout: bool,

    /// Disable logging entirely
    #[arg(long)]
    pub silent: bool,

    /// Disable the server-side 1024-lines/s output throttle
    #[arg(long)]
    pub noratelimit: bool,
}

impl Cli {
    /// Overlay the positional `[user@]host[:port]` argument onto the flags.
    pub fn apply_destination(&mut self) -> Result<()> {
        let Some(dest) = self.destination.clone() else {
            return Ok(());
        };

        let mut rest = dest.as_str();
        if let Some((user, host_part)) = rest.split_once('@') {
            if user.is_empty() {
                return Err(Error::config(format!("empty username in: {dest}")));
            }
            if self.user.is_none() {
                self.user = Some(user.to_string());
            }
            rest = host_part;
        }

        if let Some((host, port)) = rest.split_once(':') {
            self.port = port
                .parse()
                .map_err(|_| Error::config(format!("invalid port in destination: {dest}")))?;
            rest = host;
        }

        if rest.is_empty() {
            return Err(Error::config(format!("empty host in: {dest}")));
        }
        self.host = rest.to_string();
        Ok(())
    }

    /// The endpoint the transport should dial, accounting for a jumphost.
    pub fn endpoint(&self) -> SocketEndpoint {
        match &self.jumphost {
            Some(jumphost) if !jumphost.is_empty() => {
                SocketEndpoint::new(jumphost.clone(), self.jport, true)
            }
            _ => SocketEndpoint::new(self.host.clone(), self.port, false),
        }
    }

    /// Username to use, falling back to the local user.
    pub fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("LOGNAME").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["evt"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.host, "localhost");
        assert_eq!(cli.port, 2022);
        assert_eq!(cli.jport, 2022);
        assert!(cli.tunnels.is_empty());
        assert!(!cli.kill_other_sessions);
    }

    #[test]
    fn destination_with_user_and_port() {
        let mut cli = parse(&["alice@example.com:2222"]);
        cli.apply_destination().unwrap();
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert_eq!(cli.host, "example.com");
        assert_eq!(cli.port, 2222);
    }

    #[test]
    fn destination_host_only() {
        let mut cli = parse(&["example.com"]);
        cli.apply_destination().unwrap();
        assert_eq!(cli.host, "example.com");
        assert_eq!(cli.port, 2022);
        assert!(cli.user.is_none());
    }

    #[test]
    fn user_flag_wins_over_destination() {
        let mut cli = parse(&["-u", "bob", "alice@example.com"]);
        cli.apply_destination().unwrap();
        assert_eq!(cli.user.as_deref(), Some("bob"));
    }

    #[test]
    fn destination_bad_port_fails() {
        let mut cli = parse(&["example.com:notaport"]);
        assert!(cli.apply_destination().is_err());
    }

    #[test]
    fn jumphost_redirects_endpoint() {
        let mut cli = parse(&["--jumphost", "bastion", "--jport", "2023", "example.com"]);
        cli.apply_destination().unwrap();
        let ep = cli.endpoint();
        assert_eq!(ep.host, "bastion");
        assert_eq!(ep.port, 2023);
        assert!(ep.jumphost);
    }

    #[test]
    fn no_jumphost_uses_destination() {
        let mut cli = parse(&["example.com:2222"]);
        cli.apply_destination().unwrap();
        let ep = cli.endpoint();
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 2222);
        assert!(!ep.jumphost);
    }

    #[test]
    fn tunnel_flags_parse() {
        let cli = parse(&["-t", "10080-10082:80-82", "--rt", "9000:9001", "host"]);
        assert_eq!(cli.tunnels, "10080-10082:80-82");
        assert_eq!(cli.reverse_tunnels, "9000:9001");
    }
}
