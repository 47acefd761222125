//! Endpoint and session credential types.

use std::fmt;

use crate::constants::PASSKEY_LEN;
use crate::error::{Error, Result};

/// Address of the everterm server for one session.
///
/// When the user routes through a jumphost, `host`/`port` are the jumphost's
/// and `jumphost` is set so the server can relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub host: String,
    pub port: u16,
    pub jumphost: bool,
}

impl SocketEndpoint {
    pub fn new(host: impl Into<String>, port: u16, jumphost: bool) -> Self {
        Self {
            host: host.into(),
            port,
            jumphost,
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Session identity issued by the server-side launcher.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub id: String,
    pub passkey: [u8; PASSKEY_LEN],
}

impl SessionCredentials {
    /// Build credentials, enforcing the exact passkey length.
    pub fn new(id: impl Into<String>, passkey: &[u8]) -> Result<Self> {
        let passkey: [u8; PASSKEY_LEN] = passkey.try_into().map_err(|_| {
            Error::config(format!(
                "invalid passkey length: expected {} bytes, got {}",
                PASSKEY_LEN,
                passkey.len()
            ))
        })?;
        Ok(Self {
            id: id.into(),
            passkey,
        })
    }

    /// Parse the `id/passkey` line printed by the remote launcher.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (id, passkey) = trimmed
            .split_once('/')
            .ok_or_else(|| Error::config(format!("invalid id/passkey pair: {trimmed}")))?;
        Self::new(id, passkey.as_bytes())
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("id", &self.id)
            .field("passkey", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        let ep = SocketEndpoint::new("example.com", 2022, false);
        assert_eq!(ep.to_string(), "example.com:2022");
    }

    #[test]
    fn credentials_accept_32_byte_passkey() {
        let creds = SessionCredentials::new("abc123", &[0x41; 32]).unwrap();
        assert_eq!(creds.id, "abc123");
        assert_eq!(creds.passkey, [0x41; 32]);
    }

    #[test]
    fn credentials_reject_wrong_length() {
        let err = SessionCredentials::new("abc123", b"short").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = SessionCredentials::new("abc123", &[0u8; 33]).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn parse_id_passkey_line() {
        let line = format!("  session42/{}\n", "k".repeat(32));
        let creds = SessionCredentials::parse(&line).unwrap();
        assert_eq!(creds.id, "session42");
        assert_eq!(creds.passkey, [b'k'; 32]);
    }

    #[test]
    fn parse_rejects_missing_slash() {
        let err = SessionCredentials::parse("no-slash-here").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn debug_redacts_passkey() {
        let creds = SessionCredentials::new("abc", &[7u8; 32]).unwrap();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('\u{7}'));
    }
}
