//! Peer endpoint identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A peer's advertised endpoint. Equality is structural; used as peer
/// identity in the refusal-hint candidate list and in CONNECTION_REFUSED
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` string.
#[derive(Debug, thiserror::Error)]
#[error("invalid host:port address: {0}")]
pub struct ParseHostPortError(String);

impl FromStr for HostPort {
    type Err = ParseHostPortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseHostPortError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseHostPortError(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| ParseHostPortError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
