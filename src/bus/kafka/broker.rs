//! Broker address parsing and selection.

use std::fmt;
use std::str::FromStr;

use rand::seq::IndexedRandom;

use crate::bus::{MqError, Result};

/// One broker network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddr {
    type Err = MqError;

    /// Accepts `host:port` or `scheme://host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let authority = s.split_once("://").map_or(s, |(_, rest)| rest);
        let authority = authority.trim_end_matches('/');

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| MqError::Config(format!("Broker address '{}' has no port", s)))?;
        if host.is_empty() {
            return Err(MqError::Config(format!("Broker address '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| MqError::Config(format!("Broker address '{}' has a bad port: {}", s, e)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// The brokers of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSet {
    addrs: Vec<BrokerAddr>,
}

impl BrokerSet {
    /// Parse broker URLs; entries may themselves be comma-separated lists.
    pub fn parse<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        let addrs = urls
            .iter()
            .flat_map(|url| url.as_ref().split(','))
            .filter(|entry| !entry.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<BrokerAddr>>>()?;

        if addrs.is_empty() {
            return Err(MqError::Config("No brokers configured".to_string()));
        }
        Ok(Self { addrs })
    }

    pub fn addrs(&self) -> &[BrokerAddr] {
        &self.addrs
    }

    /// A random broker, for administrative calls.
    pub fn random(&self) -> &BrokerAddr {
        // parse() guarantees at least one address
        self.addrs.choose(&mut rand::rng()).unwrap_or(&self.addrs[0])
    }

    /// `host:port` list joined by commas, for client configuration.
    pub fn joined(&self) -> String {
        self.addrs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}
