//! Worker roster and round-robin row assignment.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::ConfigError;

/// A worker endpoint in `host:port` form, ready for `TcpStream::connect`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerAddr(String);

impl WorkerAddr {
    /// Parse `host`, `host:port`, `ip`, `ip:port` or `[v6]:port`.
    ///
    /// Entries without a port get `default_port`.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidAddress(raw.to_string()));
        }
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(Self(addr.to_string()));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, default_port).to_string()));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let valid_host = !host.is_empty() && !host.contains(':');
                match port.parse::<u16>() {
                    Ok(_) if valid_host => Ok(Self(raw.to_string())),
                    _ => Err(ConfigError::InvalidAddress(raw.to_string())),
                }
            }
            None => Ok(Self(format!("{raw}:{default_port}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for WorkerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Ordered, fixed, non-empty list of workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    workers: Vec<WorkerAddr>,
}

impl Roster {
    pub fn new(workers: Vec<WorkerAddr>) -> Result<Self, ConfigError> {
        if workers.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        Ok(Self { workers })
    }

    pub fn parse<S: AsRef<str>>(entries: &[S], default_port: u16) -> Result<Self, ConfigError> {
        let workers = entries
            .iter()
            .map(|e| WorkerAddr::parse(e.as_ref(), default_port))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(workers)
    }

    /// Worker responsible for `row`: `workers[row % len]`.
    pub fn assign(&self, row: usize) -> &WorkerAddr {
        &self.workers[row % self.workers.len()]
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerAddr> {
        self.workers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let cases = [
            ("10.0.0.5", "10.0.0.5:10000"),
            ("10.0.0.5:9000", "10.0.0.5:9000"),
            ("worker-a", "worker-a:10000"),
            ("worker-a:9000", "worker-a:9000"),
            ("::1", "[::1]:10000"),
            ("[::1]:9000", "[::1]:9000"),
            ("  spaced  ", "spaced:10000"),
        ];
        for (raw, expected) in cases {
            assert_eq!(WorkerAddr::parse(raw, 10000).unwrap().as_str(), expected, "{raw}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        for raw in ["", ":9000", "host:port", "host:70000", "a:b:c"] {
            assert!(WorkerAddr::parse(raw, 10000).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn empty_roster_rejected() {
        let entries: [&str; 0] = [];
        assert_eq!(Roster::parse(&entries, 10000), Err(ConfigError::EmptyRoster));
    }

    #[test]
    fn round_robin_assignment() {
        for k in 1..=5 {
            let entries: Vec<String> = (0..k).map(|i| format!("w{i}")).collect();
            let roster = Roster::parse(&entries, 10000).unwrap();
            for row in 0..23 {
                assert_eq!(
                    roster.assign(row).as_str(),
                    format!("w{}:10000", row % k),
                    "k={k} row={row}"
                );
            }
        }
    }
}
