//! Address-range specifications.
//!
//! A specification lists one or more ranges separated by commas:
//!
//! ```text
//! tcp://127.0.0.1:41000-41003,udp://[::1]:42000
//! ```
//!
//! Each range becomes one upstream group; expanding it yields one concrete
//! `host:port` target per port. A missing scheme means `tcp`.

use std::fmt;
use std::str::FromStr;

use crate::transport::Proto;

/// Endpoint parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("Empty address specification")]
    Empty,

    #[error("Unknown protocol '{0}' (expected tcp or udp)")]
    UnknownProto(String),

    #[error("Missing port in '{0}'")]
    MissingPort(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Invalid port range {begin}-{end}")]
    InvalidRange { begin: u16, end: u16 },
}

/// One protocol/host/port-range entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: Proto,
    pub host: String,
    pub port_begin: u16,
    pub port_end: u16,
}

impl Endpoint {
    /// Join a host and port the way socket addresses expect (IPv6 bracketed).
    pub fn join_host_port(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Concrete `host:port` addresses covered by this range
    pub fn addrs(&self) -> Vec<String> {
        (self.port_begin..=self.port_end)
            .map(|port| Self::join_host_port(&self.host, port))
            .collect()
    }

    /// Number of ports in the range
    pub fn port_count(&self) -> usize {
        usize::from(self.port_end - self.port_begin) + 1
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port_begin == self.port_end {
            write!(f, "{}://{}:{}", self.proto, host, self.port_begin)
        } else {
            write!(
                f,
                "{}://{}:{}-{}",
                self.proto, host, self.port_begin, self.port_end
            )
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (proto, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (
                scheme
                    .parse::<Proto>()
                    .map_err(EndpointError::UnknownProto)?,
                rest,
            ),
            None => (Proto::Tcp, s),
        };

        let (host, ports) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
                let ports = tail
                    .strip_prefix(':')
                    .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
                (host, ports)
            }
            None => rest
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?,
        };

        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(p.to_string()))
        };
        let (port_begin, port_end) = match ports.split_once('-') {
            Some((begin, end)) => (parse_port(begin)?, parse_port(end)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };
        if port_begin > port_end {
            return Err(EndpointError::InvalidRange {
                begin: port_begin,
                end: port_end,
            });
        }

        Ok(Self {
            proto,
            host: host.to_string(),
            port_begin,
            port_end,
        })
    }
}

/// Parse a comma separated list of ranges.
pub fn parse_endpoints(list: &str) -> Result<Vec<Endpoint>, EndpointError> {
    let endpoints = list
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Endpoint>, _>>()?;
    if endpoints.is_empty() {
        return Err(EndpointError::Empty);
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_port() {
        let e: Endpoint = "udp://10.0.0.1:5000".parse().unwrap();
        assert_eq!(e.proto, Proto::Udp);
        assert_eq!(e.host, "10.0.0.1");
        assert_eq!(e.addrs(), vec!["10.0.0.1:5000"]);
        assert_eq!(e.to_string(), "udp://10.0.0.1:5000");
    }

    #[test]
    fn test_port_range() {
        let e: Endpoint = "tcp://example.org:41000-41002".parse().unwrap();
        assert_eq!(e.port_count(), 3);
        assert_eq!(
            e.addrs(),
            vec!["example.org:41000", "example.org:41001", "example.org:41002"]
        );
    }

    #[test]
    fn test_default_scheme_and_ipv6() {
        let e: Endpoint = "[::1]:80-81".parse().unwrap();
        assert_eq!(e.proto, Proto::Tcp);
        assert_eq!(e.host, "::1");
        assert_eq!(e.addrs(), vec!["[::1]:80", "[::1]:81"]);
        assert_eq!(e.to_string(), "tcp://[::1]:80-81");
    }

    #[test]
    fn test_list() {
        let list = parse_endpoints("tcp://a:1-2, udp://b:3,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].proto, Proto::Udp);
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse_endpoints(" , "), Err(EndpointError::Empty));
        assert!(matches!(
            "sctp://a:1".parse::<Endpoint>(),
            Err(EndpointError::UnknownProto(_))
        ));
        assert!(matches!(
            "tcp://a".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            "tcp://a:x".parse::<Endpoint>(),
            Err(EndpointError::InvalidPort(_))
        ));
        assert_eq!(
            "tcp://a:9-3".parse::<Endpoint>(),
            Err(EndpointError::InvalidRange { begin: 9, end: 3 })
        );
    }
}
