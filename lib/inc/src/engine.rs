//! URL parsing and transport factory.
//!
//! Accepted schemes: `tcp://host[:port]`, `udp://host[:port]`,
//! `unix:///path`, `pipe:///path`. Missing hosts default to loopback; ports
//! are mandatory for the datagram/stream schemes, paths for the local ones.

use axon::logging::{self, Logger};

use crate::device::{TcpDevice, UdpDevice, UnixDevice};
use crate::device::DeviceRef;
use crate::error::{IncError, IncResult};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParsedUrl {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Unix { path: String },
}

/// Split and validate a transport URL.
pub fn parse_url(url: &str) -> IncResult<ParsedUrl> {
    let (scheme, rest) = match url.find("://") {
        Some(at) => (&url[..at], &url[at + 3..]),
        None => return Err(IncError::InvalidArgs),
    };

    match scheme.to_ascii_lowercase().as_str() {
        "tcp" | "udp" => {
            let (host, port) = match rest.rfind(':') {
                Some(at) => {
                    let host = &rest[..at];
                    let port = rest[at + 1..]
                        .parse::<u16>()
                        .map_err(|_| IncError::InvalidArgs)?;
                    (host, port)
                }
                None => return Err(IncError::InvalidArgs),
            };

            if port == 0 {
                return Err(IncError::InvalidArgs);
            }

            let host = if host.is_empty() {
                "127.0.0.1".to_string()
            } else {
                host.to_string()
            };

            if scheme.eq_ignore_ascii_case("tcp") {
                Ok(ParsedUrl::Tcp { host, port })
            } else {
                Ok(ParsedUrl::Udp { host, port })
            }
        }
        "unix" | "pipe" => {
            if rest.is_empty() {
                return Err(IncError::InvalidArgs);
            }
            Ok(ParsedUrl::Unix {
                path: rest.to_string(),
            })
        }
        _ => Err(IncError::InvalidArgs),
    }
}

/// Transport factory bound to one endpoint's logger.
pub struct Engine {
    log: Logger,
}

impl Engine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Engine {
        Engine {
            log: logging::child(log, logging::o!("component" => "engine")),
        }
    }

    /// A client-role device already connecting to the given endpoint.
    pub fn create_client_transport(&self, url: &str) -> IncResult<DeviceRef> {
        let parsed = parse_url(url)?;

        let device: DeviceRef = match &parsed {
            ParsedUrl::Tcp { host, port } => TcpDevice::connect_to(host, *port, &self.log)?,
            ParsedUrl::Udp { host, port } => UdpDevice::connect_to(host, *port, &self.log)?,
            ParsedUrl::Unix { path } => UnixDevice::connect_to(path, &self.log)?,
        };

        logging::info!(self.log, "created client transport"; "url" => url);
        Ok(device)
    }

    /// A server-role device listening on the given endpoint.
    pub fn create_server_transport(&self, url: &str) -> IncResult<DeviceRef> {
        let parsed = parse_url(url)?;

        let device: DeviceRef = match &parsed {
            ParsedUrl::Tcp { host, port } => TcpDevice::listen_on(host, *port, &self.log)?,
            ParsedUrl::Udp { host, port } => UdpDevice::bind_on(host, *port, &self.log)?,
            ParsedUrl::Unix { path } => UnixDevice::listen_on(path, &self.log)?,
        };

        logging::info!(self.log, "created server transport"; "url" => url);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_url() {
        assert_eq!(
            parse_url("tcp://192.168.1.5:8080"),
            Ok(ParsedUrl::Tcp {
                host: "192.168.1.5".to_string(),
                port: 8080
            })
        );
    }

    #[test]
    fn test_default_host() {
        assert_eq!(
            parse_url("udp://:9000"),
            Ok(ParsedUrl::Udp {
                host: "127.0.0.1".to_string(),
                port: 9000
            })
        );
    }

    #[test]
    fn test_unix_and_pipe_urls() {
        assert_eq!(
            parse_url("unix:///run/ishell.sock"),
            Ok(ParsedUrl::Unix {
                path: "/run/ishell.sock".to_string()
            })
        );
        assert_eq!(
            parse_url("pipe:///tmp/node.pipe"),
            Ok(ParsedUrl::Unix {
                path: "/tmp/node.pipe".to_string()
            })
        );
    }

    #[test]
    fn test_scheme_case_insensitive() {
        assert!(parse_url("TCP://127.0.0.1:80").is_ok());
    }

    #[test]
    fn test_rejects() {
        assert_eq!(parse_url("tcp://host"), Err(IncError::InvalidArgs));
        assert_eq!(parse_url("tcp://host:0"), Err(IncError::InvalidArgs));
        assert_eq!(parse_url("unix://"), Err(IncError::InvalidArgs));
        assert_eq!(parse_url("ftp://host:21"), Err(IncError::InvalidArgs));
        assert_eq!(parse_url("no-scheme"), Err(IncError::InvalidArgs));
    }
}
