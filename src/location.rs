//! Endpoint locators: a local path or `sync://host:port/path`.

use crate::error::{Error, Result};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

pub const REMOTE_SCHEME: &str = "sync://";

/// Port used when the locator names none.
pub const DEFAULT_PORT: u16 = 7878;

/// One side of a sync: a directory on this machine or on a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote {
        host: String,
        port: u16,
        /// Tree root relative to the server's serve root; empty = serve root.
        path: String,
    },
}

impl Location {
    pub fn parse(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix(REMOTE_SCHEME) else {
            return Ok(Location::Local(PathBuf::from(s)));
        };
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(Error::Config(format!("locator {s:?} names no host")));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("locator {s:?} has a bad port")))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("locator {s:?} names no host")));
        }
        Ok(Location::Remote {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// Resolve the remote authority to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Location::Local(path) => Err(Error::Config(format!(
                "{} is a local path, not an address",
                path.display()
            ))),
            Location::Remote { host, port, .. } => (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::Config(format!("{host}:{port} does not resolve"))),
        }
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Location::parse(s)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { host, port, path } => {
                write!(f, "{REMOTE_SCHEME}{host}:{port}/{path}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        assert_eq!(
            Location::parse("/srv/data").unwrap(),
            Location::Local(PathBuf::from("/srv/data"))
        );
        assert!(!Location::parse("relative/dir").unwrap().is_remote());
    }

    #[test]
    fn test_parse_remote() {
        assert_eq!(
            Location::parse("sync://files.example:9000/backups/a").unwrap(),
            Location::Remote {
                host: "files.example".to_string(),
                port: 9000,
                path: "backups/a".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_remote_defaults() {
        // No port, no path: the serve root on the default port.
        assert_eq!(
            Location::parse("sync://files.example").unwrap(),
            Location::Remote {
                host: "files.example".to_string(),
                port: DEFAULT_PORT,
                path: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_remote_rejects_garbage() {
        assert!(Location::parse("sync://").is_err());
        assert!(Location::parse("sync://:900/x").is_err());
        assert!(Location::parse("sync://host:notaport/x").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let loc = Location::parse("sync://h:1234/p/q").unwrap();
        assert_eq!(loc.to_string(), "sync://h:1234/p/q");
        assert_eq!(Location::parse(&loc.to_string()).unwrap(), loc);
    }
}
