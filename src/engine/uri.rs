//! Connection URIs for tunnel mode.
//!
//! Supported schemes:
//! - `unix:///run/caravel/caravel.sock`
//! - `tcp://host:port`
//! - `ssh://user@host[:port]/run/caravel/caravel.sock?secure=true`
//!
//! `CONTAINER_HOST` supplies the default URI, `CONTAINER_SSHKEY` the ssh
//! identity, `CONTAINER_PASSPHRASE` its passphrase.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// A parsed service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUri {
    Unix {
        path: PathBuf,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Ssh {
        user: Option<String>,
        host: String,
        port: u16,
        /// Remote unix socket path.
        socket: PathBuf,
        /// Verify the host key.
        secure: bool,
        identity: Option<PathBuf>,
        passphrase: Option<String>,
    },
}

impl ConnectionUri {
    /// Parses a URI string, consulting the environment for ssh identity
    /// material.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidArg(format!("invalid connection URI: {uri:?}")))?;

        match scheme {
            "unix" => {
                // unix://path and unix:///path both resolve to a path.
                let path = if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{rest}")
                };
                Ok(ConnectionUri::Unix {
                    path: PathBuf::from(path),
                })
            }
            "tcp" => {
                let (host, port) = rest
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidArg(format!("tcp URI needs a port: {uri:?}")))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::InvalidArg(format!("invalid port in {uri:?}")))?;
                if host.is_empty() {
                    return Err(Error::InvalidArg(format!("tcp URI needs a host: {uri:?}")));
                }
                Ok(ConnectionUri::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "ssh" => {
                let (authority_and_path, query) = match rest.split_once('?') {
                    Some((a, q)) => (a, Some(q)),
                    None => (rest, None),
                };
                let (authority, path) = match authority_and_path.find('/') {
                    Some(idx) => (&authority_and_path[..idx], &authority_and_path[idx..]),
                    None => (authority_and_path, ""),
                };
                let (user, hostport) = match authority.split_once('@') {
                    Some((u, h)) => (Some(u.to_string()), h),
                    None => (None, authority),
                };
                let (host, port) = match hostport.split_once(':') {
                    Some((h, p)) => (
                        h.to_string(),
                        p.parse()
                            .map_err(|_| Error::InvalidArg(format!("invalid port in {uri:?}")))?,
                    ),
                    None => (hostport.to_string(), 22),
                };
                if host.is_empty() {
                    return Err(Error::InvalidArg(format!("ssh URI needs a host: {uri:?}")));
                }

                let secure = query
                    .and_then(|q| {
                        q.split('&')
                            .find_map(|kv| kv.strip_prefix("secure="))
                            .map(|v| v.eq_ignore_ascii_case("true"))
                    })
                    .unwrap_or(false);

                let socket = if path.is_empty() {
                    PathBuf::from("/run/caravel/caravel.sock")
                } else {
                    PathBuf::from(path)
                };

                Ok(ConnectionUri::Ssh {
                    user,
                    host,
                    port,
                    socket,
                    secure,
                    identity: std::env::var("CONTAINER_SSHKEY").ok().map(PathBuf::from),
                    passphrase: std::env::var("CONTAINER_PASSPHRASE").ok(),
                })
            }
            other => Err(Error::InvalidArg(format!(
                "unsupported connection scheme: {other:?}"
            ))),
        }
    }

    /// The default URI: `CONTAINER_HOST`, falling back to the local socket.
    pub fn from_env() -> Result<Self> {
        match std::env::var("CONTAINER_HOST") {
            Ok(uri) if !uri.is_empty() => Self::parse(&uri),
            _ => Ok(ConnectionUri::Unix {
                path: PathBuf::from("/run/caravel/caravel.sock"),
            }),
        }
    }

    /// Display form for errors.
    pub fn label(&self) -> String {
        match self {
            ConnectionUri::Unix { path } => format!("unix://{}", path.display()),
            ConnectionUri::Tcp { host, port } => format!("tcp://{host}:{port}"),
            ConnectionUri::Ssh {
                user, host, port, ..
            } => match user {
                Some(user) => format!("ssh://{user}@{host}:{port}"),
                None => format!("ssh://{host}:{port}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_uri_forms() {
        assert_eq!(
            ConnectionUri::parse("unix:///run/x.sock").unwrap(),
            ConnectionUri::Unix {
                path: PathBuf::from("/run/x.sock")
            }
        );
        // Autofix of unix://path_element.
        assert_eq!(
            ConnectionUri::parse("unix://run/x.sock").unwrap(),
            ConnectionUri::Unix {
                path: PathBuf::from("/run/x.sock")
            }
        );
    }

    #[test]
    fn tcp_uri() {
        assert_eq!(
            ConnectionUri::parse("tcp://localhost:8080").unwrap(),
            ConnectionUri::Tcp {
                host: "localhost".to_string(),
                port: 8080
            }
        );
        assert!(ConnectionUri::parse("tcp://localhost").is_err());
        assert!(ConnectionUri::parse("tcp://:8080").is_err());
    }

    #[test]
    fn ssh_uri_full() {
        let uri =
            ConnectionUri::parse("ssh://core@example.com:2222/run/user/1000/caravel.sock?secure=True")
                .unwrap();
        match uri {
            ConnectionUri::Ssh {
                user,
                host,
                port,
                socket,
                secure,
                ..
            } => {
                assert_eq!(user.as_deref(), Some("core"));
                assert_eq!(host, "example.com");
                assert_eq!(port, 2222);
                assert_eq!(socket, PathBuf::from("/run/user/1000/caravel.sock"));
                assert!(secure);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ssh_uri_defaults() {
        let uri = ConnectionUri::parse("ssh://example.com").unwrap();
        match uri {
            ConnectionUri::Ssh {
                user,
                port,
                secure,
                socket,
                ..
            } => {
                assert!(user.is_none());
                assert_eq!(port, 22);
                assert!(!secure);
                assert!(socket.to_string_lossy().ends_with(".sock"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(ConnectionUri::parse("gopher://x").is_err());
        assert!(ConnectionUri::parse("no-scheme").is_err());
    }
}
