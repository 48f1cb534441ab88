//! Endpoint address parsing
//!
//! Addresses take the form `protocol://host:port` with protocol one of
//! `tcp`, `tls`, `unix` or `udg`. A bare IPv4 address with no scheme
//! defaults to `tcp://addr:80`, or `tls://addr:443` once TLS credentials
//! are configured.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Transport scheme of an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP
    Tcp,
    /// TCP with a host-attached TLS record layer
    Tls,
    /// Unix-domain stream socket
    Unix,
    /// Unix-domain datagram socket (recognized, not bindable)
    Udg,
}

impl Scheme {
    fn parse(s: &str) -> Option<Scheme> {
        match s {
            "tcp" => Some(Scheme::Tcp),
            "tls" => Some(Scheme::Tls),
            "unix" => Some(Scheme::Unix),
            "udg" => Some(Scheme::Udg),
            _ => None,
        }
    }
}

/// A parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// An internet endpoint (`tcp://` or `tls://`)
    Inet {
        /// Transport scheme
        scheme: Scheme,
        /// Resolved socket address
        addr: SocketAddr,
    },
    /// A filesystem endpoint (`unix://` or `udg://`)
    Path {
        /// Transport scheme
        scheme: Scheme,
        /// Socket file path
        path: PathBuf,
    },
}

impl Address {
    /// Parse an address string
    ///
    /// `use_crypto` selects the default scheme and port for bare addresses:
    /// `tcp://…:80` normally, `tls://…:443` when TLS credentials are
    /// configured.
    pub fn parse(input: &str, use_crypto: bool) -> Result<Address> {
        let bad = || Error::BadAddress(input.to_string());

        let (scheme, rest) = match input.split_once("://") {
            Some((s, rest)) => (Scheme::parse(s).ok_or_else(bad)?, rest),
            None => {
                let scheme = if use_crypto { Scheme::Tls } else { Scheme::Tcp };
                let default_port = if use_crypto { 443 } else { 80 };
                let addr = if input.contains(':') {
                    input.parse().map_err(|_| bad())?
                } else {
                    format!("{}:{}", input, default_port)
                        .parse()
                        .map_err(|_| bad())?
                };
                return Ok(Address::Inet { scheme, addr });
            }
        };

        match scheme {
            Scheme::Tcp | Scheme::Tls => {
                let addr = rest.parse().map_err(|_| bad())?;
                Ok(Address::Inet { scheme, addr })
            }
            Scheme::Unix | Scheme::Udg => {
                if rest.is_empty() {
                    return Err(bad());
                }
                Ok(Address::Path {
                    scheme,
                    path: PathBuf::from(rest),
                })
            }
        }
    }

    /// The transport scheme
    pub fn scheme(&self) -> Scheme {
        match self {
            Address::Inet { scheme, .. } | Address::Path { scheme, .. } => *scheme,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet { scheme, addr } => {
                let s = match scheme {
                    Scheme::Tcp => "tcp",
                    Scheme::Tls => "tls",
                    _ => unreachable!(),
                };
                write!(f, "{}://{}", s, addr)
            }
            Address::Path { scheme, path } => {
                let s = match scheme {
                    Scheme::Unix => "unix",
                    Scheme::Udg => "udg",
                    _ => unreachable!(),
                };
                write!(f, "{}://{}", s, path.display())
            }
        }
    }
}
