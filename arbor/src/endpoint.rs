//! The endpoint model.
//!
//! An [`Endpoint`] is the immutable identity of a remote peer: a host name,
//! an optional resolved IP address and an optional port. Everything above
//! the transport (endpoint groups, health checking, the connection pool)
//! keys its state on this triple.

use std::{fmt, net::IpAddr, str::FromStr};

use faststr::FastStr;

/// Errors from constructing or deriving an [`Endpoint`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint host must not be empty")]
    EmptyHost,
    #[error("endpoint port must be in 1..=65535, got {0}")]
    InvalidPort(u32),
    #[error("failed to parse endpoint authority `{0}`")]
    BadAuthority(FastStr),
}

/// An immutable (host, optional ip, optional port) identity.
///
/// Equality and hashing consider the (host, ip, port) triple only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: FastStr,
    ip: Option<IpAddr>,
    port: Option<u16>,
}

impl Endpoint {
    /// Creates an endpoint with a host name only.
    pub fn new<S>(host: S) -> Result<Self, EndpointError>
    where
        S: Into<FastStr>,
    {
        let host = host.into();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        let ip = IpAddr::from_str(&host).ok();
        Ok(Self {
            host,
            ip,
            port: None,
        })
    }

    /// Creates an endpoint with a host name and a port.
    pub fn with_host_and_port<S>(host: S, port: u16) -> Result<Self, EndpointError>
    where
        S: Into<FastStr>,
    {
        Self::new(host)?.with_port(port)
    }

    /// Parses a `host[:port]` authority.
    pub fn parse(authority: &str) -> Result<Self, EndpointError> {
        if authority.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        // Bracketed IPv6 literal, with or without a port.
        if let Some(rest) = authority.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(EndpointError::BadAuthority(FastStr::new(authority)));
            };
            let ep = Self::new(FastStr::new(host))?;
            return match tail.strip_prefix(':') {
                Some(port) => ep.with_port(parse_port(authority, port)?),
                None if tail.is_empty() => Ok(ep),
                None => Err(EndpointError::BadAuthority(FastStr::new(authority))),
            };
        }
        match authority.rsplit_once(':') {
            // A second colon means this is a bare IPv6 literal, not host:port.
            Some((host, _)) if host.contains(':') => Self::new(FastStr::new(authority)),
            Some((host, port)) => {
                Self::new(FastStr::new(host))?.with_port(parse_port(authority, port)?)
            }
            None => Self::new(FastStr::new(authority)),
        }
    }

    /// The host name.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The resolved IP address, if any.
    #[inline]
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// The port, if any.
    #[inline]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The port, or `default` when none is set.
    #[inline]
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Whether the endpoint carries a resolved IP address.
    #[inline]
    pub fn has_ip(&self) -> bool {
        self.ip.is_some()
    }

    /// Returns a copy of this endpoint with the given port.
    pub fn with_port(mut self, port: u16) -> Result<Self, EndpointError> {
        if port == 0 {
            return Err(EndpointError::InvalidPort(0));
        }
        self.port = Some(port);
        Ok(self)
    }

    /// Returns a copy of this endpoint without any port.
    pub fn without_port(mut self) -> Self {
        self.port = None;
        self
    }

    /// Returns a copy of this endpoint with the given resolved IP address.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// The `host[:port]` authority string.
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

fn parse_port(authority: &str, s: &str) -> Result<u16, EndpointError> {
    match s.parse::<u32>() {
        Ok(0) => Err(EndpointError::InvalidPort(0)),
        Ok(p) if p <= u16::MAX as u32 => Ok(p as u16),
        Ok(p) => Err(EndpointError::InvalidPort(p)),
        Err(_) => Err(EndpointError::BadAuthority(FastStr::new(authority))),
    }
}
