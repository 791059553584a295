//! The session-protocol model and the pseudo-URI scheme.
//!
//! A scheme is `<serialization>+<protocol>`, e.g. `none+https`; the
//! serialization segment defaults to `none` for pure HTTP, so `https` and
//! `none+https` are equivalent.

use std::{fmt, str::FromStr};

use faststr::FastStr;

use crate::error::client::ClientError;

/// The protocol a session speaks, or intends to negotiate.
///
/// `Http` and `Https` are undetermined: they resolve to an exact dialect
/// (`H1`/`H2` over TLS, `H1c`/`H2c` cleartext) during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    /// Cleartext HTTP, dialect still to be negotiated.
    Http,
    /// HTTP over TLS, dialect negotiated via ALPN.
    Https,
    /// HTTP/1.1 over TLS.
    H1,
    /// Cleartext HTTP/1.1.
    H1c,
    /// HTTP/2 over TLS.
    H2,
    /// Cleartext HTTP/2 (prior knowledge).
    H2c,
}

impl SessionProtocol {
    /// Whether one connection carries many concurrent streams.
    pub fn is_multiplex(&self) -> bool {
        matches!(self, Self::H2 | Self::H2c)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Https | Self::H1 | Self::H2)
    }

    /// Whether the exact dialect is known.
    pub fn is_determined(&self) -> bool {
        !matches!(self, Self::Http | Self::Https)
    }

    /// The exact dialects to try for this protocol, most preferred first.
    pub fn fallback_protocols(&self) -> &'static [SessionProtocol] {
        match self {
            Self::Http => &[Self::H2c, Self::H1c],
            Self::Https => &[Self::H2, Self::H1],
            Self::H1 => &[Self::H1],
            Self::H1c => &[Self::H1c],
            Self::H2 => &[Self::H2],
            Self::H2c => &[Self::H2c],
        }
    }

    /// The default port of this protocol.
    pub fn default_port(&self) -> u16 {
        if self.is_tls() {
            443
        } else {
            80
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::H1 => "h1",
            Self::H1c => "h1c",
            Self::H2 => "h2",
            Self::H2c => "h2c",
        }
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionProtocol {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "h1" => Ok(Self::H1),
            "h1c" => Ok(Self::H1c),
            "h2" => Ok(Self::H2),
            "h2c" => Ok(Self::H2c),
            other => Err(ClientError::violation(format!(
                "unknown session protocol `{other}`"
            ))),
        }
    }
}

/// The serialization segment of a scheme. `none` for pure HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SerializationFormat {
    None,
    Other(FastStr),
}

impl SerializationFormat {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<serialization>+<protocol>` scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheme {
    pub serialization: SerializationFormat,
    pub protocol: SessionProtocol,
}

impl Scheme {
    /// Parses a scheme segment such as `https`, `h2c` or `none+h1`.
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        let (serialization, protocol) = match s.split_once('+') {
            Some((serialization, protocol)) => {
                let serialization = match serialization {
                    "" => {
                        return Err(ClientError::violation(format!(
                            "empty serialization format in scheme `{s}`"
                        )))
                    }
                    "none" => SerializationFormat::None,
                    other => SerializationFormat::Other(FastStr::new(other)),
                };
                (serialization, protocol)
            }
            None => (SerializationFormat::None, s),
        };
        Ok(Self {
            serialization,
            protocol: protocol.parse()?,
        })
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.serialization {
            SerializationFormat::None => fmt::Display::fmt(&self.protocol, f),
            other => write!(f, "{other}+{}", self.protocol),
        }
    }
}

#[cfg(test)]
mod proto_tests {
    use super::{Scheme, SerializationFormat, SessionProtocol};
    use crate::error::client::ClientError;

    #[test]
    fn classification() {
        assert!(SessionProtocol::H2.is_multiplex());
        assert!(SessionProtocol::H2c.is_multiplex());
        assert!(!SessionProtocol::H1c.is_multiplex());

        assert!(SessionProtocol::Https.is_tls());
        assert!(SessionProtocol::H1.is_tls());
        assert!(!SessionProtocol::H2c.is_tls());

        assert!(!SessionProtocol::Http.is_determined());
        assert!(SessionProtocol::H1c.is_determined());
    }

    #[test]
    fn fallback_order() {
        assert_eq!(
            SessionProtocol::Http.fallback_protocols(),
            &[SessionProtocol::H2c, SessionProtocol::H1c],
        );
        assert_eq!(
            SessionProtocol::Https.fallback_protocols(),
            &[SessionProtocol::H2, SessionProtocol::H1],
        );
        assert_eq!(
            SessionProtocol::H1c.fallback_protocols(),
            &[SessionProtocol::H1c],
        );
    }

    #[test]
    fn scheme_parsing() {
        let scheme = Scheme::parse("https").unwrap();
        assert_eq!(scheme.serialization, SerializationFormat::None);
        assert_eq!(scheme.protocol, SessionProtocol::Https);

        let scheme = Scheme::parse("none+h2c").unwrap();
        assert_eq!(scheme.serialization, SerializationFormat::None);
        assert_eq!(scheme.protocol, SessionProtocol::H2c);
        assert_eq!(scheme.to_string(), "h2c");

        let scheme = Scheme::parse("gjson+h1").unwrap();
        assert_eq!(scheme.serialization.as_str(), "gjson");
        assert_eq!(scheme.to_string(), "gjson+h1");

        assert!(matches!(
            Scheme::parse("ftp"),
            Err(ClientError::ProtocolViolation(_)),
        ));
        assert!(matches!(
            Scheme::parse("+h1"),
            Err(ClientError::ProtocolViolation(_)),
        ));
    }
}
