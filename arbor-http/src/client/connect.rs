//! Connection establishment and protocol negotiation.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use super::{
    pool::{Connect, PoolKey},
    session::{Connection, Dialect, HttpSession, SessionConfig},
};
use crate::{
    body::Body,
    error::{client::ClientError, BoxError},
    proto::SessionProtocol,
};

/// Connector configuration.
#[derive(Clone)]
pub struct ConnectorConfig {
    /// Deadline for TCP connect plus protocol negotiation.
    pub negotiation_timeout: Duration,
    /// Connection-level HTTP/2 flow-control window, raised on the first
    /// SETTINGS exchange.
    pub initial_connection_window: u32,
    /// Stream-level HTTP/2 flow-control window.
    pub initial_stream_window: u32,
    pub session: SessionConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_millis(3200),
            initial_connection_window: 1024 * 1024,
            initial_stream_window: 1024 * 1024,
            session: SessionConfig::default(),
        }
    }
}

/// Establishes transport channels and negotiates the session protocol.
///
/// Failed negotiations are remembered per (address, protocol) so repeated
/// attempts fail fast instead of re-dialing a peer that already refused
/// the dialect.
#[derive(Clone)]
pub struct HttpConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    unsupported: DashMap<(SocketAddr, SessionProtocol), ()>,
    next_session_id: AtomicU64,
}

impl HttpConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                unsupported: DashMap::new(),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    #[cfg(test)]
    fn mark_unsupported(&self, addr: SocketAddr, protocol: SessionProtocol) {
        self.inner.mark_unsupported(addr, protocol);
    }
}

impl Connect<Connection> for HttpConnector {
    fn connect(
        &self,
        desired: SessionProtocol,
        key: &PoolKey,
    ) -> BoxFuture<'static, Result<Connection, BoxError>> {
        let inner = self.inner.clone();
        let key = key.clone();
        Box::pin(async move { inner.connect(desired, key).await })
    }
}

impl ConnectorInner {
    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_supported(&self, addr: SocketAddr, desired: SessionProtocol) -> Result<(), BoxError> {
        if self.unsupported.contains_key(&(addr, desired)) {
            return Err(Box::new(ClientError::ProtocolNegotiation {
                expected: desired,
                actual: None,
                reason: "negotiation previously failed for this peer".into(),
            }));
        }
        Ok(())
    }

    fn mark_unsupported(&self, addr: SocketAddr, protocol: SessionProtocol) {
        self.unsupported.insert((addr, protocol), ());
    }

    async fn connect(&self, desired: SessionProtocol, key: PoolKey) -> Result<Connection, BoxError> {
        let addr = key.address();
        self.check_supported(addr, desired)?;

        match desired {
            SessionProtocol::H1c => {
                let stream = self.connect_tcp(addr).await?;
                self.handshake_h1(stream, SessionProtocol::H1c, &key).await
            }
            SessionProtocol::H2c => {
                let stream = self.connect_tcp(addr).await?;
                match self.handshake_h2(stream, SessionProtocol::H2c, &key).await {
                    Ok(conn) => Ok(conn),
                    Err(err) => {
                        self.mark_unsupported(addr, SessionProtocol::H2c);
                        Err(err)
                    }
                }
            }
            SessionProtocol::Http => self.connect_cleartext_auto(&key).await,
            #[cfg(feature = "__tls")]
            SessionProtocol::H1 | SessionProtocol::H2 | SessionProtocol::Https => {
                self.connect_tls(desired, &key).await
            }
            #[cfg(not(feature = "__tls"))]
            SessionProtocol::H1 | SessionProtocol::H2 | SessionProtocol::Https => {
                Err(Box::new(ClientError::ProtocolNegotiation {
                    expected: desired,
                    actual: None,
                    reason: "tls support is not enabled".into(),
                }))
            }
        }
    }

    /// Undetermined cleartext: HTTP/2 cannot be observed through the
    /// cleartext codec without prior knowledge, so `http` negotiates
    /// HTTP/1.1. A peer's h2c support is used when the caller asks for
    /// `h2c` explicitly; an explicit h2c failure falls back here with a
    /// fresh HTTP/1 connect.
    async fn connect_cleartext_auto(&self, key: &PoolKey) -> Result<Connection, BoxError> {
        let addr = key.address();
        let stream = self.connect_tcp(addr).await?;
        self.handshake_h1(stream, SessionProtocol::H1c, key).await
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, BoxError> {
        let stream =
            tokio::time::timeout(self.config.negotiation_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| negotiation_timed_out(SessionProtocol::Http, addr))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn handshake_h1<S>(
        &self,
        stream: S,
        protocol: SessionProtocol,
        key: &PoolKey,
    ) -> Result<Connection, BoxError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let handshake = http1::Builder::new().handshake::<_, Body>(io);
        let (sender, conn) = tokio::time::timeout(self.config.negotiation_timeout, handshake)
            .await
            .map_err(|_| negotiation_timed_out(protocol, key.address()))??;

        let session = HttpSession::new(
            self.next_session_id(),
            protocol,
            Dialect::H1(sender),
            &self.config.session,
        );
        // The driver must run for the sender to make progress at all.
        let driver = session.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("http/1 connection terminated: {err}");
            }
            driver.mark_closed();
        });
        Ok(Connection::new(key.clone(), session))
    }

    async fn handshake_h2<S>(
        &self,
        stream: S,
        protocol: SessionProtocol,
        key: &PoolKey,
    ) -> Result<Connection, BoxError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder
            .initial_connection_window_size(self.config.initial_connection_window)
            .initial_stream_window_size(self.config.initial_stream_window);
        let handshake = builder.handshake::<_, Body>(io);
        let (sender, conn) = tokio::time::timeout(self.config.negotiation_timeout, handshake)
            .await
            .map_err(|_| negotiation_timed_out(protocol, key.address()))??;

        let session = HttpSession::new(
            self.next_session_id(),
            protocol,
            Dialect::H2(sender),
            &self.config.session,
        );
        // The driver must run for the sender to make progress at all.
        let driver = session.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("http/2 connection terminated: {err}");
            }
            driver.mark_closed();
        });
        Ok(Connection::new(key.clone(), session))
    }

    #[cfg(feature = "__tls")]
    async fn connect_tls(
        &self,
        desired: SessionProtocol,
        key: &PoolKey,
    ) -> Result<Connection, BoxError> {
        use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};

        let addr = key.address();
        let alpn: Vec<Vec<u8>> = match desired {
            SessionProtocol::H2 => vec![b"h2".to_vec()],
            SessionProtocol::H1 => vec![b"http/1.1".to_vec()],
            _ => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls_config.alpn_protocols = alpn;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(key.host().to_string())
            .map_err(|_| Box::new(ClientError::violation("bad tls server name")) as BoxError)?;

        let stream = self.connect_tcp(addr).await?;
        let tls = tokio::time::timeout(
            self.config.negotiation_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| negotiation_timed_out(desired, addr))??;

        let actual = match tls.get_ref().1.alpn_protocol() {
            Some(b"h2") => SessionProtocol::H2,
            Some(b"http/1.1") | None => SessionProtocol::H1,
            Some(other) => {
                self.mark_unsupported(addr, desired);
                return Err(Box::new(ClientError::ProtocolNegotiation {
                    expected: desired,
                    actual: None,
                    reason: format!("unexpected alpn protocol {other:?}").into(),
                }));
            }
        };
        if desired.is_determined() && actual != desired {
            self.mark_unsupported(addr, desired);
            return Err(Box::new(ClientError::ProtocolNegotiation {
                expected: desired,
                actual: Some(actual),
                reason: "alpn negotiated a different protocol".into(),
            }));
        }

        match actual {
            SessionProtocol::H2 => self.handshake_h2(tls, SessionProtocol::H2, key).await,
            _ => self.handshake_h1(tls, SessionProtocol::H1, key).await,
        }
    }
}

fn negotiation_timed_out(expected: SessionProtocol, addr: SocketAddr) -> BoxError {
    Box::new(ClientError::ProtocolNegotiation {
        expected,
        actual: None,
        reason: format!("negotiation with {addr} timed out").into(),
    })
}

#[cfg(test)]
mod connector_tests {
    use super::{ConnectorConfig, HttpConnector};
    use crate::{
        client::pool::{Connect, PoolKey},
        error::client::ClientError,
        proto::SessionProtocol,
    };

    fn key_for(addr: std::net::SocketAddr) -> PoolKey {
        PoolKey::new("127.0.0.1".into(), addr.ip(), addr.port())
    }

    #[tokio::test]
    async fn failed_negotiations_fail_fast_afterwards() {
        let connector = HttpConnector::new(ConnectorConfig::default());
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        connector.mark_unsupported(addr, SessionProtocol::H2c);

        let err = connector
            .connect(SessionProtocol::H2c, &key_for(addr))
            .await
            .unwrap_err();
        let err = err.downcast::<ClientError>().unwrap();
        assert!(matches!(*err, ClientError::ProtocolNegotiation { .. }));
    }

    #[cfg(not(feature = "__tls"))]
    #[tokio::test]
    async fn tls_without_the_feature_is_refused() {
        let connector = HttpConnector::new(ConnectorConfig::default());
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = connector
            .connect(SessionProtocol::H2, &key_for(addr))
            .await
            .unwrap_err();
        let err = err.downcast::<ClientError>().unwrap();
        assert!(matches!(*err, ClientError::ProtocolNegotiation { .. }));
    }
}
