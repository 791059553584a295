//! The connection pool.
//!
//! Hands out a connection matching a desired protocol and [`PoolKey`],
//! either from the idle cache or by initiating/piggybacking a pending
//! connect, and reclaims connections on release.
//!
//! HTTP/1 connections are loaned exclusively: they leave the pool on
//! acquire and come back on release once the response completes. HTTP/2
//! connections stay in the idle cache and are shared by every acquirer
//! until they hit their stream cap.

use std::{
    collections::VecDeque,
    hash::{BuildHasher, Hash, Hasher},
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use ahash::AHashMap;
use arbor::endpoint::Endpoint;
use faststr::FastStr;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    error::{client::ClientError, BoxError, SharedError},
    proto::SessionProtocol,
};

/// The pool's map key: a resolved (host, ip, port) triple with a
/// precomputed hash.
#[derive(Debug, Clone)]
pub struct PoolKey {
    host: FastStr,
    ip: IpAddr,
    port: u16,
    hash: u64,
}

impl PoolKey {
    pub fn new(host: FastStr, ip: IpAddr, port: u16) -> Self {
        // Fixed seeds keep the precomputed hash stable across maps.
        let hasher = ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        );
        let hash = hasher.hash_one((&host, ip, port));
        Self {
            host,
            ip,
            port,
            hash,
        }
    }

    /// Builds a key from a resolved endpoint. Returns `None` when the
    /// endpoint carries no IP address.
    pub fn from_endpoint(endpoint: &Endpoint, default_port: u16) -> Option<Self> {
        let ip = endpoint.ip()?;
        Some(Self::new(
            FastStr::new(endpoint.host()),
            ip,
            endpoint.port_or(default_port),
        ))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl PartialEq for PoolKey {
    fn eq(&self, other: &Self) -> bool {
        // The ip is the most selective component; compare it first.
        self.ip == other.ip && self.port == other.port && self.host == other.host
    }
}

impl Eq for PoolKey {}

impl Hash for PoolKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// A connection as the pool sees it.
pub trait PoolableConnection: Send + Sync + Clone + 'static {
    /// Process-unique id of the underlying channel.
    fn id(&self) -> u64;

    /// The negotiated protocol; always a determined dialect.
    fn protocol(&self) -> SessionProtocol;

    /// Underlying channel active and its session accepting requests.
    fn is_healthy(&self) -> bool;

    /// Below the session's concurrent-stream cap.
    fn can_accept_more_streams(&self) -> bool;

    /// Initiates channel close.
    fn close(&self);

    /// Resolves when the underlying channel has closed.
    fn on_close(&self) -> BoxFuture<'static, ()>;
}

/// Establishes and negotiates one connection.
///
/// Failures are returned as bare causes; the pool wraps them as
/// [`UnprocessedRequest`](ClientError::UnprocessedRequest) so retry safety
/// stays obvious to callers.
pub trait Connect<C>: Send + Sync + 'static {
    fn connect(&self, desired: SessionProtocol, key: &PoolKey)
        -> BoxFuture<'static, Result<C, BoxError>>;
}

/// Observes connection lifecycle at the pool boundary.
pub trait PoolListener: Send + Sync + 'static {
    fn connection_open(&self, _protocol: SessionProtocol, _key: &PoolKey) {}
    fn connection_closed(&self, _protocol: SessionProtocol, _key: &PoolKey) {}
}

#[derive(Debug, thiserror::Error)]
#[error("connection pool is closed")]
struct PoolClosed;

struct Pending<C> {
    waiters: Vec<oneshot::Sender<Result<C, SharedError>>>,
}

/// Idle connections per determined protocol: a small fixed structure
/// instead of a map keyed by protocol.
struct ProtocolMap<T> {
    h1: T,
    h1c: T,
    h2: T,
    h2c: T,
}

impl<T: Default> Default for ProtocolMap<T> {
    fn default() -> Self {
        Self {
            h1: T::default(),
            h1c: T::default(),
            h2: T::default(),
            h2c: T::default(),
        }
    }
}

impl<T> ProtocolMap<T> {
    fn get_mut(&mut self, protocol: SessionProtocol) -> Option<&mut T> {
        match protocol {
            SessionProtocol::H1 => Some(&mut self.h1),
            SessionProtocol::H1c => Some(&mut self.h1c),
            SessionProtocol::H2 => Some(&mut self.h2),
            SessionProtocol::H2c => Some(&mut self.h2c),
            SessionProtocol::Http | SessionProtocol::Https => None,
        }
    }
}

struct PoolState<C> {
    idle: ProtocolMap<AHashMap<PoolKey, VecDeque<C>>>,
    pending: AHashMap<(SessionProtocol, PoolKey), Pending<C>>,
    live: AHashMap<u64, (SessionProtocol, PoolKey, C)>,
    closed: bool,
}

impl<C: PoolableConnection> PoolState<C> {
    /// Best-effort idle lookup across the dialects `desired` resolves to.
    fn acquire_idle_for(&mut self, desired: SessionProtocol, key: &PoolKey) -> Option<C> {
        for proto in desired.fallback_protocols() {
            if let Some(conn) = self.acquire_idle(*proto, key) {
                return Some(conn);
            }
        }
        None
    }

    fn acquire_idle(&mut self, protocol: SessionProtocol, key: &PoolKey) -> Option<C> {
        let deque = self.idle.get_mut(protocol)?.get_mut(key)?;
        if protocol.is_multiplex() {
            // Peek the most recently released; rotate saturated connections
            // to the front and keep scanning.
            let mut scanned = 0;
            while scanned < deque.len() {
                match deque.back() {
                    None => break,
                    Some(conn) if !conn.is_healthy() => {
                        deque.pop_back();
                    }
                    Some(conn) if !conn.can_accept_more_streams() => {
                        let conn = deque.pop_back().expect("peeked connection");
                        deque.push_front(conn);
                        scanned += 1;
                    }
                    Some(conn) => return Some(conn.clone()),
                }
            }
            None
        } else {
            // Remove the most recently released healthy connection; discard
            // unhealthy ones from the tail.
            while let Some(conn) = deque.pop_back() {
                if conn.is_healthy() {
                    return Some(conn);
                }
                tracing::trace!(id = conn.id(), "discarding unhealthy idle connection");
            }
            None
        }
    }

    fn idle_deque(&mut self, protocol: SessionProtocol, key: &PoolKey) -> &mut VecDeque<C> {
        self.idle
            .get_mut(protocol)
            .expect("determined protocol")
            .entry(key.clone())
            .or_default()
    }
}

enum AcquirePlan<C> {
    Ready(C),
    Piggyback(oneshot::Receiver<Result<C, SharedError>>),
    Connect { registered: bool },
}

struct PoolShared<C> {
    state: Mutex<PoolState<C>>,
    connector: Arc<dyn Connect<C>>,
    listeners: Vec<Arc<dyn PoolListener>>,
}

/// The process-wide connection cache, keyed by protocol × [`PoolKey`].
pub struct ConnectionPool<C> {
    shared: Arc<PoolShared<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PoolableConnection> ConnectionPool<C> {
    pub fn new(connector: Arc<dyn Connect<C>>) -> Self {
        Self::with_listeners(connector, Vec::new())
    }

    pub fn with_listeners(
        connector: Arc<dyn Connect<C>>,
        listeners: Vec<Arc<dyn PoolListener>>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: ProtocolMap::default(),
                    pending: AHashMap::new(),
                    live: AHashMap::new(),
                    closed: false,
                }),
                connector,
                listeners,
            }),
        }
    }

    /// Synchronous best-effort acquisition from the idle cache.
    pub fn acquire_now(&self, desired: SessionProtocol, key: &PoolKey) -> Option<C> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        state.acquire_idle_for(desired, key)
    }

    /// Acquires a connection, reusing idle ones, piggybacking on a pending
    /// connect where the protocol allows it, or connecting anew.
    pub async fn acquire(
        &self,
        desired: SessionProtocol,
        key: &PoolKey,
    ) -> Result<C, ClientError> {
        let plan = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ClientError::unprocessed(PoolClosed));
            }
            if let Some(conn) = state.acquire_idle_for(desired, key) {
                AcquirePlan::Ready(conn)
            } else if matches!(desired, SessionProtocol::H1 | SessionProtocol::H1c) {
                // No piggyback: an HTTP/1 connection only becomes available
                // once its response completes.
                AcquirePlan::Connect { registered: false }
            } else if let Some(pending) = state.pending.get_mut(&(desired, key.clone())) {
                let (tx, rx) = oneshot::channel();
                pending.waiters.push(tx);
                AcquirePlan::Piggyback(rx)
            } else {
                state
                    .pending
                    .insert((desired, key.clone()), Pending { waiters: Vec::new() });
                AcquirePlan::Connect { registered: true }
            }
        };

        match plan {
            AcquirePlan::Ready(conn) => Ok(conn),
            AcquirePlan::Connect { registered } => {
                self.connect_and_publish(desired, key, registered).await
            }
            AcquirePlan::Piggyback(rx) => match rx.await {
                Ok(Ok(conn)) => {
                    if conn.protocol().is_multiplex() {
                        Ok(conn)
                    } else {
                        // The pending connect negotiated a non-multiplexed
                        // dialect; it cannot be shared. Retry on the actual
                        // protocol and connect fresh if still empty.
                        let actual = conn.protocol();
                        match self.acquire_now(actual, key) {
                            Some(conn) => Ok(conn),
                            None => self.connect_and_publish(actual, key, false).await,
                        }
                    }
                }
                Ok(Err(cause)) => Err(ClientError::unprocessed(cause)),
                Err(_) => Err(ClientError::unprocessed(PoolClosed)),
            },
        }
    }

    async fn connect_and_publish(
        &self,
        desired: SessionProtocol,
        key: &PoolKey,
        registered: bool,
    ) -> Result<C, ClientError> {
        let result = self.shared.connector.connect(desired, key).await;

        let (outcome, waiters) = {
            let mut state = self.shared.state.lock();
            let waiters = if registered {
                state
                    .pending
                    .remove(&(desired, key.clone()))
                    .map(|p| p.waiters)
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            match result {
                Ok(conn) => {
                    if state.closed {
                        conn.close();
                        (Err(ClientError::unprocessed(PoolClosed)), waiters)
                    } else {
                        let protocol = conn.protocol();
                        debug_assert!(protocol.is_determined());
                        state
                            .live
                            .insert(conn.id(), (protocol, key.clone(), conn.clone()));
                        if protocol.is_multiplex() {
                            state.idle_deque(protocol, key).push_back(conn.clone());
                        }
                        (Ok(conn), waiters)
                    }
                }
                Err(err) => (Err(ClientError::unprocessed(err)), waiters),
            }
        };

        match outcome {
            Ok(conn) => {
                let protocol = conn.protocol();
                tracing::debug!(id = conn.id(), %protocol, addr = %key.address(), "connection established");
                for listener in &self.shared.listeners {
                    listener.connection_open(protocol, key);
                }
                // Sweep the pool once the channel dies.
                let pool = self.clone();
                let on_close = conn.on_close();
                let conn_id = conn.id();
                tokio::spawn(async move {
                    on_close.await;
                    pool.on_connection_closed(conn_id);
                });
                for waiter in waiters {
                    let _ = waiter.send(Ok(conn.clone()));
                }
                Ok(conn)
            }
            Err(err) => {
                tracing::debug!(%desired, addr = %key.address(), "connect failed: {err}");
                let cause = SharedError::new(err);
                for waiter in waiters {
                    let _ = waiter.send(Err(cause.clone()));
                }
                Err(ClientError::unprocessed(cause))
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// HTTP/2 releases are no-ops: the connection never left the idle
    /// cache. HTTP/1 releases re-check health and re-insert at the tail.
    pub fn release(&self, conn: C, key: &PoolKey) {
        let protocol = conn.protocol();
        if protocol.is_multiplex() {
            return;
        }
        if !conn.is_healthy() {
            tracing::trace!(id = conn.id(), "dropping unhealthy connection on release");
            return;
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            conn.close();
            return;
        }
        state.idle_deque(protocol, key).push_back(conn);
    }

    /// Handles the death of a channel: removes it from the live set,
    /// sweeps the head of the relevant idle deque, and notifies listeners.
    pub fn on_connection_closed(&self, conn_id: u64) {
        let notified = {
            let mut state = self.shared.state.lock();
            let Some((protocol, key, _conn)) = state.live.remove(&conn_id) else {
                return;
            };
            if let Some(deque) = state
                .idle
                .get_mut(protocol)
                .and_then(|idle| idle.get_mut(&key))
            {
                while deque.front().is_some_and(|c| !c.is_healthy()) {
                    deque.pop_front();
                }
            }
            (protocol, key)
        };
        tracing::trace!(id = conn_id, "connection closed");
        for listener in &self.shared.listeners {
            listener.connection_closed(notified.0, &notified.1);
        }
    }

    /// Blocks new acquisitions, closes every live channel and waits for
    /// their close futures.
    pub async fn close(&self) {
        let (live, pending) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle = ProtocolMap::default();
            let live: Vec<C> = state.live.values().map(|(_, _, c)| c.clone()).collect();
            let pending: Vec<Pending<C>> =
                state.pending.drain().map(|(_, p)| p).collect();
            (live, pending)
        };
        for p in pending {
            let cause = SharedError::new(PoolClosed);
            for waiter in p.waiters {
                let _ = waiter.send(Err(cause.clone()));
            }
        }
        for conn in &live {
            conn.close();
        }
        for conn in live {
            conn.on_close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of idle connections for (protocol, key). Test/observability.
    pub fn idle_count(&self, protocol: SessionProtocol, key: &PoolKey) -> usize {
        let mut state = self.shared.state.lock();
        state
            .idle
            .get_mut(protocol)
            .and_then(|idle| idle.get(key))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Whether a pending acquisition exists for (protocol, key).
    pub fn has_pending(&self, protocol: SessionProtocol, key: &PoolKey) -> bool {
        self.shared
            .state
            .lock()
            .pending
            .contains_key(&(protocol, key.clone()))
    }
}

#[cfg(test)]
mod pool_tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::future::BoxFuture;

    use super::{Connect, ConnectionPool, PoolKey, PoolableConnection};
    use crate::{
        error::{client::ClientError, BoxError},
        proto::SessionProtocol,
    };

    fn key() -> PoolKey {
        PoolKey::new("example.com".into(), "127.0.0.1".parse().unwrap(), 8080)
    }

    #[derive(Debug, Clone)]
    struct TestConn {
        inner: Arc<TestConnInner>,
    }

    #[derive(Debug)]
    struct TestConnInner {
        id: u64,
        protocol: SessionProtocol,
        healthy: AtomicBool,
        at_cap: AtomicBool,
        closed: tokio::sync::watch::Sender<bool>,
    }

    impl TestConn {
        fn new(id: u64, protocol: SessionProtocol) -> Self {
            let (closed, _) = tokio::sync::watch::channel(false);
            Self {
                inner: Arc::new(TestConnInner {
                    id,
                    protocol,
                    healthy: AtomicBool::new(true),
                    at_cap: AtomicBool::new(false),
                    closed,
                }),
            }
        }

        fn set_healthy(&self, healthy: bool) {
            self.inner.healthy.store(healthy, Ordering::SeqCst);
        }

        fn set_at_cap(&self, at_cap: bool) {
            self.inner.at_cap.store(at_cap, Ordering::SeqCst);
        }
    }

    impl PoolableConnection for TestConn {
        fn id(&self) -> u64 {
            self.inner.id
        }

        fn protocol(&self) -> SessionProtocol {
            self.inner.protocol
        }

        fn is_healthy(&self) -> bool {
            self.inner.healthy.load(Ordering::SeqCst)
        }

        fn can_accept_more_streams(&self) -> bool {
            !self.inner.at_cap.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.inner.healthy.store(false, Ordering::SeqCst);
            let _ = self.inner.closed.send(true);
        }

        fn on_close(&self) -> BoxFuture<'static, ()> {
            let mut rx = self.inner.closed.subscribe();
            Box::pin(async move {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            })
        }
    }

    struct TestConnector {
        protocol: SessionProtocol,
        delay: Duration,
        connects: AtomicUsize,
        next_id: AtomicU64,
    }

    impl TestConnector {
        fn new(protocol: SessionProtocol) -> Arc<Self> {
            Self::with_delay(protocol, Duration::ZERO)
        }

        fn with_delay(protocol: SessionProtocol, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                protocol,
                delay,
                connects: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            })
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl Connect<TestConn> for TestConnector {
        fn connect(
            &self,
            _desired: SessionProtocol,
            _key: &PoolKey,
        ) -> BoxFuture<'static, Result<TestConn, BoxError>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let conn = TestConn::new(id, self.protocol);
            let delay = self.delay;
            Box::pin(async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                Ok(conn)
            })
        }
    }

    #[tokio::test]
    async fn http2_acquisitions_share_one_connection() {
        let connector = TestConnector::new(SessionProtocol::H2c);
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let conn = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
            ids.push(conn.id());
            pool.release(conn, &key);
        }

        assert_eq!(connector.connect_count(), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        // The multiplexed connection never leaves the idle cache.
        assert_eq!(pool.idle_count(SessionProtocol::H2c, &key), 1);
    }

    #[tokio::test]
    async fn http2_connects_are_single_flight() {
        let connector = TestConnector::with_delay(SessionProtocol::H2c, Duration::from_millis(50));
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let (a, b) = tokio::join!(
            pool.acquire(SessionProtocol::H2c, &key),
            pool.acquire(SessionProtocol::H2c, &key),
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(connector.connect_count(), 1);
        assert!(!pool.has_pending(SessionProtocol::H2c, &key));
    }

    #[tokio::test]
    async fn http1_acquisitions_connect_independently() {
        let connector = TestConnector::with_delay(SessionProtocol::H1c, Duration::from_millis(20));
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let (a, b) = tokio::join!(
            pool.acquire(SessionProtocol::H1c, &key),
            pool.acquire(SessionProtocol::H1c, &key),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(connector.connect_count(), 2);
        assert_ne!(a.id(), b.id());

        // Released connections park in the idle deque.
        pool.release(a, &key);
        let second_released = b.id();
        pool.release(b, &key);
        assert_eq!(pool.idle_count(SessionProtocol::H1c, &key), 2);

        // The most recently released comes back first.
        let conn = pool.acquire(SessionProtocol::H1c, &key).await.unwrap();
        assert_eq!(conn.id(), second_released);
        assert_eq!(pool.idle_count(SessionProtocol::H1c, &key), 1);
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn saturated_http2_connections_are_deprioritized() {
        let connector = TestConnector::new(SessionProtocol::H2c);
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let first = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
        first.set_at_cap(true);

        // The saturated connection is rotated away and a fresh connect runs.
        let second = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.idle_count(SessionProtocol::H2c, &key), 2);

        // With capacity back, the pool multiplexes again without connecting.
        first.set_at_cap(false);
        let third = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        let _ = third;
    }

    #[tokio::test]
    async fn undetermined_protocol_piggyback_retries_on_http1() {
        // The connector negotiates plain HTTP/1 for an undetermined
        // cleartext connect; the piggybacked waiter cannot share it.
        let connector = TestConnector::with_delay(SessionProtocol::H1c, Duration::from_millis(30));
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let (a, b) = tokio::join!(
            pool.acquire(SessionProtocol::Http, &key),
            pool.acquire(SessionProtocol::Http, &key),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id(), b.id());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn dead_connections_are_swept() {
        let connector = TestConnector::new(SessionProtocol::H2c);
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let conn = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
        assert_eq!(pool.idle_count(SessionProtocol::H2c, &key), 1);

        conn.set_healthy(false);
        pool.on_connection_closed(conn.id());
        assert_eq!(pool.idle_count(SessionProtocol::H2c, &key), 0);

        // The next acquisition reconnects.
        let fresh = pool.acquire(SessionProtocol::H2c, &key).await.unwrap();
        assert_ne!(fresh.id(), conn.id());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_blocks_new_acquisitions_and_fails_waiters() {
        let connector = TestConnector::with_delay(SessionProtocol::H2c, Duration::from_secs(60));
        let pool = ConnectionPool::new(connector.clone());
        let key = key();

        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move {
                // Piggyback on the never-finishing connect below.
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.acquire(SessionProtocol::H2c, &key).await
            })
        };
        let pool2 = pool.clone();
        let key2 = key.clone();
        let connecting = tokio::spawn(async move {
            pool2.acquire(SessionProtocol::H2c, &key2).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close().await;
        assert!(pool.is_closed());

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_retry_safe());
        // The original connect resolves against the closed pool.
        let err = connecting.await.unwrap().unwrap_err();
        assert!(err.is_retry_safe());

        let err = pool.acquire(SessionProtocol::H2c, &key).await.unwrap_err();
        assert!(matches!(err, ClientError::UnprocessedRequest { .. }));
    }
}
