//! Endpoint groups: dynamic ordered sets of [`Endpoint`]s with change
//! notification.
//!
//! An [`EndpointGroup`] is the unit of membership the client resolves
//! targets against. Groups publish a consistent snapshot via
//! [`endpoints`](EndpointGroup::endpoints), notify listeners through an
//! [`async_broadcast`] channel after every mutation, and expose an
//! initial-ready promise so callers can wait for the first resolution.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures::{
    future::BoxFuture,
    stream::{self, StreamExt},
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::endpoint::Endpoint;

#[cfg(feature = "dns")]
pub mod dns;

/// Capacity of the change-notification channel. Slow listeners lose the
/// oldest change; they can always recover from a fresh snapshot.
const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// The group was closed before its initial endpoint list resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("endpoint group was closed before the initial endpoint list was resolved")]
pub struct GroupClosed;

/// The difference between two consecutive endpoint lists.
#[derive(Debug, Clone)]
pub struct EndpointChange {
    /// The full new list, in delegate order.
    pub all: Vec<Endpoint>,
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

/// Computes the [`EndpointChange`] between `prev` and `next`.
///
/// The bool indicates whether there is any difference; when it is false the
/// change carries the new list but should not be dispatched to listeners.
pub fn diff_endpoints(prev: &[Endpoint], next: Vec<Endpoint>) -> (EndpointChange, bool) {
    let mut added = Vec::new();
    let mut removed = Vec::new();

    for ep in &next {
        if !prev.contains(ep) {
            added.push(ep.clone());
        }
    }
    for ep in prev {
        if !next.contains(ep) {
            removed.push(ep.clone());
        }
    }

    let changed = !added.is_empty() || !removed.is_empty() || prev != next.as_slice();

    (
        EndpointChange {
            all: next,
            added,
            removed,
        },
        changed,
    )
}

/// A dynamic ordered set of [`Endpoint`]s.
pub trait EndpointGroup: Send + Sync + 'static {
    /// A consistent snapshot of the current endpoint list.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Subscribes to membership changes. Returns `None` when the group can
    /// never change (e.g. a static list).
    fn watch(&self) -> Option<Receiver<EndpointChange>>;

    /// Resolves once the group has produced its first endpoint list, or
    /// fails with [`GroupClosed`] when the group is closed before that.
    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>>;

    /// Closes the group. Idempotent; terminates the initial-ready promise
    /// with a cancellation if it never resolved.
    fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ready {
    Pending,
    Ready,
    Cancelled,
}

/// The mutable base every concrete group builds on: a snapshot, a change
/// channel, and the initial-ready promise.
pub struct DynamicEndpointGroup {
    snapshot: Mutex<Vec<Endpoint>>,
    tx: Sender<EndpointChange>,
    rx: InactiveReceiver<EndpointChange>,
    ready: watch::Sender<Ready>,
    closed: AtomicBool,
}

impl Default for DynamicEndpointGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicEndpointGroup {
    pub fn new() -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(CHANGE_CHANNEL_CAPACITY);
        tx.set_overflow(true);
        let (ready, _) = watch::channel(Ready::Pending);
        Self {
            snapshot: Mutex::new(Vec::new()),
            tx,
            rx: rx.deactivate(),
            ready,
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the endpoint list, notifying listeners after the mutation
    /// and resolving the initial-ready promise on the first call.
    pub fn set_endpoints(&self, next: Vec<Endpoint>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let change = {
            let mut snapshot = self.snapshot.lock();
            let (change, changed) = diff_endpoints(&snapshot, next);
            *snapshot = change.all.clone();
            changed.then_some(change)
        };
        if let Some(change) = change {
            tracing::trace!(
                added = change.added.len(),
                removed = change.removed.len(),
                total = change.all.len(),
                "endpoint group updated",
            );
            let _ = self.tx.try_broadcast(change);
        }
        self.ready.send_if_modified(|state| {
            if *state == Ready::Pending {
                *state = Ready::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl EndpointGroup for DynamicEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.snapshot.lock().clone()
    }

    fn watch(&self) -> Option<Receiver<EndpointChange>> {
        Some(self.rx.activate_cloned())
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>> {
        let mut rx = self.ready.subscribe();
        Box::pin(async move {
            loop {
                match *rx.borrow_and_update() {
                    Ready::Ready => return Ok(()),
                    Ready::Cancelled => return Err(GroupClosed),
                    Ready::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(GroupClosed);
                }
            }
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.send_if_modified(|state| {
            if *state == Ready::Pending {
                *state = Ready::Cancelled;
                true
            } else {
                false
            }
        });
        self.tx.close();
    }
}

/// An [`EndpointGroup`] over a fixed list.
pub struct StaticEndpointGroup {
    inner: DynamicEndpointGroup,
}

impl StaticEndpointGroup {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let inner = DynamicEndpointGroup::new();
        inner.set_endpoints(endpoints);
        Self { inner }
    }
}

impl From<Vec<Endpoint>> for StaticEndpointGroup {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        Self::new(endpoints)
    }
}

impl EndpointGroup for StaticEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints()
    }

    fn watch(&self) -> Option<Receiver<EndpointChange>> {
        None
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>> {
        self.inner.when_ready()
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Falls back to a secondary group while the primary's list is empty.
///
/// Behavior contract: `endpoints()` returns `secondary.endpoints()` iff
/// `primary.endpoints()` is empty at that instant; otherwise the primary's
/// list is returned unchanged.
pub struct OrElseEndpointGroup {
    primary: Arc<dyn EndpointGroup>,
    secondary: Arc<dyn EndpointGroup>,
    inner: Arc<DynamicEndpointGroup>,
    forwarder: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OrElseEndpointGroup {
    pub fn new(primary: Arc<dyn EndpointGroup>, secondary: Arc<dyn EndpointGroup>) -> Arc<Self> {
        let inner = Arc::new(DynamicEndpointGroup::new());
        let group = Arc::new(Self {
            primary: primary.clone(),
            secondary: secondary.clone(),
            inner: inner.clone(),
            forwarder: Mutex::new(None),
        });

        let task = tokio::spawn(async move {
            // Ready as soon as either delegate has resolved once.
            let _ = futures::future::select(primary.when_ready(), secondary.when_ready()).await;
            inner.set_endpoints(Self::combined(&*primary, &*secondary));

            let watches: Vec<_> = [primary.watch(), secondary.watch()]
                .into_iter()
                .flatten()
                .map(StreamExt::boxed)
                .collect();
            let mut merged = stream::select_all(watches);
            while merged.next().await.is_some() {
                inner.set_endpoints(Self::combined(&*primary, &*secondary));
            }
        });
        *group.forwarder.lock() = Some(task);

        group
    }

    fn combined(primary: &dyn EndpointGroup, secondary: &dyn EndpointGroup) -> Vec<Endpoint> {
        let endpoints = primary.endpoints();
        if endpoints.is_empty() {
            secondary.endpoints()
        } else {
            endpoints
        }
    }
}

impl EndpointGroup for OrElseEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        Self::combined(&*self.primary, &*self.secondary)
    }

    fn watch(&self) -> Option<Receiver<EndpointChange>> {
        self.inner.watch()
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>> {
        self.inner.when_ready()
    }

    fn close(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.primary.close();
        self.secondary.close();
        self.inner.close();
    }
}
