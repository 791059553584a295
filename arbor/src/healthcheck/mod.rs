//! Active health checking over a delegate [`EndpointGroup`].
//!
//! [`HealthCheckedEndpointGroup`] wraps another group and continuously
//! probes every candidate endpoint. The published list is the delegate's
//! current order intersected with the set of endpoints whose latest probe
//! reported a positive health score.
//!
//! The probe implementation itself is opaque: a [`CheckerFactory`] builds
//! one closable checker handle per candidate, bound to a
//! [`HealthCheckerContext`] that owns the checker's scheduled tasks and its
//! health updates.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use async_broadcast::Receiver;
use dashmap::DashSet;
use futures::{future::BoxFuture, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    discovery::{DynamicEndpointGroup, EndpointChange, EndpointGroup, GroupClosed},
    endpoint::Endpoint,
};

/// Computes the delay until the next probe attempt.
///
/// Returning a negative delay is a contract breach and aborts the process.
pub trait Backoff: Send + Sync + 'static {
    fn next_delay_millis(&self) -> i64;
}

/// Fixed-delay backoff with proportional jitter.
pub struct FixedBackoff {
    base_millis: i64,
    jitter: f64,
}

impl FixedBackoff {
    pub fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base_millis: base.as_millis() as i64,
            jitter,
        }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 0.2)
    }
}

impl Backoff for FixedBackoff {
    fn next_delay_millis(&self) -> i64 {
        if self.jitter == 0.0 {
            return self.base_millis;
        }
        let factor = 1.0 + rand::random_range(-self.jitter..=self.jitter);
        (self.base_millis as f64 * factor) as i64
    }
}

/// A checker handle produced by a [`CheckerFactory`]. Closing it must stop
/// all further probes.
pub trait AsyncCloseable: Send + Sync + 'static {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Builds one checker handle per candidate endpoint.
pub trait CheckerFactory: Send + Sync + 'static {
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable>;
}

impl<F> CheckerFactory for F
where
    F: Fn(Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable> + Send + Sync + 'static,
{
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable> {
        self(ctx)
    }
}

/// Configuration of a [`HealthCheckedEndpointGroup`].
pub struct HealthCheckConfig {
    /// When set, probes target this port instead of the endpoint's own.
    pub probe_port: Option<u16>,
    pub backoff: Arc<dyn Backoff>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            probe_port: None,
            backoff: Arc::new(FixedBackoff::default()),
        }
    }
}

struct ScheduledTasks {
    destroyed: bool,
    tasks: AHashMap<u64, tokio::task::JoinHandle<()>>,
}

/// Per-endpoint state owned by the health-check engine.
///
/// One context exists per endpoint currently in the delegate group. It is
/// handed to the checker handle, which uses it to schedule probes and to
/// report results. Destroying the context cancels every task it owns and is
/// idempotent.
pub struct HealthCheckerContext {
    endpoint: Endpoint,
    original: Endpoint,
    backoff: Arc<dyn Backoff>,
    // The task set doubles as the context's lock: every schedule/destroy
    // transition holds it.
    scheduled: Mutex<ScheduledTasks>,
    next_task_id: AtomicU64,
    shared: Weak<GroupShared>,
    initial: Mutex<Option<oneshot::Sender<()>>>,
}

impl HealthCheckerContext {
    /// The endpoint to probe, with the configured probe port applied.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The endpoint as it appears in the delegate group.
    pub fn original_endpoint(&self) -> &Endpoint {
        &self.original
    }

    /// The delay before the next probe attempt.
    ///
    /// # Panics
    ///
    /// Panics when the configured backoff returns a negative delay; that is
    /// a contract breach, not a recoverable condition.
    pub fn next_delay(&self) -> Duration {
        let millis = self.backoff.next_delay_millis();
        if millis < 0 {
            panic!("health-check backoff returned a negative delay: {millis}ms");
        }
        Duration::from_millis(millis as u64)
    }

    /// Schedules `fut` to run after `delay` on the shared event loop.
    ///
    /// The task is owned by this context and cancelled on destroy. Returns
    /// false (without scheduling) once the context has been destroyed.
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.scheduled.lock();
        if guard.destroyed {
            return false;
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
            this.scheduled.lock().tasks.remove(&id);
        });
        guard.tasks.insert(id, handle);
        true
    }

    /// Reports the latest probe result. `score > 0` marks the endpoint
    /// healthy, `score == 0` unhealthy. Resolves the initial-probe promise
    /// on first call.
    pub fn update_health(&self, score: f64) {
        if self.scheduled.lock().destroyed {
            return;
        }
        self.apply_health(score);
    }

    fn apply_health(&self, score: f64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_healthy(&self.original, score > 0.0);
        }
        if let Some(tx) = self.initial.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Destroys the context: cancels every scheduled task and forces a
    /// final unhealthy update. Idempotent.
    pub fn destroy(&self) {
        let snapshot: Vec<_> = {
            let mut guard = self.scheduled.lock();
            if guard.destroyed {
                return;
            }
            guard.destroyed = true;
            guard.tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in snapshot {
            handle.abort();
        }
        tracing::trace!(endpoint = %self.original, "health checker context destroyed");
        // The destroy path bypasses the destroyed check.
        self.apply_health(0.0);
    }

    pub fn is_destroyed(&self) -> bool {
        self.scheduled.lock().destroyed
    }
}

struct GroupShared {
    delegate_order: Mutex<Vec<Endpoint>>,
    healthy: DashSet<Endpoint>,
    inner: DynamicEndpointGroup,
}

impl GroupShared {
    fn set_healthy(&self, endpoint: &Endpoint, healthy: bool) {
        let changed = if healthy {
            self.healthy.insert(endpoint.clone())
        } else {
            self.healthy.remove(endpoint).is_some()
        };
        if changed {
            self.rebuild();
        }
    }

    /// Publishes the delegate's current order intersected with the healthy
    /// set.
    fn rebuild(&self) {
        let order = self.delegate_order.lock().clone();
        let list: Vec<Endpoint> = order
            .into_iter()
            .filter(|ep| self.healthy.contains(ep))
            .collect();
        self.inner.set_endpoints(list);
    }
}

struct ContextEntry {
    ctx: Arc<HealthCheckerContext>,
    handle: Option<Box<dyn AsyncCloseable>>,
}

impl ContextEntry {
    fn teardown(mut self) {
        if let Some(handle) = self.handle.take() {
            tokio::spawn(handle.close());
        }
        self.ctx.destroy();
    }
}

/// An [`EndpointGroup`] filtering a delegate's membership by probe results.
pub struct HealthCheckedEndpointGroup {
    delegate: Arc<dyn EndpointGroup>,
    factory: Arc<dyn CheckerFactory>,
    config: HealthCheckConfig,
    shared: Arc<GroupShared>,
    contexts: Mutex<AHashMap<Endpoint, ContextEntry>>,
    watch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HealthCheckedEndpointGroup {
    /// Wraps `delegate`, probing every candidate with checkers built by
    /// `factory`.
    ///
    /// Resolution waits until every candidate's initial probe has reported,
    /// so `endpoints()` is meaningful on first read.
    pub async fn new(
        delegate: Arc<dyn EndpointGroup>,
        factory: Arc<dyn CheckerFactory>,
        config: HealthCheckConfig,
    ) -> Result<Arc<Self>, GroupClosed> {
        delegate.when_ready().await?;

        let group = Arc::new(Self {
            delegate: delegate.clone(),
            factory,
            config,
            shared: Arc::new(GroupShared {
                delegate_order: Mutex::new(Vec::new()),
                healthy: DashSet::new(),
                inner: DynamicEndpointGroup::new(),
            }),
            contexts: Mutex::new(AHashMap::new()),
            watch_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let initial_probes = group.apply_candidates(delegate.endpoints());
        for rx in initial_probes {
            let _ = rx.await;
        }
        group.shared.rebuild();

        if let Some(watch) = delegate.watch() {
            let weak = Arc::downgrade(&group);
            let task = tokio::spawn(Self::watch_loop(weak, watch));
            *group.watch_task.lock() = Some(task);
        }

        Ok(group)
    }

    async fn watch_loop(weak: Weak<Self>, mut watch: Receiver<EndpointChange>) {
        while let Some(change) = watch.next().await {
            let Some(group) = weak.upgrade() else {
                return;
            };
            if group.closed.load(Ordering::Acquire) {
                return;
            }
            // New candidates start probing immediately; membership is
            // published as their probes report.
            let _ = group.apply_candidates(change.all);
        }
    }

    /// Applies a new candidate list: destroys contexts of removed
    /// endpoints, creates contexts for new ones, and returns the initial
    /// probe receivers of the newly created contexts.
    fn apply_candidates(self: &Arc<Self>, candidates: Vec<Endpoint>) -> Vec<oneshot::Receiver<()>> {
        *self.shared.delegate_order.lock() = candidates.clone();

        let mut receivers = Vec::new();
        let candidate_set: AHashSet<Endpoint> = candidates.iter().cloned().collect();
        let mut contexts = self.contexts.lock();

        let removed: Vec<Endpoint> = contexts
            .keys()
            .filter(|ep| !candidate_set.contains(*ep))
            .cloned()
            .collect();
        for ep in removed {
            if let Some(entry) = contexts.remove(&ep) {
                entry.teardown();
            }
        }

        for ep in candidates {
            if contexts.contains_key(&ep) {
                continue;
            }
            let probe_endpoint = match self.config.probe_port {
                Some(port) => ep
                    .clone()
                    .with_port(port)
                    .unwrap_or_else(|_| ep.clone()),
                None => ep.clone(),
            };
            let (tx, rx) = oneshot::channel();
            let ctx = Arc::new(HealthCheckerContext {
                endpoint: probe_endpoint,
                original: ep.clone(),
                backoff: self.config.backoff.clone(),
                scheduled: Mutex::new(ScheduledTasks {
                    destroyed: false,
                    tasks: AHashMap::new(),
                }),
                next_task_id: AtomicU64::new(0),
                shared: Arc::downgrade(&self.shared),
                initial: Mutex::new(Some(tx)),
            });
            let handle = self.factory.create(ctx.clone());
            contexts.insert(
                ep,
                ContextEntry {
                    ctx,
                    handle: Some(handle),
                },
            );
            receivers.push(rx);
        }
        drop(contexts);

        self.shared.rebuild();
        receivers
    }

    #[cfg(test)]
    fn context_of(&self, endpoint: &Endpoint) -> Option<Arc<HealthCheckerContext>> {
        self.contexts.lock().get(endpoint).map(|e| e.ctx.clone())
    }
}

impl EndpointGroup for HealthCheckedEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.inner.endpoints()
    }

    fn watch(&self) -> Option<Receiver<EndpointChange>> {
        self.shared.inner.watch()
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>> {
        self.shared.inner.when_ready()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        let entries: Vec<ContextEntry> = {
            let mut contexts = self.contexts.lock();
            contexts.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.teardown();
        }
        self.shared.inner.close();
        self.delegate.close();
    }
}

#[cfg(test)]
mod healthcheck_tests {
    use std::{
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use futures::future::BoxFuture;

    use super::{
        AsyncCloseable, Backoff, CheckerFactory, FixedBackoff, HealthCheckConfig,
        HealthCheckedEndpointGroup, HealthCheckerContext,
    };
    use crate::{
        discovery::{DynamicEndpointGroup, EndpointGroup},
        endpoint::Endpoint,
    };

    fn ep(authority: &str) -> Endpoint {
        Endpoint::parse(authority).unwrap()
    }

    struct NoopHandle;

    impl AsyncCloseable for NoopHandle {
        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    /// Records every context it is handed and reports healthy immediately.
    struct RecordingFactory {
        contexts: StdMutex<Vec<Arc<HealthCheckerContext>>>,
        initial_score: f64,
    }

    impl RecordingFactory {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                contexts: StdMutex::new(Vec::new()),
                initial_score: 1.0,
            })
        }
    }

    impl CheckerFactory for RecordingFactory {
        fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable> {
            let score = self.initial_score;
            let probe = ctx.clone();
            ctx.schedule(Duration::ZERO, async move {
                probe.update_health(score);
            });
            self.contexts.lock().unwrap().push(ctx);
            Box::new(NoopHandle)
        }
    }

    fn find_ctx(
        factory: &RecordingFactory,
        endpoint: &Endpoint,
    ) -> Arc<HealthCheckerContext> {
        factory
            .contexts
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.original_endpoint() == endpoint)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn membership_follows_probe_results() {
        let delegate = Arc::new(DynamicEndpointGroup::new());
        delegate.set_endpoints(vec![ep("a:1"), ep("b:1"), ep("c:1")]);

        let factory = RecordingFactory::healthy();
        let group = HealthCheckedEndpointGroup::new(
            delegate.clone(),
            factory.clone(),
            HealthCheckConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(group.endpoints(), vec![ep("a:1"), ep("b:1"), ep("c:1")]);

        // A turns unhealthy.
        find_ctx(&factory, &ep("a:1")).update_health(0.0);
        assert_eq!(group.endpoints(), vec![ep("b:1"), ep("c:1")]);

        // B leaves the delegate; its context must be destroyed.
        let b_ctx = find_ctx(&factory, &ep("b:1"));
        delegate.set_endpoints(vec![ep("a:1"), ep("c:1")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b_ctx.is_destroyed());
        assert_eq!(group.endpoints(), vec![ep("c:1")]);

        // A recovers; delegate order is preserved.
        find_ctx(&factory, &ep("a:1")).update_health(1.0);
        assert_eq!(group.endpoints(), vec![ep("a:1"), ep("c:1")]);

        group.close();
    }

    #[tokio::test]
    async fn construction_waits_for_initial_probes() {
        struct SlowFactory;

        impl CheckerFactory for SlowFactory {
            fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn AsyncCloseable> {
                let probe = ctx.clone();
                ctx.schedule(Duration::from_millis(50), async move {
                    probe.update_health(1.0);
                });
                Box::new(NoopHandle)
            }
        }

        let delegate = Arc::new(DynamicEndpointGroup::new());
        delegate.set_endpoints(vec![ep("a:1"), ep("b:1")]);

        let group = HealthCheckedEndpointGroup::new(
            delegate,
            Arc::new(SlowFactory),
            HealthCheckConfig::default(),
        )
        .await
        .unwrap();

        // Both probes must have reported before new() returned.
        assert_eq!(group.endpoints(), vec![ep("a:1"), ep("b:1")]);
        group.close();
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_refuses_new_tasks() {
        let delegate = Arc::new(DynamicEndpointGroup::new());
        delegate.set_endpoints(vec![ep("a:1")]);

        let factory = RecordingFactory::healthy();
        let group = HealthCheckedEndpointGroup::new(
            delegate,
            factory.clone(),
            HealthCheckConfig::default(),
        )
        .await
        .unwrap();

        let ctx = find_ctx(&factory, &ep("a:1"));
        ctx.destroy();
        ctx.destroy();
        assert!(ctx.is_destroyed());
        assert!(group.endpoints().is_empty());

        // Post-destroy scheduling is refused.
        assert!(!ctx.schedule(Duration::ZERO, async {}));
        // Post-destroy health updates are ignored.
        ctx.update_health(1.0);
        assert!(group.endpoints().is_empty());

        group.close();
    }

    #[tokio::test]
    async fn probe_port_rewrites_the_probe_target_only() {
        let delegate = Arc::new(DynamicEndpointGroup::new());
        delegate.set_endpoints(vec![ep("a:8080")]);

        let factory = RecordingFactory::healthy();
        let config = HealthCheckConfig {
            probe_port: Some(9090),
            ..Default::default()
        };
        let group = HealthCheckedEndpointGroup::new(delegate, factory.clone(), config)
            .await
            .unwrap();

        let ctx = group.context_of(&ep("a:8080")).unwrap();
        assert_eq!(ctx.endpoint().port(), Some(9090));
        assert_eq!(ctx.original_endpoint().port(), Some(8080));
        // The published membership keeps the original port.
        assert_eq!(group.endpoints(), vec![ep("a:8080")]);

        group.close();
    }

    #[test]
    #[should_panic(expected = "negative delay")]
    fn negative_backoff_is_fatal() {
        struct NegativeBackoff;

        impl Backoff for NegativeBackoff {
            fn next_delay_millis(&self) -> i64 {
                -1
            }
        }

        let ctx = HealthCheckerContext {
            endpoint: ep("a:1"),
            original: ep("a:1"),
            backoff: Arc::new(NegativeBackoff),
            scheduled: parking_lot::Mutex::new(super::ScheduledTasks {
                destroyed: false,
                tasks: ahash::AHashMap::new(),
            }),
            next_task_id: std::sync::atomic::AtomicU64::new(0),
            shared: std::sync::Weak::new(),
            initial: parking_lot::Mutex::new(None),
        };
        let _ = ctx.next_delay();
    }

    #[test]
    fn fixed_backoff_jitter_stays_in_range() {
        let backoff = FixedBackoff::new(Duration::from_secs(3), 0.2);
        for _ in 0..100 {
            let delay = backoff.next_delay_millis();
            assert!((2400..=3600).contains(&delay), "delay {delay} out of range");
        }
    }
}
