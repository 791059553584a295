//! A DNS-backed endpoint group.
//!
//! Re-resolves a host name on a fixed interval and publishes the resolved
//! addresses as endpoint membership, in resolver order.

use std::{sync::Arc, time::Duration};

use async_broadcast::Receiver;
use futures::future::BoxFuture;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    Resolver, TokioResolver,
};
use parking_lot::Mutex;

use super::{DynamicEndpointGroup, EndpointChange, EndpointGroup, GroupClosed};
use crate::endpoint::Endpoint;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// An [`EndpointGroup`] that resolves a host name via DNS.
pub struct DnsEndpointGroup {
    inner: Arc<DynamicEndpointGroup>,
    refresher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DnsEndpointGroup {
    /// Resolves `host` with the system resolver configuration, publishing
    /// endpoints carrying `port`.
    pub fn new(host: impl Into<faststr::FastStr>, port: u16) -> Self {
        let (conf, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        opts.ip_strategy = LookupIpStrategy::Ipv4thenIpv6;
        Self::with_config(host, port, conf, opts, DEFAULT_REFRESH_INTERVAL)
    }

    /// Builds a group with an explicit resolver configuration and refresh
    /// interval.
    pub fn with_config(
        host: impl Into<faststr::FastStr>,
        port: u16,
        config: ResolverConfig,
        options: ResolverOpts,
        refresh_interval: Duration,
    ) -> Self {
        let host = host.into();
        let mut builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().clone_from(&options);
        let resolver = builder.build();

        let inner = Arc::new(DynamicEndpointGroup::new());
        let refresher = tokio::spawn(Self::refresh_loop(
            inner.clone(),
            resolver,
            host,
            port,
            refresh_interval,
        ));

        Self {
            inner,
            refresher: Mutex::new(Some(refresher)),
        }
    }

    async fn refresh_loop(
        inner: Arc<DynamicEndpointGroup>,
        resolver: TokioResolver,
        host: faststr::FastStr,
        port: u16,
        refresh_interval: Duration,
    ) {
        loop {
            match resolver.lookup_ip(host.as_str()).await {
                Ok(lookup) => {
                    let endpoints = lookup
                        .into_iter()
                        .filter_map(|ip| {
                            Endpoint::new(host.clone())
                                .and_then(|ep| ep.with_port(port))
                                .map(|ep| ep.with_ip(ip))
                                .ok()
                        })
                        .collect();
                    inner.set_endpoints(endpoints);
                }
                Err(err) => {
                    // Keep the previous membership on transient failures.
                    tracing::warn!(host = %host, "dns refresh failed: {err}");
                }
            }
            if inner.is_closed() {
                return;
            }
            tokio::time::sleep(refresh_interval).await;
        }
    }
}

impl EndpointGroup for DnsEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints()
    }

    fn watch(&self) -> Option<Receiver<EndpointChange>> {
        self.inner.watch()
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), GroupClosed>> {
        self.inner.when_ready()
    }

    fn close(&self) {
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
        self.inner.close();
    }
}
