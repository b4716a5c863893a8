//! Statsd metrics of the volume cache.
//!
//! Until [`configure_statsd`] is called, emitting a metric does nothing. The cache reports:
//!
//! - `cache.access`, `cache.memory.hit` and `cache.entry.created` for every lookup,
//! - the `cache.entries` gauge whenever the entry table changes,
//! - `cache.construction`, `cache.construction.failed` and the `cache.construction.duration`
//!   timer for payload constructions,
//! - the `cache.payload.size` histogram with the weight of every constructed payload,
//! - `cache.unload`, `cache.teardown` and `cache.teardown.failure` as payloads and entries go away.
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::sync::OnceLock;

use anyhow::Context;
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches the configured tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// The underlying statsd client, used to start building a metric.
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the global tags and sends the metric.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Reports all cache metrics to the statsd server at `host`, with names prefixed by `prefix`.
///
/// Fails if the address cannot be resolved or statsd was already configured in this process.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("invalid statsd address")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;
    let statsd = StatsdClient::from_sink(prefix, sink);

    METRICS_CLIENT
        .set(MetricsClient { statsd, tags })
        .map_err(|_| anyhow::anyhow!("statsd is already configured"))
}

/// Invokes `f` with the statsd client, or returns the default if statsd is not configured.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a cache metric, for example `metric!(counter("cache.access") += 1)`.
///
/// Supports `counter`, `gauge`, `timer` (taking a [`Duration`](std::time::Duration)) and
/// `histogram`, each optionally followed by `"tag" => value` pairs.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
