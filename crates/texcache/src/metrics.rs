//! Provides access to the metrics system.
//!
//! Metrics are reported to a statsd sink once [`configure_statsd`] has been called. Until then,
//! every [`metric!`](crate::metric) invocation is a no-op, which is what tests and embedders that
//! do not care about metrics get by default.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client together with the tags configured for this process.
#[derive(Debug)]
pub struct MetricsClient {
    pub statsd_client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Appends the configured tags and sends `metric`.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Reports all metrics to the statsd server at `host`, prefixed with `prefix`.
///
/// Only the first configuration takes effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!(%addr, prefix, "reporting metrics to statsd");
    }

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;
    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink(prefix, sink),
        tags,
    };

    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd metrics were already configured");
    }
    Ok(())
}

/// Invokes `f` with the configured client, or returns the default if there is none.
///
/// Use the [`metric!`](crate::metric) macro instead of calling this directly.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// Supports `counter(id) += n`, `gauge(id) = v`, `timer(id) = duration` and
/// `histogram(id) = v`, each followed by optional `"tag" => value` pairs.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(client.statsd_client.$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_metrics_reach_statsd() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let tags = BTreeMap::from([("env".to_owned(), "test".to_owned())]);
        configure_statsd("texcache", server.local_addr().unwrap(), tags).unwrap();

        metric!(counter("metrics.selftest") += 2, "kind" => "unit");

        // other tests may report metrics through the same client
        let mut buf = [0; 1024];
        let line = loop {
            let len = server.recv(&mut buf).unwrap();
            let line = String::from_utf8_lossy(&buf[..len]).into_owned();
            if line.starts_with("texcache.metrics.selftest") {
                break line;
            }
        };
        assert_eq!(line, "texcache.metrics.selftest:2|c|#kind:unit,env:test");
    }
}
