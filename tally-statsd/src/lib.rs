//! Internal StatsD metrics of the exporter, built on cadence.
//!
//! Every metric is declared once as a variant of an enum implementing one of the metric traits
//! ([`CounterMetric`], [`GaugeMetric`], [`HistogramMetric`], [`TimerMetric`]). The trait only
//! provides the metric name, and the trait kind restricts how the metric can be emitted: a
//! counter cannot be recorded as a timer by accident.
//!
//! Metrics are emitted with the [`metric!`] macro. Until a client is installed with [`init`] or
//! [`set_client`], the macro does nothing.
//!
//! ```
//! use tally_statsd::{CounterMetric, metric};
//!
//! enum ExportCounters {
//!     Dropped,
//! }
//!
//! impl CounterMetric for ExportCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Dropped => "export.samples.dropped",
//!         }
//!     }
//! }
//!
//! metric!(counter(ExportCounters::Dropped) += 3, reason = "queue_full");
//! ```
//!
//! Tags whose name starts with `hc.` are high-cardinality, for example `hc.tenant`. Dotted tag
//! names are written as paths in the macro.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricError, QueuingMetricSink, StatsdClient,
    UdpMetricSink,
};
use parking_lot::RwLock;
use rand::Rng;
use rand::distr::StandardUniform;

/// Metrics queued beyond this limit are dropped by the background sender.
const MAX_QUEUED_METRICS: usize = 100_000;

/// Fraction of metrics that are reported, clamped to `0.0..=1.0`.
#[derive(Debug, Clone, Copy)]
pub struct SampleRate(f64);

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// A statsd client with tags and a sample rate applied to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    /// The underlying cadence client.
    pub statsd_client: StatsdClient,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Sample rate of every metric.
    pub default_sample_rate: SampleRate,
}

/// Options for [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prefix of all metric names.
    pub prefix: &'a str,
    /// Address of the statsd server.
    pub host: A,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Sample rate of every metric.
    pub default_sample_rate: SampleRate,
    /// Packs several metrics into one datagram.
    pub buffered: bool,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl DerefMut for MetricsClient {
    fn deref_mut(&mut self) -> &mut StatsdClient {
        &mut self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric with the default tags, subject to the sample rate.
    #[doc(hidden)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        let rate = self.default_sample_rate.0;
        if !Self::should_send(rate) {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }

        if rate < 1.0 {
            metric = metric.with_sampling_rate(rate);
        }

        if let Err(error) = metric.try_send() {
            tally_log::error!(
                error = &error as &dyn std::error::Error,
                max_queued = MAX_QUEUED_METRICS,
                "failed to send metric"
            );
        }
    }

    fn should_send(rate: f64) -> bool {
        if rate <= 0.0 {
            false
        } else if rate >= 1.0 {
            true
        } else {
            rand::rng().sample::<f64, _>(StandardUniform) <= rate
        }
    }
}

static GLOBAL_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    /// Per-thread view of the client, replaced by the capturing test client.
    static CURRENT_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        RefCell::new(GLOBAL_CLIENT.read().clone());
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Installs `client` for all threads.
pub fn set_client(client: MetricsClient) {
    let client = Arc::new(client);
    *GLOBAL_CLIENT.write() = Some(Arc::clone(&client));
    CURRENT_CLIENT.with(|cell| cell.replace(Some(client)));
}

/// Captures all metrics emitted on the current thread while `f` runs.
///
/// Returns the metrics as statsd lines, without prefix or default tags.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        default_sample_rate: 1.0.into(),
    };

    CURRENT_CLIENT.with(|cell| {
        let previous = cell.replace(Some(Arc::new(client)));
        f();
        cell.replace(previous);
    });

    rx.iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// Reports metrics to the statsd server at `config.host`.
///
/// Metrics go through a bounded queue drained by a background thread.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<A>) -> Result<(), MetricError> {
    let addr = config
        .host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MetricError::from((cadence::ErrorKind::InvalidInput, "no statsd host")))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let statsd_client = if config.buffered {
        let sink = BufferedUdpMetricSink::from(addr, socket)?;
        let sink = QueuingMetricSink::with_capacity(sink, MAX_QUEUED_METRICS);
        StatsdClient::from_sink(config.prefix, sink)
    } else {
        let sink = UdpMetricSink::from(addr, socket)?;
        let sink = QueuingMetricSink::with_capacity(sink, MAX_QUEUED_METRICS);
        StatsdClient::from_sink(config.prefix, sink)
    };

    let sample_rate = f64::from(config.default_sample_rate);
    tally_log::info!(%addr, sample_rate, "reporting metrics to statsd");

    set_client(MetricsClient {
        statsd_client,
        default_tags: config.default_tags,
        default_sample_rate: config.default_sample_rate,
    });

    Ok(())
}

/// Calls `f` with the current client, or returns the default if there is none.
#[doc(hidden)]
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|cell| match cell.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// A duration, reported in milliseconds.
///
/// ```
/// use std::time::Instant;
/// use tally_statsd::{TimerMetric, metric};
///
/// struct SendDuration;
///
/// impl TimerMetric for SendDuration {
///     fn name(&self) -> &'static str {
///         "export.send.duration"
///     }
/// }
///
/// let start = Instant::now();
/// metric!(timer(SendDuration) = start.elapsed(), status = "ok");
/// ```
pub trait TimerMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// A count of events, aggregated by the server. Increments by zero are not sent.
pub trait CounterMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// A value whose distribution is computed by the server.
///
/// ```
/// use tally_statsd::{HistogramMetric, metric};
///
/// struct FillSize;
///
/// impl HistogramMetric for FillSize {
///     fn name(&self) -> &'static str {
///         "export.shard.fill_size"
///     }
/// }
///
/// let taken: usize = 12;
/// metric!(histogram(FillSize) = taken as u64);
/// ```
pub trait HistogramMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// An instantaneous value set by the client.
pub trait GaugeMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// Emits a metric through the current client.
///
/// Supported forms, each followed by optional `tag = value` pairs:
///
///  - `counter(id) += value`
///  - `gauge(id) = value`
///  - `histogram(id) = value`
///  - `timer(id) = duration`
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            0 => {}
            value => $crate::with_client(|client| {
                use $crate::_pred::*;
                client.send_metric(
                    client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                )
            }),
        }
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (histogram($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.histogram_with_tags(&$crate::HistogramMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.time_with_tags(&$crate::TimerMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };
}
