use std::sync::atomic::{AtomicU64, Ordering};

use crate::statsd::{ExporterCounters, ExporterGauges};

/// Why samples were dropped before reaching the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The target shard's buffer was full.
    QueueFull,
    /// The sample was outside the leased time range, or no lease was held.
    OutOfLease,
    /// The conversion layer failed to convert the sample.
    ConversionFailed,
    /// The remote write containing the sample failed.
    SendFailed,
    /// The sample was still buffered when the exporter shut down.
    Shutdown,
}

impl DropReason {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Self::QueueFull => 0,
            Self::OutOfLease => 1,
            Self::ConversionFailed => 2,
            Self::SendFailed => 3,
            Self::Shutdown => 4,
        }
    }

    /// Returns the name used in the `reason` metric tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::OutOfLease => "out_of_lease",
            Self::ConversionFailed => "conversion_failed",
            Self::SendFailed => "send_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Running totals of the exporter.
///
/// Every update is mirrored to the corresponding statsd metric, so totals are observable both
/// in-process and through the metrics pipeline.
#[derive(Debug, Default)]
pub struct ExporterStats {
    exported: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
    disabled_calls: AtomicU64,
    in_flight: AtomicU64,
    dropped: [AtomicU64; DropReason::COUNT],
}

impl ExporterStats {
    pub(crate) fn record_exported(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.exported.fetch_add(count as u64, Ordering::Relaxed);
        tally_statsd::metric!(counter(ExporterCounters::SamplesExported) += count as i64);
    }

    pub(crate) fn record_dropped(&self, reason: DropReason, count: usize) {
        if count == 0 {
            return;
        }
        self.dropped[reason.index()].fetch_add(count as u64, Ordering::Relaxed);
        tally_statsd::metric!(
            counter(ExporterCounters::SamplesDropped) += count as i64,
            reason = reason.as_str(),
        );
    }

    pub(crate) fn record_sent(&self, count: usize) {
        self.sent.fetch_add(count as u64, Ordering::Relaxed);
        tally_statsd::metric!(counter(ExporterCounters::SamplesSent) += count as i64);
    }

    pub(crate) fn record_send_error(&self, tenant: &str) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        tally_statsd::metric!(
            counter(ExporterCounters::SendErrors) += 1,
            hc.tenant = tenant,
        );
    }

    pub(crate) fn record_disabled_call(&self) {
        self.disabled_calls.fetch_add(1, Ordering::Relaxed);
        tally_statsd::metric!(counter(ExporterCounters::CalledWhileDisabled) += 1);
    }

    pub(crate) fn send_started(&self) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        tally_statsd::metric!(gauge(ExporterGauges::SendsInFlight) = in_flight);
    }

    pub(crate) fn send_finished(&self) {
        let in_flight = self.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        tally_statsd::metric!(gauge(ExporterGauges::SendsInFlight) = in_flight);
    }

    /// Returns a consistent-enough copy of all totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            exported: self.exported.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            disabled_calls: self.disabled_calls.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            dropped: std::array::from_fn(|i| self.dropped[i].load(Ordering::Relaxed)),
        }
    }
}

/// A point-in-time copy of [`ExporterStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Samples accepted into shard queues.
    pub exported: u64,
    /// Samples written to the backend.
    pub sent: u64,
    /// Failed remote writes.
    pub send_errors: u64,
    /// Export calls while exporting was disabled.
    pub disabled_calls: u64,
    /// Remote writes in flight.
    pub in_flight: u64,
    dropped: [u64; DropReason::COUNT],
}

impl StatsSnapshot {
    /// Returns the number of samples dropped for the given reason.
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()]
    }

    /// Returns the number of samples dropped for any reason.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_dropped_emits_reason() {
        let stats = ExporterStats::default();

        let captures = tally_statsd::with_capturing_test_client(|| {
            stats.record_dropped(DropReason::QueueFull, 3);
            stats.record_dropped(DropReason::OutOfLease, 0);
            stats.record_dropped(DropReason::Shutdown, 1);
        });

        assert_eq!(
            captures,
            [
                "export.samples.dropped:3|c|#reason:queue_full",
                "export.samples.dropped:1|c|#reason:shutdown",
            ]
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped(DropReason::QueueFull), 3);
        assert_eq!(snapshot.dropped(DropReason::OutOfLease), 0);
        assert_eq!(snapshot.dropped_total(), 4);
    }

    #[test]
    fn test_in_flight_gauge() {
        let stats = ExporterStats::default();

        let captures = tally_statsd::with_capturing_test_client(|| {
            stats.send_started();
            stats.send_started();
            stats.send_finished();
        });

        assert_eq!(
            captures,
            [
                "export.send.in_flight:1|g",
                "export.send.in_flight:2|g",
                "export.send.in_flight:1|g",
            ]
        );
        assert_eq!(stats.snapshot().in_flight, 1);
    }
}
