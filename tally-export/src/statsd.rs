use tally_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for the exporter.
pub enum ExporterCounters {
    /// Number of samples accepted into a shard queue.
    SamplesExported,

    /// Number of samples dropped before reaching the backend.
    ///
    /// This metric is tagged with:
    ///  - `reason`: One of `queue_full`, `out_of_lease`, `conversion_failed`, `send_failed` or
    ///    `shutdown`.
    SamplesDropped,

    /// Number of samples successfully written to the backend.
    SamplesSent,

    /// Number of failed remote writes.
    ///
    /// This metric is tagged with:
    ///  - `hc.tenant`: The tenant the write was addressed to.
    SendErrors,

    /// Incremented for every export call while exporting is disabled.
    CalledWhileDisabled,

    /// Number of times the dispatcher swept the shards after a wake-up.
    SendIterations,

    /// Number of configuration reloads.
    ///
    /// This metric is tagged with:
    ///  - `result`: `ok` or `error`.
    ConfigReloads,
}

impl CounterMetric for ExporterCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SamplesExported => "export.samples.exported",
            Self::SamplesDropped => "export.samples.dropped",
            Self::SamplesSent => "export.samples.sent",
            Self::SendErrors => "export.send.errors",
            Self::CalledWhileDisabled => "export.called_while_disabled",
            Self::SendIterations => "export.send.iterations",
            Self::ConfigReloads => "export.config.reloads",
        }
    }
}

/// Histogram metrics for the exporter.
pub enum ExporterHistograms {
    /// Number of samples a shard contributed to a batch in a single fill.
    ShardFillSize,

    /// Number of samples sent in one remote write for a single tenant.
    TenantBatchSize,
}

impl HistogramMetric for ExporterHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::ShardFillSize => "export.shard.fill_size",
            Self::TenantBatchSize => "export.batch.tenant_size",
        }
    }
}

/// Timer metrics for the exporter.
pub enum ExporterTimers {
    /// Duration of a single remote write including the timeout.
    ///
    /// This metric is tagged with:
    ///  - `status`: `ok`, or the kind of the send error.
    SendDuration,
}

impl TimerMetric for ExporterTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::SendDuration => "export.send.duration",
        }
    }
}

/// Gauge metrics for the exporter.
pub enum ExporterGauges {
    /// Number of remote writes currently in flight.
    SendsInFlight,

    /// Number of shards waiting for an in-flight batch to complete.
    ShardsPending,

    /// Number of samples queued across all shards.
    ShardsQueued,
}

impl GaugeMetric for ExporterGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::SendsInFlight => "export.send.in_flight",
            Self::ShardsPending => "export.shards.pending",
            Self::ShardsQueued => "export.shards.queued",
        }
    }
}
