use std::borrow::Cow;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;
use crate::client::{ClientError, ClientFactory, ClientOptions, RemoteClient};
use crate::config::{ExporterConfig, InvalidSetting, ReloadConfig};
use crate::labels::{ExternalLabels, LabelsError};
use crate::lease::{Lease, LeaseRange};
use crate::series::{Exemplars, MetadataSource, Sample, SampleBuilder};
use crate::shard::{Shard, ShardState};
use crate::stats::{DropReason, ExporterStats, StatsSnapshot};
use crate::statsd::{ExporterCounters, ExporterGauges};

/// Errors creating or reconfiguring an [`Exporter`].
///
/// A failed reload leaves the previous configuration in effect.
#[derive(Debug, thiserror::Error)]
pub enum ApplyConfigError {
    /// A static setting is out of range.
    #[error("invalid exporter configuration")]
    Setting(#[from] InvalidSetting),
    /// The external labels lack required identity labels.
    #[error("invalid external labels")]
    Labels(#[from] LabelsError),
    /// The remote client could not be created.
    #[error("failed to create remote client")]
    Client(#[from] ClientError),
}

/// External collaborators of the [`Exporter`].
pub struct ExporterDeps {
    /// Converts raw samples into hashed series.
    pub builder: Arc<dyn SampleBuilder>,
    /// Gates exports on leadership.
    pub lease: Arc<dyn Lease>,
    /// Creates remote clients on startup and reload.
    pub client_factory: Arc<dyn ClientFactory>,
}

/// Configuration that is replaced on reload.
struct State {
    external_labels: Arc<ExternalLabels>,
    client_options: ClientOptions,
    client: Arc<dyn RemoteClient>,
}

/// State shared between the dispatcher, sender tasks and all handles.
struct Shared {
    config: ExporterConfig,
    shards: Box<[Shard]>,
    /// Single-permit wake-up of the dispatcher. Notifications coalesce.
    wake: Notify,
    state: RwLock<State>,
    /// Serializes reloads, so the state lock is never held while a client is created.
    reload_lock: Mutex<()>,
    disabled: AtomicBool,
    /// Set once shutdown starts. Exports hold the read lock while enqueueing.
    closed: RwLock<bool>,
    builder: Arc<dyn SampleBuilder>,
    lease: Arc<dyn Lease>,
    client_factory: Arc<dyn ClientFactory>,
    stats: ExporterStats,
}

impl Shared {
    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn export(&self, metadata: &dyn MetadataSource, samples: &[Sample], exemplars: &Exemplars) {
        if self.disabled.load(Ordering::Relaxed) {
            self.stats.record_disabled_call();
            return;
        }

        if samples.is_empty() {
            return;
        }

        let closed = self.closed.read();
        if *closed {
            self.stats.record_dropped(DropReason::Shutdown, samples.len());
            return;
        }

        let Some(range) = self.lease.range() else {
            self.stats.record_dropped(DropReason::OutOfLease, samples.len());
            return;
        };

        let leased = in_range(samples, range);
        self.stats
            .record_dropped(DropReason::OutOfLease, samples.len() - leased.len());

        let external_labels = Arc::clone(&self.state.read().external_labels);

        let mut remaining: &[Sample] = &leased;
        let mut exported = 0;
        let mut overflow = 0;

        while !remaining.is_empty() {
            let converted = self
                .builder
                .convert(metadata, &external_labels, remaining, exemplars);

            let (entries, rest) = match converted {
                Ok(converted) => converted,
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn Error,
                        samples = remaining.len(),
                        "failed to convert samples"
                    );
                    self.stats
                        .record_dropped(DropReason::ConversionFailed, remaining.len());
                    break;
                }
            };

            for entry in entries {
                match self.shard_for(entry.hash).enqueue(entry) {
                    Ok(()) => exported += 1,
                    Err(_) => overflow += 1,
                }
            }

            if rest.len() >= remaining.len() {
                tally_log::error!(samples = rest.len(), "sample conversion made no progress");
                self.stats
                    .record_dropped(DropReason::ConversionFailed, rest.len());
                break;
            }

            remaining = rest;
        }

        drop(closed);

        self.stats.record_dropped(DropReason::QueueFull, overflow);
        self.stats.record_exported(exported);
        self.wake.notify_one();
    }

    fn apply_config(&self, reload: &ReloadConfig) -> Result<(), ApplyConfigError> {
        let _reload = self.reload_lock.lock();

        let labels = reload
            .external_labels
            .clone()
            .with_defaults(&self.config.label_defaults);

        let (labels_changed, client_changed) = {
            let state = self.state.read();
            (
                *state.external_labels != labels,
                state.client_options != reload.client,
            )
        };

        if labels_changed {
            labels.validate()?;
        }

        let client = if client_changed {
            Some(self.client_factory.create(&reload.client)?)
        } else {
            None
        };

        {
            let mut state = self.state.write();
            if labels_changed {
                state.external_labels = Arc::new(labels);
            }
            if let Some(client) = client {
                state.client = client;
                state.client_options = reload.client.clone();
            }
        }

        if labels_changed {
            // Cached series carry the previous external labels.
            self.builder.force_refresh();
        }

        if labels_changed || client_changed {
            tally_log::info!(labels_changed, client_changed, "applied exporter configuration");
        }

        Ok(())
    }

    fn shard_totals(&self) -> (usize, usize) {
        self.shards
            .iter()
            .map(Shard::state)
            .fold((0, 0), |(queued, pending), state: ShardState| {
                (queued + state.queued, pending + usize::from(state.pending))
            })
    }

    /// Rejects all further exports. Waits for exports that are enqueueing.
    fn stop_intake(&self) {
        *self.closed.write() = true;
    }

    async fn close(&self) {
        let client = Arc::clone(&self.state.read().client);
        if let Err(error) = client.close().await {
            tally_log::error!(error = &error as &dyn Error, "failed to close remote client");
        }
    }
}

/// Returns the samples within the leased range, borrowing if all of them are.
fn in_range(samples: &[Sample], range: LeaseRange) -> Cow<'_, [Sample]> {
    if samples.iter().all(|s| range.contains(s.timestamp)) {
        return Cow::Borrowed(samples);
    }

    let filtered = samples
        .iter()
        .filter(|s| range.contains(s.timestamp))
        .copied()
        .collect();

    Cow::Owned(filtered)
}

/// Batches samples from many producers and writes them to the remote backend.
///
/// The exporter partitions series into a fixed number of shards. Producers enqueue through an
/// [`ExporterHandle`] without blocking. A single dispatcher, started with [`run`](Self::run),
/// collects entries from the shards into batches and sends each batch in the background.
///
/// A shard contributes to at most one in-flight batch and never hands out the same series twice
/// per batch, so writes for a single series are never concurrent.
pub struct Exporter {
    shared: Arc<Shared>,
}

impl Exporter {
    /// Creates an exporter with the initial runtime configuration.
    ///
    /// Registers a leadership callback on the lease that clears the builder's series cache.
    pub fn new(
        config: ExporterConfig,
        initial: ReloadConfig,
        deps: ExporterDeps,
    ) -> Result<Self, ApplyConfigError> {
        config.validate()?;

        let external_labels = initial
            .external_labels
            .with_defaults(&config.label_defaults);
        external_labels.validate()?;

        let client = deps.client_factory.create(&initial.client)?;

        let builder = Arc::clone(&deps.builder);
        deps.lease
            .on_leader_change(Box::new(move || builder.clear()));

        let shards = (0..config.shard_count)
            .map(|_| Shard::new(config.shard_buffer_size))
            .collect();

        tally_log::debug!(
            shards = config.shard_count,
            buffer_size = config.shard_buffer_size,
            disabled = config.disabled,
            "created exporter"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                disabled: AtomicBool::new(config.disabled),
                closed: RwLock::new(false),
                shards,
                wake: Notify::new(),
                state: RwLock::new(State {
                    external_labels: Arc::new(external_labels),
                    client_options: initial.client,
                    client,
                }),
                reload_lock: Mutex::new(()),
                builder: deps.builder,
                lease: deps.lease,
                client_factory: deps.client_factory,
                stats: ExporterStats::default(),
                config,
            }),
        })
    }

    /// Returns a handle for exporting samples and reconfiguring the exporter.
    pub fn handle(&self) -> ExporterHandle {
        ExporterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the dispatcher until `shutdown` is cancelled.
    ///
    /// On shutdown, further exports are dropped. Buffered samples are sent until all shards are
    /// empty or the drain timeout elapses. Afterwards the remote client is closed.
    pub async fn run(self, shutdown: CancellationToken) {
        let shared = self.shared;
        let mut dispatcher = Dispatcher::new(Arc::clone(&shared));

        tally_log::info!(shards = shared.shards.len(), "exporter started");

        let timer = tokio::time::sleep(shared.config.batch_delay());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = shared.wake.notified() => dispatcher.fill_round(timer.as_mut()),
                _ = &mut timer => dispatcher.flush(timer.as_mut()),
            }
        }

        tally_log::info!("exporter shutting down");
        shared.stop_intake();
        dispatcher.drain().await;
        shared.close().await;
        tally_log::info!("exporter stopped");
    }
}

/// Collects entries from shards into the current batch and dispatches full batches.
///
/// Only the dispatcher touches the current batch.
struct Dispatcher {
    shared: Arc<Shared>,
    batch: Batch,
    offset: usize,
}

impl Dispatcher {
    fn new(shared: Arc<Shared>) -> Self {
        let batch = Batch::new(shared.config.max_batch_size);
        Self {
            shared,
            batch,
            offset: 0,
        }
    }

    /// Fills the current batch starting at the rotating offset.
    ///
    /// A full batch is sent immediately and ends the round. Shards that were not visited get
    /// another wake-up.
    fn fill_round(&mut self, timer: Pin<&mut Sleep>) {
        tally_statsd::metric!(counter(ExporterCounters::SendIterations) += 1);

        let count = self.shared.shards.len();
        let mut visited = 0;
        let mut sent = false;

        while visited < count {
            let index = (self.offset + visited) % count;
            self.shared.shards[index].fill(index, &mut self.batch);
            visited += 1;

            if self.batch.is_full() {
                self.send_batch();
                sent = true;
                break;
            }
        }

        self.offset = (self.offset + visited) % count;

        if visited < count {
            self.shared.wake.notify_one();
        }

        if sent {
            self.reset_timer(timer);
        }
    }

    /// Sends the current batch if it holds anything.
    fn flush(&mut self, timer: Pin<&mut Sleep>) {
        if !self.batch.is_empty() {
            self.send_batch();
        }

        let (queued, pending) = self.shared.shard_totals();
        tally_statsd::metric!(gauge(ExporterGauges::ShardsQueued) = queued as u64);
        tally_statsd::metric!(gauge(ExporterGauges::ShardsPending) = pending as u64);

        self.reset_timer(timer);
    }

    fn reset_timer(&self, timer: Pin<&mut Sleep>) {
        timer.reset(Instant::now() + self.shared.config.batch_delay());
    }

    /// Hands the current batch to a background task and starts a new one.
    fn send_batch(&mut self) {
        let batch = std::mem::replace(
            &mut self.batch,
            Batch::new(self.shared.config.max_batch_size),
        );

        let shared = Arc::clone(&self.shared);
        let client = Arc::clone(&shared.state.read().client);

        tokio::spawn(async move {
            let timeout = shared.config.send_timeout();
            batch
                .send(&shared.shards, client, timeout, &shared.stats)
                .await;
            // Released shards may hold more entries.
            shared.wake.notify_one();
        });
    }

    /// Sends all buffered entries until the shards are empty or the drain timeout elapses.
    async fn drain(&mut self) {
        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + shared.config.drain_timeout();

        loop {
            for (index, shard) in shared.shards.iter().enumerate() {
                shard.fill(index, &mut self.batch);
                if self.batch.is_full() {
                    self.send_batch();
                }
            }

            if !self.batch.is_empty() {
                self.send_batch();
            }

            let (queued, pending) = shared.shard_totals();
            if queued == 0 && pending == 0 {
                // Let the last sender task finish its bookkeeping.
                tokio::time::sleep(shared.config.drain_grace()).await;
                tally_log::info!("exporter drained");
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                let dropped: usize = shared.shards.iter().map(Shard::discard).sum();
                shared.stats.record_dropped(DropReason::Shutdown, dropped);
                tally_log::warn!(
                    dropped,
                    pending,
                    "drain timeout elapsed, dropping buffered samples"
                );
                return;
            }

            let wait_until = deadline.min(now + shared.config.drain_poll());
            let _ = tokio::time::timeout_at(wait_until, shared.wake.notified()).await;
        }
    }
}

/// A cloneable handle to a running or not yet started [`Exporter`].
#[derive(Clone)]
pub struct ExporterHandle {
    shared: Arc<Shared>,
}

impl ExporterHandle {
    /// Queues samples for export.
    ///
    /// Never blocks on I/O and never fails. Samples outside the current lease, samples that fail
    /// conversion and samples that do not fit into their shard are dropped and counted.
    pub fn export(
        &self,
        metadata: &dyn MetadataSource,
        samples: &[Sample],
        exemplars: &Exemplars,
    ) {
        self.shared.export(metadata, samples, exemplars);
    }

    /// Applies reloaded external labels and client options.
    ///
    /// Creates a new remote client only if the client options changed. In-flight sends keep
    /// using the client they started with. On error, the previous configuration stays active.
    pub fn apply_config(&self, reload: &ReloadConfig) -> Result<(), ApplyConfigError> {
        let result = self.shared.apply_config(reload);

        match result {
            Ok(()) => {
                tally_statsd::metric!(counter(ExporterCounters::ConfigReloads) += 1, result = "ok");
            }
            Err(ref error) => {
                tally_statsd::metric!(
                    counter(ExporterCounters::ConfigReloads) += 1,
                    result = "error",
                );
                tally_log::error!(
                    error = error as &dyn Error,
                    "failed to apply exporter configuration"
                );
            }
        }

        result
    }

    /// Enables or disables exporting.
    pub fn set_disabled(&self, disabled: bool) {
        let previous = self.shared.disabled.swap(disabled, Ordering::Relaxed);
        if previous != disabled {
            tally_log::info!(disabled, "exporter toggled");
        }
    }

    /// Returns `true` if exporting is disabled.
    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Relaxed)
    }

    /// Returns the external labels currently applied to series.
    pub fn external_labels(&self) -> Arc<ExternalLabels> {
        Arc::clone(&self.shared.state.read().external_labels)
    }

    /// Returns the number of entries buffered across all shards.
    pub fn buffered(&self) -> usize {
        self.shared.shard_totals().0
    }

    /// Returns a snapshot of the exporter's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl std::fmt::Debug for ExporterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterHandle")
            .field("shards", &self.shared.shards.len())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;

    use super::*;
    use crate::labels::{CLUSTER, LOCATION, PROJECT_ID};
    use crate::lease::{AlwaysLease, ManualLease};
    use crate::series::Tenant;
    use crate::testutils::{RecordingClient, TestBuilder, TestClientFactory, no_metadata, sample};

    struct Harness {
        exporter: Exporter,
        handle: ExporterHandle,
        builder: Arc<TestBuilder>,
        factory: Arc<TestClientFactory>,
        client: Arc<RecordingClient>,
    }

    fn labels(project: &str) -> ExternalLabels {
        [(PROJECT_ID, project), (LOCATION, "europe-west1")]
            .into_iter()
            .collect()
    }

    fn reload(project: &str) -> ReloadConfig {
        ReloadConfig {
            external_labels: labels(project),
            client: ClientOptions::default(),
        }
    }

    fn config(shard_count: usize, shard_buffer_size: usize) -> ExporterConfig {
        ExporterConfig {
            shard_count,
            shard_buffer_size,
            max_batch_size: 4,
            ..Default::default()
        }
    }

    fn harness(config: ExporterConfig, lease: Arc<dyn Lease>) -> Harness {
        let builder = Arc::new(TestBuilder::new(3));
        let factory = Arc::new(TestClientFactory::new());
        let client = factory.client();

        let exporter = Exporter::new(
            config,
            reload("project-a"),
            ExporterDeps {
                builder: builder.clone(),
                lease,
                client_factory: factory.clone(),
            },
        )
        .unwrap();

        Harness {
            handle: exporter.handle(),
            exporter,
            builder,
            factory,
            client,
        }
    }

    fn range(start_ms: i64, end_ms: i64) -> LeaseRange {
        LeaseRange::new(
            DateTime::from_timestamp_millis(start_ms).unwrap(),
            DateTime::from_timestamp_millis(end_ms).unwrap(),
        )
    }

    #[test]
    fn test_new_rejects_invalid_setup() {
        let deps = || ExporterDeps {
            builder: Arc::new(TestBuilder::new(1)),
            lease: Arc::new(AlwaysLease),
            client_factory: Arc::new(TestClientFactory::new()),
        };

        let result = Exporter::new(config(0, 4), reload("p"), deps());
        assert!(matches!(
            result,
            Err(ApplyConfigError::Setting(InvalidSetting("shard_count")))
        ));

        let result = Exporter::new(config(2, 4), ReloadConfig::default(), deps());
        assert!(matches!(
            result,
            Err(ApplyConfigError::Labels(LabelsError::MissingProjectId))
        ));

        let mut invalid = reload("p");
        invalid.client.endpoint = Some("invalid://".to_owned());
        let result = Exporter::new(config(2, 4), invalid, deps());
        assert!(matches!(
            result,
            Err(ApplyConfigError::Client(ClientError::InvalidEndpoint(_)))
        ));
    }

    #[test]
    fn test_new_applies_label_defaults() {
        let mut config = config(2, 4);
        config.label_defaults.location = "us-east1".to_owned();
        config.label_defaults.cluster = "prod".to_owned();

        let initial = ReloadConfig {
            external_labels: [(PROJECT_ID, "p")].into_iter().collect(),
            client: ClientOptions::default(),
        };

        let exporter = Exporter::new(
            config,
            initial,
            ExporterDeps {
                builder: Arc::new(TestBuilder::new(1)),
                lease: Arc::new(AlwaysLease),
                client_factory: Arc::new(TestClientFactory::new()),
            },
        )
        .unwrap();

        let labels = exporter.handle().external_labels();
        assert_eq!(labels.location(), Some("us-east1"));
        assert_eq!(labels.get(CLUSTER), Some("prod"));
    }

    #[test]
    fn test_export_routes_by_hash() {
        let h = harness(config(4, 8), Arc::new(AlwaysLease));

        let samples: Vec<_> = (0..10).map(|i| sample(i, 1_000)).collect();
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        let queued: Vec<_> = h
            .exporter
            .shared
            .shards
            .iter()
            .map(|shard| shard.state().queued)
            .collect();
        assert_eq!(queued, [3, 3, 2, 2]);
        assert_eq!(h.handle.buffered(), 10);
        assert_eq!(h.handle.stats().exported, 10);
    }

    #[test]
    fn test_export_while_disabled() {
        let h = harness(config(2, 8), Arc::new(AlwaysLease));
        h.handle.set_disabled(true);
        assert!(h.handle.is_disabled());

        h.handle.export(&no_metadata, &[sample(1, 0)], &Exemplars::new());
        h.handle.export(&no_metadata, &[], &Exemplars::new());

        let stats = h.handle.stats();
        assert_eq!(stats.disabled_calls, 2);
        assert_eq!(stats.exported, 0);
        assert_eq!(h.handle.buffered(), 0);
    }

    #[test]
    fn test_export_drops_outside_lease() {
        let lease = Arc::new(ManualLease::new(Some(range(1_000, 2_000))));
        let h = harness(config(2, 8), lease.clone());

        let samples = [sample(1, 500), sample(2, 1_000), sample(3, 2_000), sample(4, 2_001)];
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        let stats = h.handle.stats();
        assert_eq!(stats.exported, 2);
        assert_eq!(stats.dropped(DropReason::OutOfLease), 2);

        lease.set_range(None);
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        let stats = h.handle.stats();
        assert_eq!(stats.exported, 2);
        assert_eq!(stats.dropped(DropReason::OutOfLease), 6);
    }

    #[test]
    fn test_leader_change_clears_builder() {
        let lease = Arc::new(ManualLease::new(Some(LeaseRange::unbounded())));
        let h = harness(config(2, 8), lease.clone());

        lease.set_range(None);
        lease.set_range(Some(LeaseRange::unbounded()));
        assert_eq!(h.builder.clears(), 2);
    }

    #[test]
    fn test_export_counts_queue_overflow() {
        let h = harness(config(1, 2), Arc::new(AlwaysLease));

        let samples: Vec<_> = (0..5).map(|i| sample(i, 0)).collect();
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        let stats = h.handle.stats();
        assert_eq!(stats.exported, 2);
        assert_eq!(stats.dropped(DropReason::QueueFull), 3);
        assert_eq!(h.handle.buffered(), 2);
    }

    #[test]
    fn test_export_drops_remainder_on_conversion_error() {
        tally_test::setup();

        let h = harness(config(2, 16), Arc::new(AlwaysLease));
        h.builder.fail_on(Some(4));

        // The builder converts three samples per call, so the first chunk is enqueued.
        let samples: Vec<_> = (0..6).map(|i| sample(i, 0)).collect();
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        let stats = h.handle.stats();
        assert_eq!(stats.exported, 3);
        assert_eq!(stats.dropped(DropReason::ConversionFailed), 3);
    }

    #[test]
    fn test_export_metrics() {
        let h = harness(config(1, 1), Arc::new(AlwaysLease));

        let captures = tally_statsd::with_capturing_test_client(|| {
            h.handle
                .export(&no_metadata, &[sample(1, 0), sample(2, 0)], &Exemplars::new());
        });

        assert_eq!(
            captures,
            [
                "export.samples.dropped:1|c|#reason:queue_full",
                "export.samples.exported:1|c",
            ]
        );
    }

    #[test]
    fn test_apply_config_refreshes_on_label_change() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));

        h.handle.apply_config(&reload("project-a")).unwrap();
        assert_eq!(h.builder.refreshes(), 0);
        assert_eq!(h.factory.created(), 1);

        h.handle.apply_config(&reload("project-b")).unwrap();
        assert_eq!(h.builder.refreshes(), 1);
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.handle.external_labels().project_id(), Some("project-b"));
    }

    #[test]
    fn test_apply_config_rejects_invalid_labels() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));

        let mut global = reload("project-b");
        global.external_labels.insert(LOCATION, "global");

        let result = h.handle.apply_config(&global);
        assert!(matches!(
            result,
            Err(ApplyConfigError::Labels(LabelsError::GlobalLocation))
        ));
        assert_eq!(h.handle.external_labels().project_id(), Some("project-a"));
        assert_eq!(h.builder.refreshes(), 0);
    }

    #[test]
    fn test_apply_config_replaces_client() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));

        let mut changed = reload("project-a");
        changed.client.user_agent = Some("collector/1.0".to_owned());
        h.handle.apply_config(&changed).unwrap();
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.builder.refreshes(), 0);

        // A failing client keeps the previous options, so reapplying them is a no-op.
        let mut invalid = changed.clone();
        invalid.client.endpoint = Some("invalid://".to_owned());
        assert!(h.handle.apply_config(&invalid).is_err());
        h.handle.apply_config(&changed).unwrap();
        assert_eq!(h.factory.created(), 2);
    }

    #[test]
    fn test_apply_config_metrics() {
        let h = harness(config(2, 8), Arc::new(AlwaysLease));

        let captures = tally_statsd::with_capturing_test_client(|| {
            h.handle.apply_config(&reload("project-a")).ok();
            h.handle.apply_config(&ReloadConfig::default()).ok();
        });

        assert_eq!(
            captures,
            [
                "export.config.reloads:1|c|#result:ok",
                "export.config.reloads:1|c|#result:error",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_after_batch_delay() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.exporter.run(shutdown.clone()));

        h.handle.export(&no_metadata, &[sample(1, 0)], &Exemplars::new());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.client.sends().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.hashes(), [1]);
        assert_eq!(h.handle.stats().sent, 1);

        shutdown.cancel();
        task.await.unwrap();
        assert!(h.client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sends_full_batch_immediately() {
        tally_test::setup();

        let h = harness(config(8, 8), Arc::new(AlwaysLease));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.exporter.run(shutdown.clone()));

        let samples: Vec<_> = (0..4).map(|i| sample(i, 0)).collect();
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        tokio::time::sleep(Duration::from_millis(1)).await;
        let mut hashes = h.client.hashes();
        hashes.sort();
        assert_eq!(hashes, [0, 1, 2, 3]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rotates_through_shards_after_full_batch() {
        tally_test::setup();

        let config = ExporterConfig {
            max_batch_size: 2,
            batch_delay_ms: 60_000,
            ..config(4, 8)
        };
        let h = harness(config, Arc::new(AlwaysLease));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.exporter.run(shutdown.clone()));

        // Two series per shard: every shard fills a batch on its own.
        let samples: Vec<_> = (0..8).map(|i| sample(i, 0)).collect();
        h.handle.export(&no_metadata, &samples, &Exemplars::new());

        // Far below the batch delay, so only wake-ups drive the dispatcher.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut sends = h.client.sends();
        sends.sort();
        let tenant = Tenant::from("project-a");
        assert_eq!(
            sends,
            [
                (tenant.clone(), vec![0, 4]),
                (tenant.clone(), vec![1, 5]),
                (tenant.clone(), vec![2, 6]),
                (tenant, vec![3, 7]),
            ]
        );
        assert_eq!(h.handle.buffered(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_during_drain_is_dropped() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.exporter.run(shutdown.clone()));

        shutdown.cancel();
        // The drain is now waiting for its grace period.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        h.handle.export(&no_metadata, &[sample(1, 0)], &Exemplars::new());
        task.await.unwrap();

        let stats = h.handle.stats();
        assert_eq!(stats.exported, 0);
        assert_eq!(stats.dropped(DropReason::Shutdown), 1);
        assert_eq!(h.handle.buffered(), 0);
        assert!(h.client.sends().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_after_shutdown_is_dropped() {
        tally_test::setup();

        let h = harness(config(2, 8), Arc::new(AlwaysLease));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        h.exporter.run(shutdown).await;

        h.handle.export(&no_metadata, &[sample(1, 0)], &Exemplars::new());
        assert_eq!(h.handle.stats().dropped(DropReason::Shutdown), 1);
        assert_eq!(h.handle.buffered(), 0);
    }
}
