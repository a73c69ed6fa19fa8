use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::client::{RemoteClient, SendError};
use crate::series::{Tenant, TimeSeries};
use crate::shard::Shard;
use crate::stats::{DropReason, ExporterStats};
use crate::statsd::{ExporterHistograms, ExporterTimers};

/// Series collected from one or more shards, grouped by tenant.
///
/// A batch is full as soon as a single tenant holds `max_size` series. It is consumed by
/// [`send`](Self::send), which releases all contributing shards once every write has completed.
#[derive(Debug)]
pub struct Batch {
    tenants: HashMap<Tenant, Vec<TimeSeries>>,
    total: usize,
    one_full: bool,
    max_size: usize,
    shards: Vec<usize>,
}

impl Batch {
    /// Creates an empty batch sending at most `max_size` series per tenant and request.
    pub fn new(max_size: usize) -> Self {
        Self {
            tenants: HashMap::new(),
            total: 0,
            one_full: false,
            max_size,
            shards: Vec::new(),
        }
    }

    /// Adds a series to its tenant's bucket.
    pub fn add(&mut self, series: TimeSeries) {
        let bucket = self.tenants.entry(series.tenant.clone()).or_default();
        bucket.push(series);
        self.total += 1;

        if bucket.len() >= self.max_size {
            self.one_full = true;
        }
    }

    /// Records that the shard at `index` contributed to this batch.
    pub fn add_shard(&mut self, index: usize) {
        self.shards.push(index);
    }

    /// Returns `true` if at least one tenant reached the maximum batch size.
    pub fn is_full(&self) -> bool {
        self.one_full
    }

    /// Returns `true` if the batch holds no series.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Returns the number of series across all tenants.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Returns the indices of the contributing shards.
    pub fn shards(&self) -> &[usize] {
        &self.shards
    }

    /// Splits the batch into its tenant buckets and contributing shards.
    pub fn into_parts(self) -> (HashMap<Tenant, Vec<TimeSeries>>, Vec<usize>) {
        (self.tenants, self.shards)
    }

    /// Writes all tenant buckets concurrently and releases the contributing shards.
    ///
    /// Every tenant is written in a separate task bounded by `timeout`. Failed writes are logged
    /// and counted, but not retried. Shards are released only after all writes have completed,
    /// regardless of their outcome.
    pub async fn send(
        self,
        shards: &[Shard],
        client: Arc<dyn RemoteClient>,
        timeout: Duration,
        stats: &ExporterStats,
    ) {
        let (tenants, contributors) = self.into_parts();

        let mut tasks = JoinSet::new();
        let mut running = HashMap::with_capacity(tenants.len());

        for (tenant, series) in tenants {
            let client = Arc::clone(&client);
            let count = series.len();
            let key = tenant.clone();
            stats.send_started();

            let handle = tasks.spawn(async move {
                let start = Instant::now();
                let send = client.send(&tenant, series);
                let result = match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout(timeout)),
                };
                (start.elapsed(), result)
            });

            running.insert(handle.id(), (key, count));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            stats.send_finished();

            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, Ok(outcome)),
                Err(error) => (error.id(), Err(error)),
            };

            let Some((tenant, count)) = running.remove(&id) else {
                continue;
            };

            let (elapsed, result) = match outcome {
                Ok(outcome) => outcome,
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn Error,
                        tenant = %tenant,
                        batch_size = count,
                        "send task failed"
                    );
                    stats.record_send_error(tenant.as_str());
                    stats.record_dropped(DropReason::SendFailed, count);
                    continue;
                }
            };

            tally_statsd::metric!(histogram(ExporterHistograms::TenantBatchSize) = count as u64);

            match result {
                Ok(()) => {
                    tally_statsd::metric!(
                        timer(ExporterTimers::SendDuration) = elapsed,
                        status = "ok",
                    );
                    stats.record_sent(count);
                }
                Err(error) => {
                    tally_statsd::metric!(
                        timer(ExporterTimers::SendDuration) = elapsed,
                        status = error.kind(),
                    );
                    tally_log::error!(
                        error = &error as &dyn Error,
                        tenant = %tenant,
                        batch_size = count,
                        "failed to send batch"
                    );
                    stats.record_send_error(tenant.as_str());
                    stats.record_dropped(DropReason::SendFailed, count);
                }
            }
        }

        for index in contributors {
            shards[index].notify_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{RecordingClient, hashed};

    fn series(tenant: &str, hash: u64) -> TimeSeries {
        hashed(tenant, hash).series
    }

    #[test]
    fn test_full_per_tenant() {
        let mut batch = Batch::new(2);
        batch.add(series("a", 1));
        batch.add(series("b", 2));
        assert!(!batch.is_full());
        assert_eq!(batch.len(), 2);

        batch.add(series("a", 3));
        assert!(batch.is_full());
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_empty() {
        let batch = Batch::new(1);
        assert!(batch.is_empty());
        assert!(!batch.is_full());
        assert_eq!(batch.len(), 0);
    }

    #[tokio::test]
    async fn test_send_groups_by_tenant_and_releases_shards() {
        tally_test::setup();

        let shards = [Shard::new(4), Shard::new(4)];
        for (index, shard) in shards.iter().enumerate() {
            shard.enqueue(hashed("a", index as u64)).unwrap();
            shard.enqueue(hashed("b", 10 + index as u64)).unwrap();
        }

        let mut batch = Batch::new(10);
        shards[0].fill(0, &mut batch);
        shards[1].fill(1, &mut batch);
        assert_eq!(batch.len(), 4);

        let client = Arc::new(RecordingClient::new());
        let stats = ExporterStats::default();
        batch
            .send(&shards, client.clone(), Duration::from_secs(1), &stats)
            .await;

        let mut sends = client.sends();
        sends.sort();
        assert_eq!(
            sends,
            [
                (Tenant::from("a"), vec![0, 1]),
                (Tenant::from("b"), vec![10, 11]),
            ]
        );
        assert!(!shards[0].state().pending);
        assert!(!shards[1].state().pending);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 4);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test]
    async fn test_send_failure_releases_shards() {
        tally_test::setup();

        let shards = [Shard::new(4)];
        shards[0].enqueue(hashed("a", 1)).unwrap();
        shards[0].enqueue(hashed("a", 2)).unwrap();

        let mut batch = Batch::new(10);
        shards[0].fill(0, &mut batch);

        let client = Arc::new(RecordingClient::new());
        client.fail_sends(true);
        let stats = ExporterStats::default();
        batch
            .send(&shards, client.clone(), Duration::from_secs(1), &stats)
            .await;

        assert!(!shards[0].state().pending);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.dropped(DropReason::SendFailed), 2);
    }

    /// Panics on writes for tenant `b` and accepts everything else.
    struct PanicOnTenant;

    #[async_trait::async_trait]
    impl RemoteClient for PanicOnTenant {
        async fn send(&self, tenant: &Tenant, _series: Vec<TimeSeries>) -> Result<(), SendError> {
            assert_ne!(tenant.as_str(), "b", "backend client crashed");
            Ok(())
        }

        async fn close(&self) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_crashed_send_task_is_counted() {
        tally_test::setup();

        let shards = [Shard::new(4), Shard::new(4)];
        shards[0].enqueue(hashed("a", 1)).unwrap();
        shards[1].enqueue(hashed("b", 2)).unwrap();
        shards[1].enqueue(hashed("b", 3)).unwrap();

        let mut batch = Batch::new(10);
        shards[0].fill(0, &mut batch);
        shards[1].fill(1, &mut batch);

        let stats = ExporterStats::default();
        batch
            .send(&shards, Arc::new(PanicOnTenant), Duration::from_secs(1), &stats)
            .await;

        assert!(!shards[0].state().pending);
        assert!(!shards[1].state().pending);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.dropped(DropReason::SendFailed), 2);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        tally_test::setup();

        let shards = [Shard::new(4)];
        shards[0].enqueue(hashed("a", 1)).unwrap();

        let mut batch = Batch::new(10);
        shards[0].fill(0, &mut batch);

        let client = Arc::new(RecordingClient::new());
        client.set_delay(Duration::from_secs(60));
        let stats = ExporterStats::default();
        batch
            .send(&shards, client.clone(), Duration::from_secs(30), &stats)
            .await;

        assert!(!shards[0].state().pending);
        assert!(client.sends().is_empty());
        assert_eq!(stats.snapshot().dropped(DropReason::SendFailed), 1);
    }

    #[test]
    fn test_send_metrics() {
        let captures = tally_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let shards = [Shard::new(4)];
                shards[0].enqueue(hashed("a", 1)).unwrap();

                let mut batch = Batch::new(10);
                shards[0].fill(0, &mut batch);

                let client = Arc::new(RecordingClient::new());
                client.fail_sends(true);
                batch
                    .send(&shards, client, Duration::from_secs(1), &ExporterStats::default())
                    .await;
            });
        });

        let captures: Vec<_> = captures
            .into_iter()
            .filter(|metric| !metric.starts_with("export.send.duration"))
            .collect();

        insta::assert_debug_snapshot!(captures, @r#"
        [
            "export.shard.fill_size:1|h",
            "export.send.in_flight:1|g",
            "export.send.in_flight:0|g",
            "export.batch.tenant_size:1|h",
            "export.send.errors:1|c|#hc.tenant:a",
            "export.samples.dropped:1|c|#reason:send_failed",
        ]
        "#);
    }
}
