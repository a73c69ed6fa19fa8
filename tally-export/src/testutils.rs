//! In-memory collaborators for exercising the exporter without a backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::client::{ClientError, ClientFactory, ClientOptions, RemoteClient, SendError};
use crate::labels::ExternalLabels;
use crate::series::{
    ConvertError, Exemplars, HashedSeries, MetadataSource, Sample, SampleBuilder, Tenant,
    TimeSeries,
};

/// Encodes a series hash and sample timestamp into a payload body.
pub fn encode_body(hash: u64, timestamp: i64) -> Bytes {
    let mut body = BytesMut::with_capacity(16);
    body.put_u64(hash);
    body.put_i64(timestamp);
    body.freeze()
}

/// Reads the series hash back from a body produced by [`encode_body`].
pub fn decode_hash(body: &Bytes) -> u64 {
    let mut body = body.clone();
    if body.remaining() < 8 {
        return 0;
    }
    body.get_u64()
}

/// Creates an entry for `tenant` whose hash is `hash`.
pub fn hashed(tenant: &str, hash: u64) -> HashedSeries {
    HashedSeries {
        hash,
        series: TimeSeries {
            tenant: Tenant::from(tenant),
            body: encode_body(hash, 0),
        },
    }
}

/// Creates a sample of the series `series_ref` at `timestamp`.
pub fn sample(series_ref: u64, timestamp: i64) -> Sample {
    Sample {
        series_ref,
        timestamp,
        value: 1.0,
    }
}

/// Removes hashes from the in-flight set, including when a send is cancelled by its timeout.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<u64>>,
    hashes: Vec<u64>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock();
        for hash in &self.hashes {
            set.remove(hash);
        }
    }
}

/// A [`RemoteClient`] that records every successful write.
///
/// Also detects writes that put the same series in flight twice.
#[derive(Debug, Default)]
pub struct RecordingClient {
    sends: Mutex<Vec<(Tenant, Vec<u64>)>>,
    in_flight: Mutex<HashSet<u64>>,
    overlaps: AtomicUsize,
    delay: Mutex<Duration>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingClient {
    /// Creates a client that accepts all writes immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail after its delay.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Delays every following write.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Returns all successful writes with the hashes they contained, in completion order.
    pub fn sends(&self) -> Vec<(Tenant, Vec<u64>)> {
        self.sends.lock().clone()
    }

    /// Returns the hashes of all successfully written series.
    pub fn hashes(&self) -> Vec<u64> {
        self.sends
            .lock()
            .iter()
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect()
    }

    /// Returns how often a series was written while already in flight.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::Relaxed)
    }

    /// Returns `true` once the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteClient for RecordingClient {
    async fn send(&self, tenant: &Tenant, series: Vec<TimeSeries>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let hashes: Vec<u64> = series.iter().map(|s| decode_hash(&s.body)).collect();
        {
            let mut set = self.in_flight.lock();
            for hash in &hashes {
                if !set.insert(*hash) {
                    self.overlaps.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let guard = InFlight {
            set: &self.in_flight,
            hashes: hashes.clone(),
        };

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        if self.fail.load(Ordering::Relaxed) {
            return Err(SendError::Rejected(format!("{} series refused", hashes.len())));
        }

        self.sends.lock().push((tenant.clone(), hashes));
        Ok(())
    }

    async fn close(&self) -> Result<(), SendError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// A [`ClientFactory`] handing out one shared [`RecordingClient`].
///
/// Endpoints starting with `invalid` are rejected.
#[derive(Debug, Default)]
pub struct TestClientFactory {
    client: Arc<RecordingClient>,
    created: AtomicUsize,
}

impl TestClientFactory {
    /// Creates a factory with a fresh client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client handed out by this factory.
    pub fn client(&self) -> Arc<RecordingClient> {
        Arc::clone(&self.client)
    }

    /// Returns how many clients were created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl ClientFactory for TestClientFactory {
    fn create(&self, options: &ClientOptions) -> Result<Arc<dyn RemoteClient>, ClientError> {
        let invalid = options.endpoint.as_ref().filter(|e| e.starts_with("invalid"));
        if let Some(endpoint) = invalid {
            return Err(ClientError::InvalidEndpoint(endpoint.clone()));
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(self.client.clone())
    }
}

/// A [`SampleBuilder`] that uses the series reference as hash.
///
/// Series are written to the tenant of the external labels. Converts at most `chunk_size`
/// samples per call.
#[derive(Debug)]
pub struct TestBuilder {
    chunk_size: usize,
    fail_on: Mutex<Option<u64>>,
    refreshes: AtomicUsize,
    clears: AtomicUsize,
}

impl TestBuilder {
    /// Creates a builder converting up to `chunk_size` samples per call.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            fail_on: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        }
    }

    /// Makes conversion fail when it reaches the given series.
    pub fn fail_on(&self, series_ref: Option<u64>) {
        *self.fail_on.lock() = series_ref;
    }

    /// Returns how often the cache was force-refreshed.
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Returns how often the cache was cleared.
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::Relaxed)
    }
}

impl SampleBuilder for TestBuilder {
    fn convert<'s>(
        &self,
        _metadata: &dyn MetadataSource,
        external_labels: &ExternalLabels,
        samples: &'s [Sample],
        _exemplars: &Exemplars,
    ) -> Result<(Vec<HashedSeries>, &'s [Sample]), ConvertError> {
        let tenant = external_labels
            .tenant()
            .ok_or_else(|| ConvertError::Invalid("missing project_id".to_owned()))?;

        let fail_on = *self.fail_on.lock();
        let (head, rest) = samples.split_at(samples.len().min(self.chunk_size));

        let mut converted = Vec::with_capacity(head.len());
        for sample in head {
            if fail_on == Some(sample.series_ref) {
                return Err(ConvertError::UnknownSeries(sample.series_ref));
            }

            converted.push(HashedSeries {
                hash: sample.series_ref,
                series: TimeSeries {
                    tenant: tenant.clone(),
                    body: encode_body(sample.series_ref, sample.timestamp),
                },
            });
        }

        Ok((converted, rest))
    }

    fn force_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }
}

/// Metadata source without any metric families.
pub fn no_metadata(_metric: &str) -> Option<crate::series::Metadata> {
    None
}
