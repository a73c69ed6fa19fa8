//! Sharded, batching export of metric samples to a remote ingestion API.
//!
//! # Overview
//!
//! Producers hand raw samples to an [`ExporterHandle`]. The samples are converted into hashed
//! series by an external [`SampleBuilder`] and queued into one of a fixed number of [`Shard`]s,
//! chosen by `hash % shard_count`. Enqueueing never blocks: samples that do not fit into their
//! shard are dropped and counted.
//!
//! A single dispatcher, started with [`Exporter::run`], moves queued series into a [`Batch`]. A
//! batch groups series by tenant and is sent once a tenant reaches the maximum batch size, or
//! when the batch delay elapses. Each tenant is written with a separate request, and all
//! contributing shards are released once every request of the batch has completed.
//!
//! # Ordering
//!
//! The backend rejects concurrent or out-of-order writes for the same series. The exporter never
//! puts a series into two concurrent requests:
//!
//!  - A shard contributes to at most one in-flight batch. It is *pending* until that batch
//!    completes and contributes nothing in the meantime.
//!  - A single fill stops at the first entry whose series was already taken in that fill.
//!
//! # Leases
//!
//! With several replicas scraping the same targets, only the holder of the [`Lease`] writes.
//! Samples outside the leased time range are dropped.
//!
//! # Example
//!
//! ```ignore
//! let exporter = Exporter::new(config, reload, deps)?;
//! let handle = exporter.handle();
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn(exporter.run(shutdown.clone()));
//!
//! handle.export(&metadata, &samples, &Exemplars::new());
//! ```
#![warn(missing_docs)]

mod batch;
mod client;
mod config;
mod exporter;
mod labels;
mod lease;
mod queue;
mod series;
mod shard;
mod stats;
mod statsd;

#[doc(hidden)]
pub mod testutils;

pub use self::batch::*;
pub use self::client::*;
pub use self::config::*;
pub use self::exporter::*;
pub use self::labels::*;
pub use self::lease::*;
pub use self::queue::*;
pub use self::series::*;
pub use self::shard::*;
pub use self::stats::*;
