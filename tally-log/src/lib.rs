//! Logging for the tally exporter crates.
//!
//! All crates log through the macros re-exported here: [`error!`], [`warn!`], [`info!`],
//! [`debug!`] and [`trace!`]. They are the `tracing` macros and take a message plus structured
//! fields.
//!
//! # Setup
//!
//! With the `init` feature, [`init`] installs the global subscriber from a [`LogConfig`], which is
//! usually part of the configuration file:
//!
//! ```ignore
//! tally_log::init(&LogConfig {
//!     level: Level::Debug,
//!     ..LogConfig::default()
//! });
//! ```
//!
//! # Levels and Messages
//!
//! Messages are lowercase, short, and carry details as fields rather than in the text.
//!
//! - [`error!`]: a batch or request failed, or an invariant is at risk.
//! - [`warn!`]: data was lost on purpose, for example at the end of the shutdown drain.
//! - [`info!`]: lifecycle events such as startup, shutdown, and configuration reloads.
//! - [`debug!`] and [`trace!`]: details for debugging.
//!
//! The sample ingestion path never logs per sample. Drops are counted with metrics.
//!
//! # Errors
//!
//! Pass errors as the `error` field, so the subscriber can print their sources. In format
//! strings, [`LogError`] prints the full chain:
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use tally_log::LogError;
//!
//! let error = Error::new(ErrorKind::TimedOut, "send timed out");
//! tally_log::error!(
//!     error = &error as &dyn std::error::Error,
//!     tenant = "project-a",
//!     "failed to send batch"
//! );
//! tally_log::error!("failed to send batch: {}", LogError(&error));
//! ```
//!
//! # Testing
//!
//! With the `test` feature, [`init_test!`] captures the calling crate's logs in the test
//! output. Tests usually call `tally_test::setup()` instead.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
