//! # tabletalk
//!
//! Exploratory analysis of tabular files too large to hold in memory, with a
//! question-answering layer that remembers the conversation per dataset.
//!
//! ```no_run
//! use tabletalk::config::Settings;
//! use tabletalk::session::Session;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = Session::from_settings(Settings::default())?;
//! let dataset = session.load_path("sales.csv").await?;
//!
//! let analysis = session.get_analysis(&dataset.fingerprint).await?;
//! println!("{} columns, {:.0}% of rows covered",
//!     analysis.columns.len(), analysis.coverage.fraction * 100.0);
//!
//! let answer = session.submit("What is the mean of price?", &dataset.fingerprint).await?;
//! println!("{}", answer.text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`ingest`]: size classification, schema inference and partitioning
//! - [`aggregate`]: parallel, mergeable streaming statistics
//! - [`analyser`]: descriptive statistics, correlations and anomalies
//! - [`memory`]: append-only conversational memory
//! - [`router`]: question classification and answering
//! - [`ai`]: the LLM collaborator and its canned stand-in
//! - [`session`]: ties the above together

#![warn(clippy::all, rust_2018_idioms)]

pub mod aggregate;
pub mod ai;
pub mod analyser;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod router;
pub mod session;
pub mod utils;
