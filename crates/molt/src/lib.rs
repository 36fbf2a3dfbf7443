//! # molt
//!
//! MOLT (Migrate Off Legacy Things) moves and reconciles tabular data
//! between a source database (PostgreSQL, MySQL, Oracle) and a CockroachDB
//! target. The library provides:
//!
//! - **Fetch**: a parallel, streaming table export/load pipeline that
//!   materialises rows as CSV chunks in a blob store (local HTTP, S3, GCS)
//!   or streams them directly via `COPY`, then drives `IMPORT INTO` on the
//!   target while polling progress.
//! - **Verify**: a shard-parallel, ordered row comparator that detects
//!   schema mismatches and missing/extraneous/differing rows, with optional
//!   live reverification and write-back fixups.
//!
//! ## Example
//!
//! ```rust,no_run
//! use molt::dbconn::{self, OrderedConns};
//! use molt::filter::TableFilter;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> molt::Result<()> {
//!     let source = dbconn::connect("source", "postgres://localhost:5432/defaultdb").await?;
//!     let target = dbconn::connect("target", "postgres://localhost:26257/defaultdb").await?;
//!     let conns = OrderedConns::new(source, target);
//!     let cfg = molt::fetch::FetchConfig::default();
//!     let store = molt::blobstore::local::LocalStore::new(
//!         "/tmp/molt".into(),
//!         "127.0.0.1:4040".parse().unwrap(),
//!         None,
//!     )
//!     .await?;
//!     molt::fetch::fetch(
//!         CancellationToken::new(),
//!         cfg,
//!         &conns,
//!         std::sync::Arc::new(store),
//!         &TableFilter::default(),
//!     )
//!     .await
//! }
//! ```

pub mod blobstore;
pub mod compression;
pub mod dbconn;
pub mod dbtable;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod metrics;
pub mod mysqlurl;
pub mod retry;
pub mod sqlbuild;
pub mod tableverify;
pub mod typeconv;
pub mod verify;

// Re-exports for convenient access
pub use dbconn::{Conn, Dialect, OrderedConns};
pub use dbtable::{DBTable, Name, VerifiedTable};
pub use error::{MoltError, Result};
pub use retry::{Retry, RetrySettings};
