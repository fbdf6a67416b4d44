//! `jobrun-store` — the embedded SQL store behind the runner.
//!
//! One SQLite file holds everything: job declarations, run records, the
//! namespaced key/value state store (with grouped items), and the durable
//! work queue. [`store::Store`] owns the connection lifecycle (WAL,
//! foreign keys, forward-only migrations) and hands out narrow accessors:
//!
//! ```no_run
//! # use jobrun_store::Store;
//! let store = Store::open("./data/runner.sqlite")?;
//! store.state().set("sync", "cursor", Some("42"), None)?;
//! let id = store.queue().enqueue("inbox", &serde_json::json!({"threadId": "t1"}), Default::default())?;
//! # Ok::<(), jobrun_store::StoreError>(())
//! ```
//!
//! Writers are serialized by a `Mutex` around the single connection; the
//! store handle is cheap to clone and share across tasks. Multiple
//! processes writing the same file are not supported.

pub mod error;
pub mod jobs;
pub mod migrations;
pub mod queue;
pub mod runs;
pub mod state;
pub mod store;

pub use error::{Result, StoreError};
pub use jobs::{JobSummary, NewJob};
pub use queue::{
    DedupScope, EnqueueOptions, QueueDef, DEFAULT_RETENTION_DAYS, ENQUEUE_SKIPPED,
};
pub use state::{parse_ttl, ItemOrder};
pub use store::Store;
