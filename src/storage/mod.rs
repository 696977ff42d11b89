//! Storage backends for probe history, state-machine rows and events.
//!
//! Two backends share one trait:
//!
//! - **SQLite** (default): embedded, WAL mode, single-writer friendly
//! - **PostgreSQL**: pooled connections, plus the optional DB-side timeline
//!   aggregation capability used by the 7d/30d read paths
//!
//! Callers must feature-detect the aggregation capability via
//! `ProbeStore::supports_timeline_agg` and fall back to raw-row aggregation.

pub mod error;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use store::{ChannelMapping, EventFilter, ProbeStore};
