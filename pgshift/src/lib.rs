//! pgshift: online migration of a running PostgreSQL instance to a second
//! one, with the source still taking writes.
//!
//! The data plane extracts a consistent initial snapshot with parallel bulk
//! copy, consumes the source's logical WAL stream from the matching
//! consistent point, replays decoded changes on the destination preserving
//! source transaction boundaries, and proves catch-up with in-band sentinel
//! markers so traffic can be cut over. See `pipeline` for the lifecycle.

pub mod applier;
pub mod config;
pub mod copier;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod messages;
pub mod metrics;
pub mod pipeline;
pub mod sentinel;
pub mod sql;

pub use config::{EndpointConf, PgShiftConf};
pub use pipeline::{NullSink, Phase, Pipeline, ReportSink, SchemaSync, TableState};

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_SLOT_NAME: &str = "pgshift";
    pub const DEFAULT_PUBLICATION: &str = "pgshift_pub";
    pub const DEFAULT_OUTPUT_PLUGIN: &str = "pgoutput";
    pub const DEFAULT_SNAPSHOT_WORKERS: usize = 4;
    pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
}
