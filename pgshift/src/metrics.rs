//! Global pipeline metrics. Serving the registry is somebody else's job;
//! the pipeline only records.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

pub static MIGRATION_PHASE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgshift_migration_phase",
        "Current pipeline phase as an ordinal (idle=0 .. done=7)"
    )
    .expect("Failed to register pgshift_migration_phase gauge")
});

pub static RECEIVED_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgshift_received_lsn",
        "Latest WAL position observed from the source"
    )
    .expect("Failed to register pgshift_received_lsn gauge")
});

pub static APPLIED_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgshift_applied_lsn",
        "Highest commit LSN applied on the destination"
    )
    .expect("Failed to register pgshift_applied_lsn gauge")
});

pub static CONFIRMED_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgshift_confirmed_lsn",
        "Highest LSN reported back to the source for WAL retention"
    )
    .expect("Failed to register pgshift_confirmed_lsn gauge")
});

pub static REPLICATION_LAG_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgshift_replication_lag_bytes",
        "Byte distance between the latest observed and the applied position"
    )
    .expect("Failed to register pgshift_replication_lag_bytes gauge")
});

pub static COPIED_TABLES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgshift_copied_tables_total",
        "Number of tables fully copied during the snapshot phase"
    )
    .expect("Failed to register pgshift_copied_tables_total counter")
});

pub static COPIED_ROWS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgshift_copied_rows_total",
        "Number of rows written by the snapshot copier"
    )
    .expect("Failed to register pgshift_copied_rows_total counter")
});

pub static APPLIED_TRANSACTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgshift_applied_transactions_total",
        "Number of source transactions committed on the destination"
    )
    .expect("Failed to register pgshift_applied_transactions_total counter")
});

pub static FILTERED_CHANGES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgshift_filtered_changes_total",
        "Number of self-originated changes dropped by the origin filter"
    )
    .expect("Failed to register pgshift_filtered_changes_total counter")
});

pub static DECODER_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgshift_decoder_reconnects_total",
        "Number of replication connection reconnect attempts"
    )
    .expect("Failed to register pgshift_decoder_reconnects_total counter")
});

pub static SENTINEL_ROUNDTRIP_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pgshift_sentinel_roundtrip_seconds",
        "Time from sentinel injection to applier confirmation",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    )
    .expect("Failed to register pgshift_sentinel_roundtrip_seconds histogram")
});
