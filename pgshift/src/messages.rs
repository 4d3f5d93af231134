//! The message model flowing through the pipeline channel, plus lag helpers.
//!
//! Every item in the single in-order channel between decoder and applier is a
//! [`PipelineMessage`]. Relation descriptors are shared by `Arc`: the decoder
//! owns the cache, downstream holds immutable references.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use utils::lsn::Lsn;

/// Capacity of the bounded channels between pipeline stages. Back-pressure
/// on the decoder is essential: a slow applier must throttle the WAL read.
pub const PIPELINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: u32,
    /// Part of the relation's replica identity.
    pub part_of_key: bool,
}

/// Schema metadata for one source relation, keyed by the source-assigned
/// relation id. Replaced in place when the source re-sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDesc {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnDesc>,
}

/// One cell of a tuple, aligned positionally with the relation's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Null,
    /// Value stored out of line and unmodified; the destination keeps what
    /// it already has.
    UnchangedToast,
    /// Text representation of the value; the destination's type input
    /// functions perform the coercion.
    Value(String),
}

impl Cell {
    pub fn as_value(&self) -> Option<&str> {
        match self {
            Cell::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub relation_id: u32,
    pub old_tuple: Option<Vec<Cell>>,
    pub new_tuple: Option<Vec<Cell>>,
    pub wal_lsn: Lsn,
    pub received_at: SystemTime,
    /// Origin tag of the transaction this change belongs to; empty for
    /// locally originated writes.
    pub origin: String,
}

#[derive(Debug, Clone)]
pub enum PipelineMessage {
    Begin {
        xid: u32,
        final_lsn: Lsn,
        /// Microseconds since the PostgreSQL epoch (2000-01-01).
        commit_time: i64,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    Relation(Arc<RelationDesc>),
    Change(Change),
    /// Bulk truncation of one or more relations, within a transaction.
    Truncate {
        relation_ids: Vec<u32>,
        cascade: bool,
        restart_identity: bool,
        origin: String,
    },
    /// Synthetic marker injected by the sentinel coordinator; carries no
    /// transactional semantics.
    Sentinel {
        id: String,
        injected_at_lsn: Lsn,
        injected_at: SystemTime,
    },
}

/// Byte distance between the latest observed server position and the applied
/// position. Never underflows.
pub fn lag(applied: Lsn, latest: Lsn) -> u64 {
    u64::from(latest).saturating_sub(u64::from(applied))
}

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;

/// Human form of a lag figure, e.g. `3.5 MB (1s 200ms behind)`.
pub fn format_lag(bytes: u64, latency: Duration) -> String {
    let amount = if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    };
    let latency = Duration::from_millis(latency.as_millis() as u64);
    format!(
        "{amount} ({} behind)",
        humantime::format_duration(latency)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_never_underflows() {
        assert_eq!(lag(Lsn(100), Lsn(250)), 150);
        assert_eq!(lag(Lsn(250), Lsn(100)), 0);
        assert_eq!(lag(Lsn(7), Lsn(7)), 0);
        assert_eq!(lag(Lsn::INVALID, Lsn::MAX), u64::MAX);
    }

    #[test]
    fn format_lag_tiers() {
        let ms = Duration::from_millis(120);
        assert!(format_lag(512, ms).starts_with("512 B"));
        assert!(format_lag(2 * KB, ms).starts_with("2.0 KB"));
        assert!(format_lag(3 * MB + MB / 2, ms).starts_with("3.5 MB"));
        assert!(format_lag(5 * GB, ms).starts_with("5.0 GB"));
    }

    #[test]
    fn format_lag_truncates_latency_to_millis() {
        let s = format_lag(0, Duration::from_micros(1_200_456));
        assert!(s.contains("1s 200ms"), "{s}");
    }

    // The textual form round-trips: parsing by its own rules recovers the
    // tier and the approximate magnitude.
    #[test]
    fn format_lag_roundtrip() {
        for (bytes, unit, magnitude) in [
            (800u64, "B", 800.0),
            (4 * KB, "KB", 4.0),
            (10 * MB, "MB", 10.0),
            (2 * GB, "GB", 2.0),
        ] {
            let s = format_lag(bytes, Duration::from_millis(1));
            let mut parts = s.split_whitespace();
            let value: f64 = parts.next().unwrap().parse().unwrap();
            assert_eq!(parts.next().unwrap(), unit);
            assert!((value - magnitude).abs() < 0.1, "{s}");
        }
    }
}
