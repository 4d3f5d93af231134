//! Error taxonomy. Component errors bubble out of their top-level entry
//! points; the pipeline's run methods decide between retry (transient
//! decoder-path failures during streaming) and abort (everything else).

use std::time::Duration;

use utils::lsn::Lsn;

use crate::messages::ChangeKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ValidationError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("failed to create replication slot {slot}")]
    SlotCreationFailed {
        slot: String,
        #[source]
        cause: tokio_postgres::Error,
    },
    #[error("START_REPLICATION failed for slot {slot}")]
    StartReplicationFailed {
        slot: String,
        #[source]
        cause: tokio_postgres::Error,
    },
    #[error("replication connection lost")]
    ConnectionLost(#[from] tokio_postgres::Error),
    #[error("replication protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("destination connection failed")]
    Connect(#[source] tokio_postgres::Error),
    #[error("destination session setup failed: {0}")]
    SessionSetup(String),
    #[error("transaction control statement failed")]
    Txn(#[source] tokio_postgres::Error),
    #[error("{op} on {table} failed")]
    Dml {
        op: ChangeKind,
        table: String,
        #[source]
        cause: tokio_postgres::Error,
    },
    #[error("TRUNCATE of {tables} failed")]
    Truncate {
        tables: String,
        #[source]
        cause: tokio_postgres::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("copy failed for {table}")]
pub struct CopyError {
    pub table: String,
    #[source]
    pub cause: tokio_postgres::Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SentinelError {
    #[error("sentinel {0} was not confirmed before the deadline")]
    Timeout(String),
    #[error("unknown sentinel ticket {0}")]
    Unknown(String),
    #[error("pipeline channel closed before the sentinel could be injected")]
    ChannelClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("connecting to the {0} timed out")]
    ConnectTimeout(&'static str),
    #[error("connecting to the {side} failed")]
    Connect {
        side: &'static str,
        #[source]
        cause: tokio_postgres::Error,
    },
    #[error("source query failed")]
    SourceQuery(#[source] tokio_postgres::Error),
    #[error("destination query failed")]
    DestQuery(#[source] tokio_postgres::Error),
    #[error("replication slot {0} does not exist on the source")]
    SlotNotFound(String),
    #[error("replication slot {0} is active; another consumer is attached")]
    SlotActive(String),
    #[error("switchover was not confirmed within {0:?}")]
    SwitchoverTimeout(Duration),
    #[error("pipeline is not streaming")]
    NotStreaming,
    #[error("decoder retries exhausted without progress past {0}")]
    RetriesExhausted(Lsn),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
