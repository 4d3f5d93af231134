//! Logical replication decoder. Owns the dedicated replication-protocol
//! connection to the source, turns the WAL byte stream into typed pipeline
//! messages, and reports the applied position back through periodic standby
//! status updates so the source can advance WAL retention.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use postgres_protocol::message::backend::{
    LogicalReplicationMessage, RelationBody, ReplicationMessage, Tuple, TupleData, XLogDataBody,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::replication::LogicalReplicationStream;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::lsn::Lsn;

use crate::config::EndpointConf;
use crate::error::DecoderError;
use crate::messages::{
    Cell, Change, ChangeKind, ColumnDesc, PipelineMessage, RelationDesc, PIPELINE_CHANNEL_CAPACITY,
};
use crate::metrics::{CONFIRMED_LSN, RECEIVED_LSN};
use crate::sql::quote_ident;

#[derive(Debug, Clone)]
pub struct DecoderConf {
    pub slot_name: String,
    pub publication: String,
    pub output_plugin: String,
    pub status_interval: std::time::Duration,
}

/// Slot creation result: the consistent point the stream will replay from
/// and, for freshly created slots, the exported snapshot handle.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub consistent_point: Lsn,
    pub snapshot_name: Option<String>,
}

/// IDENTIFY_SYSTEM response.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub systemid: String,
    pub timeline: u32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

pub struct WalDecoder {
    conf: DecoderConf,
    /// Taken by `start_streaming`; the receive loop keeps it alive after.
    client: Option<Client>,
    conn_task: JoinHandle<()>,
    start_point: Option<Lsn>,
    confirmed: Arc<AtomicU64>,
    latest_received: Arc<AtomicU64>,
    cancel: CancellationToken,
    recv_task: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<DecoderError>>>,
}

impl WalDecoder {
    /// Open the dedicated replication-protocol connection to the source.
    pub async fn connect(
        conf: DecoderConf,
        endpoint: &EndpointConf,
        confirmed: Arc<AtomicU64>,
        latest_received: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Result<Self, DecoderError> {
        let mut pg_conf = endpoint.pg_config();
        pg_conf.replication_mode(ReplicationMode::Logical);
        let (client, connection) = pg_conf.connect(NoTls).await?;
        let conn_task = tokio::spawn(async move {
            // The receive loop observes failures through the stream itself.
            if let Err(e) = connection.await {
                debug!("replication connection closed: {e}");
            }
        });
        Ok(WalDecoder {
            conf,
            client: Some(client),
            conn_task,
            start_point: None,
            confirmed,
            latest_received,
            cancel,
            recv_task: None,
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    /// Ask the source who it is and where its WAL currently ends. Only valid
    /// before `start_streaming`.
    pub async fn identify_system(&self) -> Result<SystemIdentity, DecoderError> {
        let client = self.client.as_ref().ok_or_else(|| {
            DecoderError::Protocol("identify_system called after start_streaming".to_string())
        })?;
        let messages = client.simple_query("IDENTIFY_SYSTEM").await?;
        let row = messages
            .iter()
            .find_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .ok_or_else(|| {
                DecoderError::Protocol("IDENTIFY_SYSTEM returned no row".to_string())
            })?;
        let field = |name: &str| {
            row.try_get(name)
                .map_err(|e| DecoderError::Protocol(format!("bad IDENTIFY_SYSTEM response: {e}")))
        };
        let identity = SystemIdentity {
            systemid: field("systemid")?.unwrap_or_default().to_string(),
            timeline: field("timeline")?
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
            xlogpos: field("xlogpos")?
                .ok_or_else(|| DecoderError::Protocol("null xlogpos".to_string()))?
                .parse::<Lsn>()
                .map_err(|e| DecoderError::Protocol(format!("bad xlogpos: {e}")))?,
            dbname: field("dbname")?.map(|s| s.to_string()),
        };
        self.latest_received
            .fetch_max(identity.xlogpos.0, Ordering::AcqRel);
        RECEIVED_LSN.set(identity.xlogpos.0 as i64);
        Ok(identity)
    }

    /// Create the slot and capture its consistent point and exported
    /// snapshot. With `resume_from` set, the slot is assumed to exist on the
    /// source already; nothing is created and no snapshot is available.
    pub async fn create_slot(&mut self, resume_from: Option<Lsn>) -> Result<SlotInfo, DecoderError> {
        if let Some(lsn) = resume_from {
            self.start_point = Some(lsn);
            return Ok(SlotInfo {
                consistent_point: lsn,
                snapshot_name: None,
            });
        }
        let client = self.client.as_ref().ok_or_else(|| {
            DecoderError::Protocol("create_slot called after start_streaming".to_string())
        })?;
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {} EXPORT_SNAPSHOT",
            quote_ident(&self.conf.slot_name),
            quote_ident(&self.conf.output_plugin),
        );
        let messages = client
            .simple_query(&query)
            .await
            .map_err(|cause| DecoderError::SlotCreationFailed {
                slot: self.conf.slot_name.clone(),
                cause,
            })?;
        let row = messages
            .iter()
            .find_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .ok_or_else(|| {
                DecoderError::Protocol("CREATE_REPLICATION_SLOT returned no row".to_string())
            })?;
        let consistent_point = row
            .try_get("consistent_point")
            .map_err(|e| DecoderError::Protocol(format!("bad slot creation response: {e}")))?
            .ok_or_else(|| DecoderError::Protocol("null consistent_point".to_string()))?
            .parse::<Lsn>()
            .map_err(|e| DecoderError::Protocol(format!("bad consistent_point: {e}")))?;
        let snapshot_name = row
            .try_get("snapshot_name")
            .map_err(|e| DecoderError::Protocol(format!("bad slot creation response: {e}")))?
            .map(|s| s.to_string());
        self.start_point = Some(consistent_point);
        info!(
            slot = %self.conf.slot_name,
            %consistent_point,
            snapshot = snapshot_name.as_deref().unwrap_or(""),
            "created replication slot"
        );
        Ok(SlotInfo {
            consistent_point,
            snapshot_name,
        })
    }

    /// Begin consuming WAL from the recorded consistent point. Invalidates
    /// the exported snapshot: copies bound to it must have finished.
    ///
    /// The returned sequence is finite; it ends when the decoder is closed
    /// or the connection errors, after which `last_error` tells which.
    pub async fn start_streaming(
        &mut self,
    ) -> Result<mpsc::Receiver<PipelineMessage>, DecoderError> {
        let client = self.client.take().ok_or_else(|| {
            DecoderError::Protocol("start_streaming may only be called once".to_string())
        })?;
        let start_point = self.start_point.ok_or_else(|| {
            DecoderError::Protocol("start_streaming called before create_slot".to_string())
        })?;
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (\"proto_version\" '1', \"publication_names\" '{}')",
            quote_ident(&self.conf.slot_name),
            start_point,
            self.conf.publication,
        );
        let duplex = client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|cause| DecoderError::StartReplicationFailed {
                slot: self.conf.slot_name.clone(),
                cause,
            })?;
        info!(slot = %self.conf.slot_name, %start_point, "replication stream started");
        let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let receive_loop = ReceiveLoop {
            stream: Box::pin(LogicalReplicationStream::new(duplex)),
            _client: client,
            tx,
            confirmed: self.confirmed.clone(),
            latest_received: self.latest_received.clone(),
            cancel: self.cancel.clone(),
            status_interval: self.conf.status_interval,
            relations: HashMap::new(),
            origin: String::new(),
            last_error: self.last_error.clone(),
        };
        let span = info_span!("decoder", slot = %self.conf.slot_name);
        self.recv_task = Some(tokio::spawn(receive_loop.run().instrument(span)));
        Ok(rx)
    }

    /// Record the highest durably applied LSN. Monotonic: lower values are
    /// ignored. The next status report carries this value; this is the sole
    /// mechanism for WAL-retention advancement.
    pub fn confirm_lsn(&self, lsn: Lsn) {
        self.confirmed.fetch_max(lsn.0, Ordering::AcqRel);
    }

    /// Error that terminated the receive loop, if any. Consumed by the
    /// orchestrator's retry logic.
    pub fn last_error(&self) -> Option<DecoderError> {
        self.last_error.lock().take()
    }

    /// Cancel the receive loop, close the connection, and wait until the
    /// emitting task has fully exited. Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.recv_task.take() {
            if let Err(e) = task.await {
                warn!("decoder receive task panicked: {e}");
            }
        }
        drop(self.client.take());
        self.conn_task.abort();
    }
}

struct ReceiveLoop {
    stream: Pin<Box<LogicalReplicationStream>>,
    _client: Client,
    tx: mpsc::Sender<PipelineMessage>,
    confirmed: Arc<AtomicU64>,
    latest_received: Arc<AtomicU64>,
    cancel: CancellationToken,
    status_interval: std::time::Duration,
    relations: HashMap<u32, Arc<RelationDesc>>,
    /// Origin tag of the transaction currently being decoded; set by Origin
    /// messages, cleared at every Begin.
    origin: String,
    last_error: Arc<Mutex<Option<DecoderError>>>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => debug!("receive loop stopped"),
            Err(e) => {
                warn!("receive loop exited: {e}");
                *self.last_error.lock() = Some(e);
            }
        }
        // Dropping the sender closes the channel, signalling completion to
        // the downstream consumer.
    }

    async fn run_inner(&mut self) -> Result<(), DecoderError> {
        let mut status_ticks = tokio::time::interval(self.status_interval);
        status_ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                _ = status_ticks.tick() => {
                    self.send_status(false).await?;
                }
                message = self.stream.next() => match message {
                    None => {
                        return Err(DecoderError::Protocol(
                            "replication stream ended unexpectedly".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Err(DecoderError::ConnectionLost(e)),
                    Some(Ok(ReplicationMessage::PrimaryKeepAlive(keepalive))) => {
                        self.observe_received(keepalive.wal_end());
                        if keepalive.reply() != 0 {
                            self.send_status(true).await?;
                        }
                    }
                    Some(Ok(ReplicationMessage::XLogData(body))) => {
                        self.handle_xlog_data(body).await?;
                    }
                    Some(Ok(other)) => {
                        trace!("ignoring replication message {other:?}");
                    }
                }
            }
        }
    }

    fn observe_received(&self, wal_end: u64) {
        self.latest_received.fetch_max(wal_end, Ordering::AcqRel);
        RECEIVED_LSN.set(wal_end as i64);
    }

    async fn handle_xlog_data(
        &mut self,
        body: XLogDataBody<LogicalReplicationMessage>,
    ) -> Result<(), DecoderError> {
        let wal_lsn = Lsn(body.wal_start());
        self.observe_received(body.wal_end());
        let received_at = SystemTime::now();
        let message = match body.into_data() {
            LogicalReplicationMessage::Begin(begin) => {
                // A new transaction starts untagged; Origin, if any, follows.
                self.origin.clear();
                Some(PipelineMessage::Begin {
                    xid: begin.xid(),
                    final_lsn: Lsn(begin.final_lsn()),
                    commit_time: begin.timestamp(),
                })
            }
            LogicalReplicationMessage::Commit(commit) => Some(PipelineMessage::Commit {
                commit_lsn: Lsn(commit.commit_lsn()),
                end_lsn: Lsn(commit.end_lsn()),
                commit_time: commit.timestamp(),
            }),
            LogicalReplicationMessage::Origin(origin) => {
                self.origin = origin
                    .name()
                    .map_err(|e| DecoderError::Protocol(format!("bad origin name: {e}")))?
                    .to_string();
                None
            }
            LogicalReplicationMessage::Relation(relation) => {
                let desc = Arc::new(relation_desc(&relation)?);
                self.relations.insert(desc.relation_id, desc.clone());
                Some(PipelineMessage::Relation(desc))
            }
            LogicalReplicationMessage::Insert(insert) => self.change(
                ChangeKind::Insert,
                insert.rel_id(),
                None,
                Some(tuple_cells(insert.tuple())?),
                wal_lsn,
                received_at,
            ),
            LogicalReplicationMessage::Update(update) => {
                let old_tuple = update
                    .old_tuple()
                    .or_else(|| update.key_tuple())
                    .map(tuple_cells)
                    .transpose()?;
                self.change(
                    ChangeKind::Update,
                    update.rel_id(),
                    old_tuple,
                    Some(tuple_cells(update.new_tuple())?),
                    wal_lsn,
                    received_at,
                )
            }
            LogicalReplicationMessage::Delete(delete) => {
                let old_tuple = delete
                    .old_tuple()
                    .or_else(|| delete.key_tuple())
                    .map(tuple_cells)
                    .transpose()?;
                self.change(
                    ChangeKind::Delete,
                    delete.rel_id(),
                    old_tuple,
                    None,
                    wal_lsn,
                    received_at,
                )
            }
            LogicalReplicationMessage::Truncate(truncate) => {
                let options = truncate.options();
                Some(PipelineMessage::Truncate {
                    relation_ids: truncate.rel_ids().to_vec(),
                    cascade: options & 1 != 0,
                    restart_identity: options & 2 != 0,
                    origin: self.origin.clone(),
                })
            }
            other => {
                trace!("ignoring logical message {other:?}");
                None
            }
        };
        if let Some(message) = message {
            // Back-pressure from a slow applier lands here; only shutdown
            // may interrupt the send.
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                sent = self.tx.send(message) => {
                    if sent.is_err() {
                        return Err(DecoderError::Protocol(
                            "pipeline channel closed".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn change(
        &self,
        kind: ChangeKind,
        relation_id: u32,
        old_tuple: Option<Vec<Cell>>,
        new_tuple: Option<Vec<Cell>>,
        wal_lsn: Lsn,
        received_at: SystemTime,
    ) -> Option<PipelineMessage> {
        if !self.relations.contains_key(&relation_id) {
            // The stream re-sends Relation on topology changes; a miss means
            // the slot predates the first Relation emission. Worth recording
            // but not fatal.
            warn!(relation_id, "change cites an unknown relation, skipping");
            return None;
        }
        Some(PipelineMessage::Change(Change {
            kind,
            relation_id,
            old_tuple,
            new_tuple,
            wal_lsn,
            received_at,
            origin: self.origin.clone(),
        }))
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<(), DecoderError> {
        let confirmed = Lsn(self.confirmed.load(Ordering::Acquire));
        let now = SystemTime::now();
        let position = PgLsn::from(confirmed.0);
        self.stream
            .as_mut()
            .standby_status_update(position, position, position, now, reply_requested as u8)
            .await
            .map_err(DecoderError::ConnectionLost)?;
        CONFIRMED_LSN.set(confirmed.0 as i64);
        trace!(%confirmed, "sent standby status update");
        Ok(())
    }
}

fn relation_desc(relation: &RelationBody) -> Result<RelationDesc, DecoderError> {
    let columns = relation
        .columns()
        .iter()
        .map(|column| {
            Ok(ColumnDesc {
                name: column
                    .name()
                    .map_err(|e| DecoderError::Protocol(format!("bad column name: {e}")))?
                    .to_string(),
                type_oid: column.type_id() as u32,
                part_of_key: column.flags() & 1 != 0,
            })
        })
        .collect::<Result<Vec<_>, DecoderError>>()?;
    Ok(RelationDesc {
        relation_id: relation.rel_id(),
        namespace: relation
            .namespace()
            .map_err(|e| DecoderError::Protocol(format!("bad namespace: {e}")))?
            .to_string(),
        name: relation
            .name()
            .map_err(|e| DecoderError::Protocol(format!("bad relation name: {e}")))?
            .to_string(),
        columns,
    })
}

fn tuple_cells(tuple: &Tuple) -> Result<Vec<Cell>, DecoderError> {
    tuple
        .tuple_data()
        .iter()
        .map(|data| match data {
            TupleData::Null => Ok(Cell::Null),
            TupleData::UnchangedToast => Ok(Cell::UnchangedToast),
            TupleData::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Cell::Value(s.to_string()))
                .map_err(|e| DecoderError::Protocol(format!("non-utf8 tuple data: {e}"))),
            other => Err(DecoderError::Protocol(format!(
                "unsupported tuple data encoding {other:?}"
            ))),
        })
        .collect()
}
