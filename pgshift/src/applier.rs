//! Applies decoded pipeline messages on the destination, reproducing the
//! source's transactional grouping. Commit is the only event that advances
//! the applied LSN: a partially applied transaction is rolled back on error
//! and fully redone when the source replays from the last confirmed point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::*;
use utils::lsn::Lsn;

use crate::config::EndpointConf;
use crate::error::ApplyError;
use crate::messages::{Change, ChangeKind, PipelineMessage, RelationDesc};
use crate::metrics::{APPLIED_LSN, APPLIED_TRANSACTIONS};
use crate::sql;

#[derive(Clone, Copy)]
enum TxnState {
    Idle,
    InTxn { begin_lsn: Lsn },
}

pub struct Applier {
    client: Client,
    conn_task: JoinHandle<()>,
    /// Relation cache used for column lookup when building DML; separate
    /// from the decoder's cache and refreshed by Relation messages in-band.
    relations: HashMap<u32, Arc<RelationDesc>>,
    state: TxnState,
    last_applied: Arc<AtomicU64>,
}

impl Applier {
    /// Open the destination connection and prepare the session: replayed
    /// rows must not fire the destination's own replication machinery, and
    /// with `apply_origin` set they are stamped so a paired reverse pipeline
    /// can recognize them. Any rejection fails the connection immediately.
    pub async fn connect(
        endpoint: &EndpointConf,
        apply_origin: &str,
        last_applied: Arc<AtomicU64>,
    ) -> Result<Self, ApplyError> {
        let (client, connection) = endpoint
            .pg_config()
            .connect(NoTls)
            .await
            .map_err(ApplyError::Connect)?;
        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("destination connection closed: {e}");
            }
        });
        client
            .batch_execute("SET session_replication_role = replica")
            .await
            .map_err(|e| ApplyError::SessionSetup(e.to_string()))?;
        if !apply_origin.is_empty() {
            setup_replication_origin(&client, apply_origin).await?;
        }
        Ok(Applier {
            client,
            conn_task,
            relations: HashMap::new(),
            state: TxnState::Idle,
            last_applied,
        })
    }

    /// Highest commit LSN applied successfully. Thread-safe via the shared
    /// atomic handed in at connect time.
    pub fn last_applied_lsn(&self) -> Lsn {
        Lsn(self.last_applied.load(Ordering::Acquire))
    }

    /// Consume the incoming sequence until it ends or a non-recoverable
    /// error occurs. `on_applied` fires after every committed transaction
    /// with its commit LSN; `on_sentinel` fires for every sentinel observed.
    pub async fn run<F, G>(
        &mut self,
        mut incoming: mpsc::Receiver<PipelineMessage>,
        mut on_applied: F,
        mut on_sentinel: G,
    ) -> Result<(), ApplyError>
    where
        F: FnMut(Lsn),
        G: FnMut(&str),
    {
        while let Some(message) = incoming.recv().await {
            match message {
                PipelineMessage::Sentinel { id, .. } => {
                    // No transactional semantics and no LSN movement.
                    debug!(%id, "sentinel observed");
                    on_sentinel(&id);
                }
                PipelineMessage::Relation(desc) => {
                    self.relations.insert(desc.relation_id, desc);
                }
                PipelineMessage::Begin { final_lsn, .. } => match self.state {
                    TxnState::Idle => {
                        self.client
                            .batch_execute("BEGIN")
                            .await
                            .map_err(ApplyError::Txn)?;
                        self.state = TxnState::InTxn {
                            begin_lsn: final_lsn,
                        };
                    }
                    TxnState::InTxn { begin_lsn } => {
                        warn!(%final_lsn, %begin_lsn, "Begin while already in a transaction");
                    }
                },
                PipelineMessage::Commit { commit_lsn, .. } => match self.state {
                    TxnState::InTxn { .. } => {
                        self.client
                            .batch_execute("COMMIT")
                            .await
                            .map_err(ApplyError::Txn)?;
                        self.state = TxnState::Idle;
                        self.last_applied.fetch_max(commit_lsn.0, Ordering::AcqRel);
                        APPLIED_LSN.set(commit_lsn.0 as i64);
                        APPLIED_TRANSACTIONS.inc();
                        on_applied(commit_lsn);
                    }
                    TxnState::Idle => {
                        warn!(%commit_lsn, "Commit outside a transaction, ignoring");
                    }
                },
                PipelineMessage::Change(change) => match self.state {
                    TxnState::InTxn { .. } => self.apply_change(&change).await?,
                    TxnState::Idle => {
                        // A stray change outside a transaction indicates
                        // upstream filtering inconsistency.
                        warn!(
                            relation_id = change.relation_id,
                            kind = %change.kind,
                            "change outside a transaction, dropping"
                        );
                    }
                },
                PipelineMessage::Truncate {
                    relation_ids,
                    cascade,
                    restart_identity,
                    ..
                } => match self.state {
                    TxnState::InTxn { .. } => {
                        self.apply_truncate(&relation_ids, cascade, restart_identity)
                            .await?
                    }
                    TxnState::Idle => {
                        warn!("truncate outside a transaction, dropping");
                    }
                },
            }
        }
        Ok(())
    }

    async fn apply_change(&mut self, change: &Change) -> Result<(), ApplyError> {
        let Some(relation) = self.relations.get(&change.relation_id) else {
            warn!(
                relation_id = change.relation_id,
                "change cites a relation never announced on this stream, dropping"
            );
            return Ok(());
        };
        let statement = match change.kind {
            ChangeKind::Insert => {
                let Some(new_tuple) = change.new_tuple.as_deref() else {
                    warn!("insert without a new tuple, dropping");
                    return Ok(());
                };
                sql::build_insert(relation, new_tuple)
            }
            ChangeKind::Update => {
                let Some(new_tuple) = change.new_tuple.as_deref() else {
                    warn!("update without a new tuple, dropping");
                    return Ok(());
                };
                sql::build_update(relation, change.old_tuple.as_deref(), new_tuple)
            }
            ChangeKind::Delete => {
                let Some(old_tuple) = change.old_tuple.as_deref() else {
                    // Requires a replica identity on the source table.
                    warn!(
                        relation_id = change.relation_id,
                        "delete without identity columns, dropping"
                    );
                    return Ok(());
                };
                sql::build_delete(relation, old_tuple)
            }
        };
        trace!(sql = %statement.sql, "applying change");
        self.client
            .execute_raw(statement.sql.as_str(), statement.params)
            .await
            .map_err(|cause| ApplyError::Dml {
                op: change.kind,
                table: format!("{}.{}", relation.namespace, relation.name),
                cause,
            })?;
        Ok(())
    }

    async fn apply_truncate(
        &mut self,
        relation_ids: &[u32],
        cascade: bool,
        restart_identity: bool,
    ) -> Result<(), ApplyError> {
        let relations: Vec<&RelationDesc> = relation_ids
            .iter()
            .filter_map(|id| match self.relations.get(id) {
                Some(desc) => Some(desc.as_ref()),
                None => {
                    warn!(relation_id = *id, "truncate cites an unknown relation, skipping");
                    None
                }
            })
            .collect();
        if relations.is_empty() {
            return Ok(());
        }
        let sql = sql::build_truncate(&relations, cascade, restart_identity);
        trace!(%sql, "applying truncate");
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|cause| ApplyError::Truncate {
                tables: relations
                    .iter()
                    .map(|rel| format!("{}.{}", rel.namespace, rel.name))
                    .collect::<Vec<_>>()
                    .join(", "),
                cause,
            })?;
        Ok(())
    }

    /// Roll back any open transaction, e.g. before a replay cycle.
    pub async fn abort(&mut self) {
        if let TxnState::InTxn { begin_lsn } = self.state {
            debug!(%begin_lsn, "rolling back open transaction");
            if let Err(e) = self.client.batch_execute("ROLLBACK").await {
                warn!("rollback failed: {e}");
            }
            self.state = TxnState::Idle;
        }
    }

    /// Release the held transaction, if any, and drop the connection.
    pub async fn close(mut self) {
        self.abort().await;
        drop(self.client);
        self.conn_task.abort();
        let _ = self.conn_task.await;
    }
}

async fn setup_replication_origin(client: &Client, origin: &str) -> Result<(), ApplyError> {
    let exists: bool = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_origin WHERE roname = $1)",
            &[&origin],
        )
        .await
        .map_err(|e| ApplyError::SessionSetup(e.to_string()))?
        .get(0);
    if !exists {
        client
            .execute("SELECT pg_replication_origin_create($1)", &[&origin])
            .await
            .map_err(|e| ApplyError::SessionSetup(e.to_string()))?;
    }
    client
        .execute("SELECT pg_replication_origin_session_setup($1)", &[&origin])
        .await
        .map_err(|e| ApplyError::SessionSetup(e.to_string()))?;
    info!(origin, "destination session bound to replication origin");
    Ok(())
}
