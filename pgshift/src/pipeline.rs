//! End-to-end migration lifecycle: run modes, phase tracking, connection
//! management, decoder reconnection with bounded retries, and the merge of
//! decoder output with in-band sentinel injections.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::backoff;
use utils::lsn::Lsn;

use crate::applier::Applier;
use crate::config::{EndpointConf, PgShiftConf};
use crate::copier::{Copier, CopyEvent, ProgressFn, TableDesc, TableRef};
use crate::decoder::{DecoderConf, WalDecoder};
use crate::error::PipelineError;
use crate::filter;
use crate::messages::{self, PipelineMessage, PIPELINE_CHANNEL_CAPACITY};
use crate::metrics::{
    DECODER_RECONNECTS, MIGRATION_PHASE, REPLICATION_LAG_BYTES, SENTINEL_ROUNDTRIP_SECONDS,
};
use crate::sentinel::SentinelCoordinator;
use crate::sql::quote_ident;

const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_RETRIES_PER_WATERMARK: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Connecting,
    Schema,
    Copy,
    Streaming,
    Switchover,
    SwitchoverComplete,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Schema => "schema",
            Phase::Copy => "copy",
            Phase::Streaming => "streaming",
            Phase::Switchover => "switchover",
            Phase::SwitchoverComplete => "switchover-complete",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Copying,
    Complete,
    Streaming,
    Failed,
}

/// External rendering seam: phase transitions, per-table state, copy
/// progress and errors go through here. Implementations must be cheap;
/// callbacks run on pipeline tasks.
pub trait ReportSink: Send + Sync {
    fn phase_changed(&self, _phase: Phase) {}
    fn table_state(&self, _table: &TableRef, _state: TableState) {}
    fn copy_progress(&self, _table: &TableRef, _rows: u64) {}
    fn error(&self, _message: &str) {}
}

pub struct NullSink;

impl ReportSink for NullSink {}

/// Schema extraction and application is an external collaborator: one opaque
/// dump-and-apply that completes before the snapshot copy begins.
#[async_trait::async_trait]
pub trait SchemaSync: Send + Sync {
    async fn dump_and_apply(&self) -> anyhow::Result<()>;
}

pub struct Pipeline {
    conf: PgShiftConf,
    sink: Arc<dyn ReportSink>,
    schema: Option<Arc<dyn SchemaSync>>,
    cancel: CancellationToken,
    phase: Mutex<Phase>,
    /// Highest commit LSN applied on the destination; written by the applier.
    applied: Arc<AtomicU64>,
    /// Highest applied LSN reported back to the source; written on apply
    /// callbacks, read by the decoder's status ticks.
    confirmed: Arc<AtomicU64>,
    /// Latest server position observed by the decoder.
    received: Arc<AtomicU64>,
    coordinator: Mutex<Option<Arc<SentinelCoordinator>>>,
}

impl Pipeline {
    pub fn new(conf: PgShiftConf, sink: Arc<dyn ReportSink>) -> Self {
        Pipeline {
            conf,
            sink,
            schema: None,
            cancel: CancellationToken::new(),
            phase: Mutex::new(Phase::Idle),
            applied: Arc::new(AtomicU64::new(0)),
            confirmed: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
            coordinator: Mutex::new(None),
        }
    }

    pub fn with_schema_sync(mut self, schema: Arc<dyn SchemaSync>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Cancelling this token winds the pipeline down: the decoder stops, the
    /// applier finishes the buffered tail, open work is rolled back.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn last_applied_lsn(&self) -> Lsn {
        Lsn(self.applied.load(Ordering::Acquire))
    }

    pub fn last_confirmed_lsn(&self) -> Lsn {
        Lsn(self.confirmed.load(Ordering::Acquire))
    }

    /// Byte distance between the latest observed server position and the
    /// applied position.
    pub fn lag_bytes(&self) -> u64 {
        messages::lag(
            self.last_applied_lsn(),
            Lsn(self.received.load(Ordering::Acquire)),
        )
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
        MIGRATION_PHASE.set(phase as i64);
        self.sink.phase_changed(phase);
        info!(%phase, "phase transition");
    }

    /// Copy everything as of the slot's snapshot, replay the emitted tail
    /// without applying, and finish. Publication and slot are left behind
    /// for a later follow run.
    pub async fn run_clone(&self) -> Result<(), PipelineError> {
        self.conf.validate()?;
        self.set_phase(Phase::Connecting);
        let source = self.connect_control(&self.conf.source, "source").await?;
        self.ensure_publication(&source).await?;
        self.sync_schema().await?;
        let mut decoder = self.new_decoder().await?;
        let slot = decoder.create_slot(None).await?;
        let tables = Copier::list_tables(&source)
            .await
            .map_err(PipelineError::SourceQuery)?;
        self.copy_phase(tables, slot.snapshot_name).await?;
        // Clone-only: bring the stream up, then immediately wind it down and
        // drain whatever was already emitted, applying nothing.
        let mut stream = decoder.start_streaming().await?;
        decoder.close().await;
        while stream.recv().await.is_some() {}
        self.set_phase(Phase::Done);
        Ok(())
    }

    /// Full migration: snapshot copy bound to the slot's consistent point,
    /// then continuous replay until cancelled.
    pub async fn run_clone_and_follow(&self) -> Result<(), PipelineError> {
        self.conf.validate()?;
        self.set_phase(Phase::Connecting);
        let source = self.connect_control(&self.conf.source, "source").await?;
        self.ensure_publication(&source).await?;
        self.sync_schema().await?;
        let mut decoder = self.new_decoder().await?;
        let slot = decoder.create_slot(None).await?;
        let tables = Copier::list_tables(&source)
            .await
            .map_err(PipelineError::SourceQuery)?;
        self.copy_phase(tables.clone(), slot.snapshot_name).await?;
        self.set_phase(Phase::Streaming);
        for table in &tables {
            self.sink.table_state(&table.table, TableState::Streaming);
        }
        self.stream_and_apply(decoder).await
    }

    /// Replay only, from an explicit position. The slot must already exist
    /// on the source.
    pub async fn run_follow(&self, start_lsn: Lsn) -> Result<(), PipelineError> {
        self.conf.validate()?;
        self.set_phase(Phase::Connecting);
        let mut decoder = self.new_decoder().await?;
        decoder.create_slot(Some(start_lsn)).await?;
        self.set_phase(Phase::Streaming);
        self.stream_and_apply(decoder).await
    }

    /// Pick up an interrupted migration: tables whose destination row count
    /// is strictly below the source estimate are truncated and re-copied
    /// (against the source's current state; the slot's exported snapshot
    /// died with the transaction that created it), then streaming resumes
    /// from the slot's resume position.
    pub async fn run_resume_clone_and_follow(&self) -> Result<(), PipelineError> {
        self.conf.validate()?;
        self.set_phase(Phase::Connecting);
        let source = self.connect_control(&self.conf.source, "source").await?;
        let slot = self.introspect_slot(&source).await?;
        let resume_lsn = slot.restart_lsn.max(slot.confirmed_flush_lsn);
        let dest = self.connect_control(&self.conf.dest, "destination").await?;
        let tables = Copier::list_tables(&source)
            .await
            .map_err(PipelineError::SourceQuery)?;
        let mut incomplete = Vec::new();
        for table in tables.iter() {
            let have = Copier::destination_row_count(&dest, &table.table)
                .await
                .map_err(PipelineError::DestQuery)?;
            if table_incomplete(have, table.estimated_rows) {
                info!(
                    table = %table.table,
                    have,
                    want = table.estimated_rows,
                    "table incomplete, truncating for re-copy"
                );
                Copier::truncate(&dest, &table.table)
                    .await
                    .map_err(PipelineError::DestQuery)?;
                incomplete.push(table.clone());
            } else {
                self.sink.table_state(&table.table, TableState::Complete);
            }
        }
        if !incomplete.is_empty() {
            self.copy_phase(incomplete, None).await?;
        }
        let mut decoder = self.new_decoder().await?;
        decoder.create_slot(Some(resume_lsn)).await?;
        self.set_phase(Phase::Streaming);
        for table in &tables {
            self.sink.table_state(&table.table, TableState::Streaming);
        }
        self.stream_and_apply(decoder).await
    }

    /// Prove catch-up: inject a sentinel behind everything currently in
    /// flight and wait for the applier to observe it. Must be called while
    /// streaming (from another task; the streaming run method is blocked
    /// driving the pipeline).
    pub async fn run_switchover(&self, deadline: Duration) -> Result<(), PipelineError> {
        if self.phase() != Phase::Streaming {
            return Err(PipelineError::NotStreaming);
        }
        let Some(coordinator) = self.coordinator.lock().clone() else {
            return Err(PipelineError::NotStreaming);
        };
        self.set_phase(Phase::Switchover);
        let injected_at = Instant::now();
        let current = self.last_applied_lsn();
        let ticket = match coordinator.initiate(current).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.set_phase(Phase::Streaming);
                return Err(e.into());
            }
        };
        match coordinator.wait_for_confirmation(&ticket, deadline).await {
            Ok(()) => {
                SENTINEL_ROUNDTRIP_SECONDS.observe(injected_at.elapsed().as_secs_f64());
                self.set_phase(Phase::SwitchoverComplete);
                info!(%current, "switchover confirmed, destination has caught up");
                Ok(())
            }
            Err(crate::error::SentinelError::Timeout(_)) => {
                self.set_phase(Phase::Streaming);
                Err(PipelineError::SwitchoverTimeout(deadline))
            }
            Err(e) => {
                self.set_phase(Phase::Streaming);
                Err(e.into())
            }
        }
    }

    /// Operator-invoked cleanup. Slots pin WAL retention on the source;
    /// dropping one is deliberate and never automatic.
    pub async fn drop_slot(&self) -> Result<(), PipelineError> {
        let mut pg_conf = self.conf.source.pg_config();
        pg_conf.replication_mode(ReplicationMode::Logical);
        let (client, connection) =
            tokio::time::timeout(self.conf.connect_timeout, pg_conf.connect(NoTls))
                .await
                .map_err(|_| PipelineError::ConnectTimeout("source replication connection"))?
                .map_err(|cause| PipelineError::Connect {
                    side: "source",
                    cause,
                })?;
        let conn_task = tokio::spawn(async move {
            let _ = connection.await;
        });
        client
            .simple_query(&format!(
                "DROP_REPLICATION_SLOT {}",
                quote_ident(&self.conf.slot_name)
            ))
            .await
            .map_err(PipelineError::SourceQuery)?;
        info!(slot = %self.conf.slot_name, "dropped replication slot");
        drop(client);
        conn_task.abort();
        Ok(())
    }

    async fn sync_schema(&self) -> Result<(), PipelineError> {
        self.set_phase(Phase::Schema);
        if let Some(schema) = &self.schema {
            schema.dump_and_apply().await.map_err(PipelineError::Other)?;
        }
        Ok(())
    }

    async fn copy_phase(
        &self,
        tables: Vec<TableDesc>,
        snapshot_name: Option<String>,
    ) -> Result<(), PipelineError> {
        self.set_phase(Phase::Copy);
        let copier = Copier::new(
            self.conf.source.clone(),
            self.conf.dest.clone(),
            self.conf.snapshot_workers,
            self.cancel.child_token(),
        );
        let sink = self.sink.clone();
        let progress: ProgressFn = Arc::new(move |table, event, rows| match event {
            CopyEvent::Started => sink.table_state(table, TableState::Copying),
            CopyEvent::Progress => sink.copy_progress(table, rows),
            CopyEvent::Done => sink.table_state(table, TableState::Complete),
        });
        let results = copier.copy_all(tables, snapshot_name, progress).await;
        for result in results {
            if let Some(error) = result.error {
                // The first copy failure aborts the migration.
                self.sink.table_state(&result.table, TableState::Failed);
                self.sink.error(&error.to_string());
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Drive decoder → (filter) → merge(sentinels) → applier until cancelled
    /// or retries are exhausted. Both decoder failures and apply failures
    /// take the reconnect path: replay from the last applied LSN redoes any
    /// partially applied transaction from its Begin.
    async fn stream_and_apply(&self, initial: WalDecoder) -> Result<(), PipelineError> {
        let (sentinel_tx, sentinel_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let coordinator = Arc::new(SentinelCoordinator::new(sentinel_tx));
        *self.coordinator.lock() = Some(coordinator.clone());

        let mut applier = self.new_applier().await?;
        let mut retry = RetryState::new(self.last_applied_lsn());
        let mut decoder = Some(initial);
        let mut sentinel_rx = sentinel_rx;

        loop {
            if let Some(mut live) = decoder.take() {
                match live.start_streaming().await {
                    Ok(decoder_rx) => {
                        let decoder_rx = if self.conf.origin_id.is_empty() {
                            decoder_rx
                        } else {
                            filter::spawn(self.conf.origin_id.clone(), decoder_rx)
                        };
                        let (apply_tx, apply_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
                        let merge = tokio::spawn(merge_streams(decoder_rx, sentinel_rx, apply_tx));

                        let confirmed = self.confirmed.clone();
                        let received = self.received.clone();
                        let coord = coordinator.clone();
                        let apply_result = applier
                            .run(
                                apply_rx,
                                move |lsn| {
                                    confirmed.fetch_max(lsn.0, Ordering::AcqRel);
                                    let lag =
                                        messages::lag(lsn, Lsn(received.load(Ordering::Acquire)));
                                    REPLICATION_LAG_BYTES.set(lag as i64);
                                },
                                move |id| coord.confirm(id),
                            )
                            .await;

                        // Wind the decoder down before collecting the merge
                        // task: with the applier gone, the merge only
                        // unblocks once its decoder input ends.
                        live.close().await;
                        if let Some(e) = live.last_error() {
                            warn!("decoder stopped: {e}");
                            self.sink.error(&e.to_string());
                        }
                        sentinel_rx = match merge.await {
                            Ok(rx) => rx,
                            Err(e) => {
                                applier.close().await;
                                return Err(anyhow::anyhow!("merge task panicked: {e}").into());
                            }
                        };

                        if let Err(e) = apply_result {
                            warn!("apply failed: {e}");
                            self.sink.error(&e.to_string());
                            applier.abort().await;
                        }
                    }
                    Err(e) => {
                        warn!("failed to start streaming: {e}");
                        self.sink.error(&e.to_string());
                        live.close().await;
                    }
                }
            }

            if self.cancel.is_cancelled() {
                applier.close().await;
                return Ok(());
            }

            let applied = self.last_applied_lsn();
            let Some(delay) = retry.next_delay(applied) else {
                applier.close().await;
                return Err(PipelineError::RetriesExhausted(retry.watermark()));
            };
            DECODER_RECONNECTS.inc();
            warn!(
                attempt = retry.attempts(),
                ?delay,
                %applied,
                "reconnecting replication stream"
            );
            if sleep_or_cancel(delay, &self.cancel).await.is_break() {
                applier.close().await;
                return Ok(());
            }
            // A failed reconnect leaves `decoder` empty; the next iteration
            // falls straight back into the retry accounting above.
            match self.new_decoder().await {
                Ok(mut fresh) => match fresh.create_slot(Some(applied)).await {
                    Ok(_) => decoder = Some(fresh),
                    Err(e) => {
                        warn!("resume setup failed: {e}");
                        fresh.close().await;
                    }
                },
                Err(e) => warn!("replication reconnect failed: {e}"),
            }
        }
    }

    async fn ensure_publication(&self, source: &Client) -> Result<(), PipelineError> {
        let exists: bool = source
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&self.conf.publication],
            )
            .await
            .map_err(PipelineError::SourceQuery)?
            .get(0);
        if !exists {
            source
                .batch_execute(&format!(
                    "CREATE PUBLICATION {} FOR ALL TABLES",
                    quote_ident(&self.conf.publication)
                ))
                .await
                .map_err(PipelineError::SourceQuery)?;
            info!(publication = %self.conf.publication, "created publication");
        }
        Ok(())
    }

    async fn introspect_slot(&self, source: &Client) -> Result<SlotStatus, PipelineError> {
        let row = source
            .query_opt(
                "SELECT restart_lsn::text, confirmed_flush_lsn::text, active \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.conf.slot_name],
            )
            .await
            .map_err(PipelineError::SourceQuery)?
            .ok_or_else(|| PipelineError::SlotNotFound(self.conf.slot_name.clone()))?;
        if row.get::<_, bool>(2) {
            return Err(PipelineError::SlotActive(self.conf.slot_name.clone()));
        }
        let parse = |value: Option<String>| {
            value
                .as_deref()
                .and_then(|text| text.parse::<Lsn>().ok())
                .unwrap_or(Lsn::INVALID)
        };
        Ok(SlotStatus {
            restart_lsn: parse(row.get(0)),
            confirmed_flush_lsn: parse(row.get(1)),
        })
    }

    async fn connect_control(
        &self,
        endpoint: &EndpointConf,
        side: &'static str,
    ) -> Result<Client, PipelineError> {
        let (client, connection) =
            tokio::time::timeout(self.conf.connect_timeout, endpoint.pg_config().connect(NoTls))
                .await
                .map_err(|_| PipelineError::ConnectTimeout(side))?
                .map_err(|cause| PipelineError::Connect { side, cause })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("{side} connection closed: {e}");
            }
        });
        Ok(client)
    }

    async fn new_decoder(&self) -> Result<WalDecoder, PipelineError> {
        let conf = DecoderConf {
            slot_name: self.conf.slot_name.clone(),
            publication: self.conf.publication.clone(),
            output_plugin: self.conf.output_plugin.clone(),
            status_interval: self.conf.status_interval,
        };
        let decoder = tokio::time::timeout(
            self.conf.connect_timeout,
            WalDecoder::connect(
                conf,
                &self.conf.source,
                self.confirmed.clone(),
                self.received.clone(),
                self.cancel.child_token(),
            ),
        )
        .await
        .map_err(|_| PipelineError::ConnectTimeout("source replication connection"))?
        .map_err(PipelineError::Decoder)?;
        let identity = decoder.identify_system().await?;
        debug!(
            systemid = %identity.systemid,
            timeline = identity.timeline,
            xlogpos = %identity.xlogpos,
            "source identified"
        );
        Ok(decoder)
    }

    async fn new_applier(&self) -> Result<Applier, PipelineError> {
        tokio::time::timeout(
            self.conf.connect_timeout,
            Applier::connect(&self.conf.dest, &self.conf.apply_origin, self.applied.clone()),
        )
        .await
        .map_err(|_| PipelineError::ConnectTimeout("destination"))?
        .map_err(PipelineError::Apply)
    }
}

struct SlotStatus {
    restart_lsn: Lsn,
    confirmed_flush_lsn: Lsn,
}

/// A table is incomplete when the destination holds strictly fewer rows than
/// the source's estimate. Estimates are fuzzy in both directions; strictly-
/// below keeps complete tables untouched when stats overshoot slightly.
fn table_incomplete(destination_rows: i64, source_estimate: i64) -> bool {
    destination_rows < source_estimate
}

/// Reconnect bookkeeping: consecutive attempts count against a watermark and
/// reset to one as soon as the applied position moves past it.
struct RetryState {
    attempts: u32,
    watermark: Lsn,
}

impl RetryState {
    fn new(watermark: Lsn) -> Self {
        RetryState {
            attempts: 0,
            watermark,
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn watermark(&self) -> Lsn {
        self.watermark
    }

    /// Delay before the next attempt, or None when retries are exhausted
    /// without watermark progress.
    fn next_delay(&mut self, applied: Lsn) -> Option<Duration> {
        if applied > self.watermark {
            self.watermark = applied;
            self.attempts = 1;
        } else {
            self.attempts += 1;
            if self.attempts > MAX_RETRIES_PER_WATERMARK {
                return None;
            }
        }
        Some(backoff::exponential_backoff(
            self.attempts,
            RETRY_INITIAL_DELAY,
            RETRY_MAX_DELAY,
        ))
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> ControlFlow<()> {
    tokio::select! {
        _ = cancel.cancelled() => ControlFlow::Break(()),
        _ = tokio::time::sleep(delay) => ControlFlow::Continue(()),
    }
}

/// Forward both producers into the applier's channel. Sentinels interleave
/// in injection order, decoder output preserves source order. When the
/// decoder ends (shutdown or connection loss), pending sentinels are flushed
/// before the output closes so no waiter is stranded across a retry cycle;
/// the sentinel receiver is handed back for the next cycle.
async fn merge_streams(
    mut decoder_rx: mpsc::Receiver<PipelineMessage>,
    mut sentinel_rx: mpsc::Receiver<PipelineMessage>,
    out: mpsc::Sender<PipelineMessage>,
) -> mpsc::Receiver<PipelineMessage> {
    loop {
        tokio::select! {
            message = decoder_rx.recv() => match message {
                Some(message) => {
                    if out.send(message).await.is_err() {
                        return sentinel_rx;
                    }
                }
                None => break,
            },
            sentinel = sentinel_rx.recv() => match sentinel {
                Some(sentinel) => {
                    if out.send(sentinel).await.is_err() {
                        return sentinel_rx;
                    }
                }
                // The coordinator half lives as long as the pipeline; None
                // means the pipeline itself is going away.
                None => break,
            },
        }
    }
    while let Ok(sentinel) = sentinel_rx.try_recv() {
        if out.send(sentinel).await.is_err() {
            break;
        }
    }
    sentinel_rx
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn retry_schedule_doubles_to_cap_then_exhausts() {
        let mut retry = RetryState::new(Lsn(0));
        let delays: Vec<Option<u64>> = (0..6)
            .map(|_| retry.next_delay(Lsn(0)).map(|d| d.as_secs()))
            .collect();
        assert_eq!(
            delays,
            vec![Some(2), Some(4), Some(8), Some(16), Some(30), None]
        );
    }

    #[test]
    fn retry_resets_on_watermark_progress() {
        let mut retry = RetryState::new(Lsn(100));
        assert_eq!(retry.next_delay(Lsn(100)), Some(Duration::from_secs(2)));
        assert_eq!(retry.next_delay(Lsn(100)), Some(Duration::from_secs(4)));
        // applied LSN moved past the watermark: back to the initial delay
        assert_eq!(retry.next_delay(Lsn(200)), Some(Duration::from_secs(2)));
        assert_eq!(retry.watermark(), Lsn(200));
        assert_eq!(retry.next_delay(Lsn(200)), Some(Duration::from_secs(4)));
    }

    #[test]
    fn incomplete_is_strictly_below_estimate() {
        assert!(table_incomplete(0, 1));
        assert!(table_incomplete(99, 100));
        assert!(!table_incomplete(100, 100));
        // stats may undershoot reality; equal-or-above stays untouched
        assert!(!table_incomplete(120, 100));
        assert!(!table_incomplete(5, 0));
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Idle.as_str(), "idle");
        assert_eq!(Phase::SwitchoverComplete.as_str(), "switchover-complete");
        assert!(Phase::Copy < Phase::Streaming);
        assert!(Phase::Streaming < Phase::Done);
    }

    fn sentinel(id: &str) -> PipelineMessage {
        PipelineMessage::Sentinel {
            id: id.to_string(),
            injected_at_lsn: Lsn(1),
            injected_at: SystemTime::now(),
        }
    }

    fn commit(lsn: u64) -> PipelineMessage {
        PipelineMessage::Commit {
            commit_lsn: Lsn(lsn),
            end_lsn: Lsn(lsn),
            commit_time: 0,
        }
    }

    #[tokio::test]
    async fn merge_preserves_decoder_order() {
        let (decoder_tx, decoder_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (_sentinel_tx, sentinel_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let merge = tokio::spawn(merge_streams(decoder_rx, sentinel_rx, out_tx));

        for lsn in [10, 20, 30] {
            decoder_tx.send(commit(lsn)).await.unwrap();
        }
        drop(decoder_tx);

        let mut seen = Vec::new();
        while let Some(message) = out_rx.recv().await {
            if let PipelineMessage::Commit { commit_lsn, .. } = message {
                seen.push(commit_lsn.0);
            }
        }
        assert_eq!(seen, vec![10, 20, 30]);
        merge.await.unwrap();
    }

    #[tokio::test]
    async fn merge_flushes_pending_sentinels_when_decoder_ends() {
        let (decoder_tx, decoder_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (sentinel_tx, sentinel_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);

        // The sentinel is already queued when the decoder goes away.
        sentinel_tx.send(sentinel("s-1")).await.unwrap();
        drop(decoder_tx);
        let merge = tokio::spawn(merge_streams(decoder_rx, sentinel_rx, out_tx));

        let mut sentinels = Vec::new();
        while let Some(message) = out_rx.recv().await {
            if let PipelineMessage::Sentinel { id, .. } = message {
                sentinels.push(id);
            }
        }
        assert_eq!(sentinels, vec!["s-1".to_string()]);

        // The receiver comes back usable for the next retry cycle.
        let mut sentinel_rx = merge.await.unwrap();
        sentinel_tx.send(sentinel("s-2")).await.unwrap();
        match sentinel_rx.recv().await.unwrap() {
            PipelineMessage::Sentinel { id, .. } => assert_eq!(id, "s-2"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn merge_interleaves_sentinels_in_injection_order() {
        let (decoder_tx, decoder_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (sentinel_tx, sentinel_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let merge = tokio::spawn(merge_streams(decoder_rx, sentinel_rx, out_tx));

        sentinel_tx.send(sentinel("a")).await.unwrap();
        sentinel_tx.send(sentinel("b")).await.unwrap();
        drop(decoder_tx);

        let mut order = Vec::new();
        while let Some(message) = out_rx.recv().await {
            if let PipelineMessage::Sentinel { id, .. } = message {
                order.push(id);
            }
        }
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
        merge.await.unwrap();
    }
}
