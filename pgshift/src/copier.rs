//! Parallel snapshot copier. Reproduces the source's data content as of an
//! exported snapshot into the destination with streaming COPY, so that the
//! subsequent WAL replay starts without gaps or duplicates.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, TryStreamExt};
use parking_lot::Mutex;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::config::EndpointConf;
use crate::error::CopyError;
use crate::metrics::{COPIED_ROWS, COPIED_TABLES};
use crate::sql::qualified_name;

/// Progress callbacks are throttled to roughly this cadence per table.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Row and byte figures are planner estimates, used only for scheduling and
/// progress reporting.
#[derive(Debug, Clone)]
pub struct TableDesc {
    pub table: TableRef,
    pub estimated_rows: i64,
    pub estimated_bytes: i64,
}

#[derive(Debug)]
pub struct CopyResult {
    pub table: TableRef,
    pub rows_copied: i64,
    pub error: Option<CopyError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEvent {
    Started,
    Progress,
    Done,
}

pub type ProgressFn = Arc<dyn Fn(&TableRef, CopyEvent, u64) + Send + Sync>;

pub struct Copier {
    source: EndpointConf,
    dest: EndpointConf,
    workers: usize,
    cancel: CancellationToken,
}

impl Copier {
    pub fn new(
        source: EndpointConf,
        dest: EndpointConf,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Copier {
            source,
            dest,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Enumerate user tables, largest first, so the biggest copies start
    /// immediately and workers naturally pack the tail.
    pub async fn list_tables(client: &Client) -> Result<Vec<TableDesc>, tokio_postgres::Error> {
        let rows = client
            .query(
                "SELECT s.schemaname, s.relname, s.n_live_tup::bigint, \
                        c.reltuples::bigint, pg_table_size(c.oid)::bigint \
                 FROM pg_stat_user_tables s \
                 JOIN pg_class c ON c.oid = s.relid \
                 ORDER BY pg_table_size(c.oid) DESC",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let live_tuples: i64 = row.get(2);
                let planner_estimate: i64 = row.get(3);
                TableDesc {
                    table: TableRef {
                        namespace: row.get(0),
                        name: row.get(1),
                    },
                    // Live-tuple stats are zero on a freshly loaded source
                    // until autovacuum has run; the planner estimate is the
                    // fallback.
                    estimated_rows: if live_tuples == 0 {
                        planner_estimate.max(0)
                    } else {
                        live_tuples
                    },
                    estimated_bytes: row.get(4),
                }
            })
            .collect())
    }

    /// Copy every listed table with a fixed pool of workers. With
    /// `snapshot_name` set, every worker transaction binds to that snapshot
    /// so all of them observe the identical point-in-time view. One failing
    /// table does not stop the others; each `CopyResult` carries its own
    /// error and the orchestrator decides.
    pub async fn copy_all(
        &self,
        tables: Vec<TableDesc>,
        snapshot_name: Option<String>,
        progress: ProgressFn,
    ) -> Vec<CopyResult> {
        let queue = Arc::new(Mutex::new(VecDeque::from(tables)));
        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let queue = queue.clone();
            let progress = progress.clone();
            let source = self.source.clone();
            let dest = self.dest.clone();
            let snapshot_name = snapshot_name.clone();
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                let mut results = Vec::new();
                loop {
                    // Drain check between tables; an in-flight table always
                    // finishes or fails on its own.
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(desc) = queue.lock().pop_front() else {
                        break;
                    };
                    let span = info_span!("copy", table = %desc.table, worker = worker_id);
                    let result =
                        copy_one_table(&source, &dest, &desc, snapshot_name.as_deref(), &progress)
                            .instrument(span)
                            .await;
                    results.push(match result {
                        Ok(rows_copied) => {
                            COPIED_TABLES.inc();
                            info!(table = %desc.table, rows_copied, "table copied");
                            CopyResult {
                                table: desc.table,
                                rows_copied,
                                error: None,
                            }
                        }
                        Err(cause) => {
                            warn!(table = %desc.table, "copy failed: {cause}");
                            CopyResult {
                                table: desc.table.clone(),
                                rows_copied: 0,
                                error: Some(CopyError {
                                    table: desc.table.to_string(),
                                    cause,
                                }),
                            }
                        }
                    });
                }
                results
            }));
        }
        let mut results = Vec::new();
        for worker in workers {
            match worker.await {
                Ok(worker_results) => results.extend(worker_results),
                Err(e) => warn!("copy worker panicked: {e}"),
            }
        }
        results
    }

    /// Row count on the destination; resume logic compares it with the
    /// source estimate to find interrupted tables.
    pub async fn destination_row_count(
        client: &Client,
        table: &TableRef,
    ) -> Result<i64, tokio_postgres::Error> {
        let query = format!(
            "SELECT count(*) FROM {}",
            qualified_name(&table.namespace, &table.name)
        );
        Ok(client.query_one(query.as_str(), &[]).await?.get(0))
    }

    pub async fn truncate(client: &Client, table: &TableRef) -> Result<(), tokio_postgres::Error> {
        let query = format!(
            "TRUNCATE TABLE {}",
            qualified_name(&table.namespace, &table.name)
        );
        client.batch_execute(&query).await
    }
}

/// Copy one table through a dedicated pair of connections, streaming chunks
/// from the source's COPY TO into the destination's COPY FROM without ever
/// buffering the table.
async fn copy_one_table(
    source: &EndpointConf,
    dest: &EndpointConf,
    desc: &TableDesc,
    snapshot_name: Option<&str>,
    progress: &ProgressFn,
) -> Result<i64, tokio_postgres::Error> {
    let (src, src_connection) = source.pg_config().connect(NoTls).await?;
    let src_conn_task = tokio::spawn(async move {
        let _ = src_connection.await;
    });
    let (dst, dst_connection) = dest.pg_config().connect(NoTls).await?;
    let dst_conn_task = tokio::spawn(async move {
        let _ = dst_connection.await;
    });
    // Bulk-loaded rows must not fire triggers or foreign-key checks; tables
    // are copied in size order, not dependency order.
    dst.batch_execute("SET session_replication_role = replica")
        .await?;

    src.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    if let Some(name) = snapshot_name {
        // Bind to the slot's exported snapshot: the read must observe the
        // database exactly as of the consistent point the stream starts at.
        let bind = format!("SET TRANSACTION SNAPSHOT '{}'", name.replace('\'', "''"));
        src.batch_execute(&bind).await?;
    }

    let target = qualified_name(&desc.table.namespace, &desc.table.name);
    let out = src.copy_out(format!("COPY {target} TO STDOUT").as_str()).await?;
    let sink = dst.copy_in(format!("COPY {target} FROM STDIN").as_str()).await?;
    futures::pin_mut!(out);
    futures::pin_mut!(sink);

    progress(&desc.table, CopyEvent::Started, 0);
    let mut rows_seen: u64 = 0;
    let mut last_report = Instant::now();
    while let Some(chunk) = out.try_next().await? {
        // COPY text format ends each row with a bare newline; newlines
        // inside values arrive escaped.
        rows_seen += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        sink.send(chunk).await?;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            progress(&desc.table, CopyEvent::Progress, rows_seen);
        }
    }
    let rows_copied = sink.finish().await?;
    src.batch_execute("COMMIT").await?;
    progress(&desc.table, CopyEvent::Done, rows_copied);
    COPIED_ROWS.inc_by(rows_copied);

    drop(src);
    drop(dst);
    src_conn_task.abort();
    dst_conn_task.abort();
    Ok(rows_copied as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_display() {
        let table = TableRef {
            namespace: "public".to_string(),
            name: "accounts".to_string(),
        };
        assert_eq!(table.to_string(), "public.accounts");
    }

    #[test]
    fn worker_count_has_a_floor() {
        let conf = crate::config::PgShiftConf::dummy();
        let copier = Copier::new(
            conf.source.clone(),
            conf.dest.clone(),
            0,
            CancellationToken::new(),
        );
        assert_eq!(copier.workers, 1);
    }
}
