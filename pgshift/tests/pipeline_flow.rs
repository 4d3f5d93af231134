//! Channel-level flow tests: sentinel catch-up ordering and origin
//! filtering through the public component APIs, with a scripted consumer
//! standing in for the destination-bound applier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use utils::lsn::Lsn;

use pgshift::filter;
use pgshift::messages::{Change, ChangeKind, PipelineMessage, PIPELINE_CHANNEL_CAPACITY};
use pgshift::sentinel::SentinelCoordinator;

// Run with RUST_LOG=pgshift=debug to see component logs from these tests.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn commit(lsn: u64) -> PipelineMessage {
    PipelineMessage::Commit {
        commit_lsn: Lsn(lsn),
        end_lsn: Lsn(lsn),
        commit_time: 0,
    }
}

fn change(origin: &str, lsn: u64) -> PipelineMessage {
    PipelineMessage::Change(Change {
        kind: ChangeKind::Insert,
        relation_id: 16384,
        old_tuple: None,
        new_tuple: Some(vec![]),
        wal_lsn: Lsn(lsn),
        received_at: SystemTime::now(),
        origin: origin.to_string(),
    })
}

// Observing a sentinel at the consumer proves every transaction enqueued
// before its injection has been applied: the channel is FIFO and the
// coordinator checks nothing else.
#[tokio::test]
async fn sentinel_confirms_only_after_prior_commits_are_applied() {
    init_logging();
    let (tx, mut rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
    let coordinator = Arc::new(SentinelCoordinator::new(tx.clone()));
    let applied = Arc::new(AtomicU64::new(0));

    let consumer = {
        let coordinator = coordinator.clone();
        let applied = applied.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                // per-transaction apply latency
                tokio::time::sleep(Duration::from_millis(5)).await;
                match message {
                    PipelineMessage::Commit { commit_lsn, .. } => {
                        applied.fetch_max(commit_lsn.0, Ordering::AcqRel);
                    }
                    PipelineMessage::Sentinel { id, .. } => coordinator.confirm(&id),
                    _ => {}
                }
            }
        })
    };

    for lsn in [10, 20, 30] {
        tx.send(commit(lsn)).await.unwrap();
    }
    let ticket = coordinator.initiate(Lsn(30)).await.unwrap();
    coordinator
        .wait_for_confirmation(&ticket, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(applied.load(Ordering::Acquire), 30);
    drop(consumer);
}

#[tokio::test]
async fn self_originated_changes_never_reach_the_consumer() {
    init_logging();
    let (decoder_tx, decoder_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
    let mut filtered = filter::spawn("tag-a".to_string(), decoder_rx);

    decoder_tx.send(change("tag-a", 10)).await.unwrap();
    decoder_tx.send(change("tag-b", 11)).await.unwrap();
    decoder_tx.send(commit(12)).await.unwrap();
    drop(decoder_tx);

    let mut seen = Vec::new();
    while let Some(message) = filtered.recv().await {
        seen.push(match message {
            PipelineMessage::Change(c) => format!("change:{}", c.origin),
            PipelineMessage::Commit { commit_lsn, .. } => format!("commit:{commit_lsn}"),
            other => panic!("unexpected message {other:?}"),
        });
    }
    assert_eq!(seen, ["change:tag-b", "commit:0/C"]);
}
