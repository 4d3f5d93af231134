//! Origin filter for bidirectional pairs. An A→B pipeline running next to a
//! B→A pipeline would replay its own writes in a loop; dropping changes
//! tagged with the configured origin breaks the cycle. Stateless.

use tokio::sync::mpsc;
use tracing::*;

use crate::messages::{PipelineMessage, PIPELINE_CHANNEL_CAPACITY};
use crate::metrics::FILTERED_CHANGES;

/// An empty configured origin never matches anything, including changes that
/// carry no origin tag themselves.
pub fn should_drop(configured_origin: &str, message: &PipelineMessage) -> bool {
    if configured_origin.is_empty() {
        return false;
    }
    match message {
        PipelineMessage::Change(change) => change.origin == configured_origin,
        PipelineMessage::Truncate { origin, .. } => origin == configured_origin,
        _ => false,
    }
}

/// Derive a filtered sequence from `input`. Output capacity matches input.
pub fn spawn(
    configured_origin: String,
    mut input: mpsc::Receiver<PipelineMessage>,
) -> mpsc::Receiver<PipelineMessage> {
    let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = input.recv().await {
            if should_drop(&configured_origin, &message) {
                FILTERED_CHANGES.inc();
                trace!(origin = %configured_origin, "dropped self-originated change");
                continue;
            }
            if tx.send(message).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use utils::lsn::Lsn;

    use super::*;
    use crate::messages::{Change, ChangeKind};

    fn change_with_origin(origin: &str) -> PipelineMessage {
        PipelineMessage::Change(Change {
            kind: ChangeKind::Insert,
            relation_id: 16384,
            old_tuple: None,
            new_tuple: Some(vec![]),
            wal_lsn: Lsn(1),
            received_at: SystemTime::now(),
            origin: origin.to_string(),
        })
    }

    #[test]
    fn drops_matching_origin_only() {
        assert!(should_drop("tag-a", &change_with_origin("tag-a")));
        assert!(!should_drop("tag-a", &change_with_origin("tag-b")));
        assert!(!should_drop("tag-a", &change_with_origin("")));
    }

    #[test]
    fn empty_configured_origin_disables_filtering() {
        // An untagged emission must survive a disabled filter.
        assert!(!should_drop("", &change_with_origin("")));
        assert!(!should_drop("", &change_with_origin("tag-a")));
    }

    #[test]
    fn transaction_control_messages_always_pass() {
        let begin = PipelineMessage::Begin {
            xid: 1,
            final_lsn: Lsn(10),
            commit_time: 0,
        };
        assert!(!should_drop("tag-a", &begin));
    }

    #[tokio::test]
    async fn forwards_everything_but_matches() {
        let (tx, input) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let mut output = spawn("tag-a".to_string(), input);
        tx.send(change_with_origin("tag-a")).await.unwrap();
        tx.send(change_with_origin("tag-b")).await.unwrap();
        tx.send(change_with_origin("")).await.unwrap();
        drop(tx);
        let mut survivors = Vec::new();
        while let Some(message) = output.recv().await {
            if let PipelineMessage::Change(change) = message {
                survivors.push(change.origin);
            }
        }
        assert_eq!(survivors, vec!["tag-b".to_string(), String::new()]);
    }
}
