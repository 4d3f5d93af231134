//! In-band sentinel markers. A sentinel travels through the same FIFO
//! channel as the WAL messages, so observing it at the applier proves that
//! every transaction enqueued before its injection has been applied. The
//! coordinator deliberately verifies no LSN on confirmation; channel order
//! is the guarantee.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::*;
use utils::lsn::Lsn;

use crate::error::SentinelError;
use crate::messages::PipelineMessage;

pub struct SentinelCoordinator {
    injector: mpsc::Sender<PipelineMessage>,
    /// One-shot confirmation signals keyed by ticket id. `confirm` is the
    /// hot path; `initiate` the rare one.
    waiters: Mutex<HashMap<String, oneshot::Sender<()>>>,
    tickets: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl SentinelCoordinator {
    pub fn new(injector: mpsc::Sender<PipelineMessage>) -> Self {
        SentinelCoordinator {
            injector,
            waiters: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh ticket and inject its sentinel into the pipeline
    /// channel. On send failure (channel closed, shutdown) the registration
    /// is removed and the error surfaces.
    pub async fn initiate(&self, current_lsn: Lsn) -> Result<String, SentinelError> {
        let id = format!("pgshift-{}", uuid::Uuid::new_v4());
        let (confirm_tx, confirm_rx) = oneshot::channel();
        self.waiters.lock().insert(id.clone(), confirm_tx);
        self.tickets.lock().insert(id.clone(), confirm_rx);
        let message = PipelineMessage::Sentinel {
            id: id.clone(),
            injected_at_lsn: current_lsn,
            injected_at: SystemTime::now(),
        };
        if self.injector.send(message).await.is_err() {
            self.waiters.lock().remove(&id);
            self.tickets.lock().remove(&id);
            return Err(SentinelError::ChannelClosed);
        }
        debug!(%id, %current_lsn, "sentinel injected");
        Ok(id)
    }

    /// Block until the applier confirms the ticket or the deadline expires.
    /// Timing out removes the registration; an id that was never registered
    /// or already completed reports Unknown.
    pub async fn wait_for_confirmation(
        &self,
        id: &str,
        deadline: Duration,
    ) -> Result<(), SentinelError> {
        let Some(confirm_rx) = self.tickets.lock().remove(id) else {
            return Err(SentinelError::Unknown(id.to_string()));
        };
        match tokio::time::timeout(deadline, confirm_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SentinelError::Unknown(id.to_string())),
            Err(_) => {
                self.waiters.lock().remove(id);
                Err(SentinelError::Timeout(id.to_string()))
            }
        }
    }

    /// Applier-side confirmation. Signals the pending waiter and
    /// unregisters; unknown ids are a silent no-op (the waiter may have
    /// timed out already).
    pub fn confirm(&self, id: &str) {
        if let Some(confirm_tx) = self.waiters.lock().remove(id) {
            let _ = confirm_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PIPELINE_CHANNEL_CAPACITY;

    fn coordinator() -> (SentinelCoordinator, mpsc::Receiver<PipelineMessage>) {
        let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        (SentinelCoordinator::new(tx), rx)
    }

    #[tokio::test]
    async fn confirm_releases_waiter() {
        let (coordinator, mut rx) = coordinator();
        let id = coordinator.initiate(Lsn(100)).await.unwrap();
        match rx.recv().await.unwrap() {
            PipelineMessage::Sentinel {
                id: seen,
                injected_at_lsn,
                ..
            } => {
                assert_eq!(seen, id);
                assert_eq!(injected_at_lsn, Lsn(100));
            }
            other => panic!("unexpected message {other:?}"),
        }
        coordinator.confirm(&id);
        coordinator
            .wait_for_confirmation(&id, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timeout_unregisters_ticket() {
        let (coordinator, _rx) = coordinator();
        let id = coordinator.initiate(Lsn(1)).await.unwrap();
        let err = coordinator
            .wait_for_confirmation(&id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, SentinelError::Timeout(id.clone()));
        // late confirmation is a no-op, and the ticket is gone
        coordinator.confirm(&id);
        let err = coordinator
            .wait_for_confirmation(&id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, SentinelError::Unknown(id));
    }

    #[tokio::test]
    async fn unknown_ticket_is_reported() {
        let (coordinator, _rx) = coordinator();
        let err = coordinator
            .wait_for_confirmation("nope", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, SentinelError::Unknown("nope".to_string()));
    }

    #[tokio::test]
    async fn closed_channel_surfaces_and_unregisters() {
        let (coordinator, rx) = coordinator();
        drop(rx);
        let err = coordinator.initiate(Lsn(5)).await.unwrap_err();
        assert_eq!(err, SentinelError::ChannelClosed);
        assert!(coordinator.waiters.lock().is_empty());
        assert!(coordinator.tickets.lock().is_empty());
    }

    #[tokio::test]
    async fn ticket_ids_are_unique() {
        let (coordinator, _rx) = coordinator();
        let a = coordinator.initiate(Lsn(1)).await.unwrap();
        let b = coordinator.initiate(Lsn(1)).await.unwrap();
        assert_ne!(a, b);
    }
}
