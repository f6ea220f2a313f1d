//! Feeds a history store from manager events.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::ManagerEvent;

use super::HistoryStore;

/// Background task writing every [`ManagerEvent::Sample`] to a store.
pub struct HistoryRecorder {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl HistoryRecorder {
    /// Start recording. The task runs until [`HistoryRecorder::finish`] is
    /// called or the event channel closes.
    ///
    /// Insert failures and lagged receivers are logged and skipped.
    pub fn spawn(events: broadcast::Receiver<ManagerEvent>, store: Arc<dyn HistoryStore>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(record(events, store, stopped));
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Store whatever is still buffered, stop, and return the number of
    /// samples recorded.
    pub async fn finish(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            // Already gone if the channel closed first
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("History recorder failed: {e}");
                0
            }
        }
    }
}

async fn record(
    mut events: broadcast::Receiver<ManagerEvent>,
    store: Arc<dyn HistoryStore>,
    mut stopped: oneshot::Receiver<()>,
) -> u64 {
    let mut stored = 0u64;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => stored += store_sample(store.as_ref(), event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("History recorder fell behind, {skipped} events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut stopped => {
                loop {
                    match events.try_recv() {
                        Ok(event) => stored += store_sample(store.as_ref(), event),
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!("History recorder fell behind, {skipped} events skipped");
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
                break;
            }
        }
    }
    debug!("History recorder stopped after {stored} samples");
    stored
}

fn store_sample(store: &dyn HistoryStore, event: ManagerEvent) -> u64 {
    let ManagerEvent::Sample(sample) = event else {
        return 0;
    };
    match store.insert(&sample) {
        Ok(()) => 1,
        Err(e) => {
            warn!("Failed to record sample from {}: {e}", sample.device_id);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryHistory, TimeWindow};
    use phsense_core::types::{DeviceId, Sample};

    #[tokio::test]
    async fn test_records_only_samples() {
        let (tx, rx) = broadcast::channel(16);
        let store = Arc::new(MemoryHistory::new());
        let recorder = HistoryRecorder::spawn(rx, store.clone());

        tx.send(ManagerEvent::Connected(DeviceId::new("p1"))).unwrap();
        tx.send(ManagerEvent::Sample(Sample::new(DeviceId::new("p1"), 7.0, 10))).unwrap();
        tx.send(ManagerEvent::Sample(Sample::new(DeviceId::new("p1"), 7.2, 20))).unwrap();
        drop(tx);

        assert_eq!(recorder.finish().await, 2);
        let values: Vec<f32> = store
            .query(TimeWindow::new(0, 100))
            .unwrap()
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![7.0, 7.2]);
    }

    #[tokio::test]
    async fn test_finish_stores_buffered_samples() {
        let (tx, rx) = broadcast::channel(16);
        let store = Arc::new(MemoryHistory::new());
        let recorder = HistoryRecorder::spawn(rx, store.clone());

        for ts in 0..5 {
            tx.send(ManagerEvent::Sample(Sample::new(DeviceId::new("p1"), 7.0, ts))).unwrap();
        }

        // Sender still open, as the manager's is while the app shuts down
        assert_eq!(recorder.finish().await, 5);
        assert_eq!(store.len(), 5);
        drop(tx);
    }

    #[tokio::test]
    async fn test_lag_is_not_fatal() {
        let (tx, rx) = broadcast::channel(2);
        let store = Arc::new(MemoryHistory::new());

        // Overflow the channel before the recorder starts reading
        for ts in 0..5 {
            tx.send(ManagerEvent::Sample(Sample::new(DeviceId::new("p1"), 7.0, ts))).unwrap();
        }
        let recorder = HistoryRecorder::spawn(rx, store.clone());
        drop(tx);

        assert_eq!(recorder.finish().await, 2);
        assert_eq!(store.len(), 2);
    }
}
