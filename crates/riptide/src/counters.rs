use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Monotonic session aggregates reported to the tracker.
///
/// The atomics are readable from anywhere, but every mutation flows through
/// a channel drained by a single reducer task, so updates cannot race.
#[derive(Debug)]
pub struct Counters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
    tx: mpsc::Sender<Delta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// Bytes served to a peer.
    Uploaded(u64),
    /// Bytes of a piece that passed verification.
    Downloaded(u64),
    /// Bytes no longer outstanding; subtracts from `left`.
    Left(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl Counters {
    /// Seeds `left` with the torrent's total length. The returned receiver
    /// must be handed to [`Counters::run`] on a dedicated task.
    pub fn new(total_length: u64) -> (Arc<Self>, mpsc::Receiver<Delta>) {
        let (tx, rx) = mpsc::channel(64);
        let counters = Arc::new(Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            left: AtomicU64::new(total_length),
            tx,
        });
        (counters, rx)
    }

    /// Queues a mutation for the reducer. Drops the delta if the session is
    /// shutting down and the reducer is gone.
    pub async fn record(&self, delta: Delta) {
        if self.tx.send(delta).await.is_err() {
            debug!(?delta, "counter reducer gone, delta dropped");
        }
    }

    /// The reducer: sole mutator of the three counters.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Delta>) {
        while let Some(delta) = rx.recv().await {
            match delta {
                Delta::Uploaded(n) => {
                    self.uploaded.fetch_add(n, Ordering::Relaxed);
                }
                Delta::Downloaded(n) => {
                    self.downloaded.fetch_add(n, Ordering::Relaxed);
                }
                Delta::Left(n) => {
                    let left = self.left.load(Ordering::Relaxed);
                    self.left.store(left.saturating_sub(n), Ordering::Relaxed);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
        }
    }
}
