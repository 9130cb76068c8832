//! Checkpoint tracking for the session in flight.
//!
//! The checkpoint mutex doubles as the write lock: a save holds it for the
//! whole store call, so ticks that find it taken are skipped while state
//! changes wait their turn.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::store::CheckpointStore;

/// Live counters copied into every checkpoint write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub elapsed: Duration,
    pub chunk_count: u64,
    pub paused: bool,
}

pub trait ProgressSource: Send + Sync {
    fn progress(&self) -> Progress;
}

/// Write access to the tracked checkpoint for tasks that run outside the
/// session's owner, such as source event pumps.
#[derive(Clone)]
pub struct CheckpointHandle {
    store: Arc<dyn CheckpointStore>,
    checkpoint: Arc<Mutex<Checkpoint>>,
    progress: Arc<dyn ProgressSource>,
}

impl CheckpointHandle {
    /// Forget referenced files that do not exist and persist right away.
    ///
    /// A source that died before creating its file must not make the next
    /// startup discard the files that do exist. Returns how many refs were
    /// dropped.
    pub async fn prune_missing(&self) -> usize {
        let mut guard = self.checkpoint.lock().await;
        let refs = std::mem::take(&mut guard.temp_file_refs);
        let before = refs.len();
        for path in refs {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                guard.temp_file_refs.push(path);
            } else {
                info!("Dropping {:?} from the checkpoint, it was never written", path);
            }
        }

        let removed = before - guard.temp_file_refs.len();
        if removed > 0 {
            persist(self.store.as_ref(), &mut guard, self.progress.progress()).await;
        }
        removed
    }
}

pub struct RecoverySession {
    store: Arc<dyn CheckpointStore>,
    checkpoint: Arc<Mutex<Checkpoint>>,
    progress: Arc<dyn ProgressSource>,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl RecoverySession {
    /// Persist the initial checkpoint and start the periodic writer.
    pub async fn begin(
        store: Arc<dyn CheckpointStore>,
        checkpoint: Checkpoint,
        interval: Duration,
        progress: Arc<dyn ProgressSource>,
    ) -> Self {
        let checkpoint = Arc::new(Mutex::new(checkpoint));
        {
            let mut guard = checkpoint.lock().await;
            persist(store.as_ref(), &mut guard, progress.progress()).await;
            info!("Recovery checkpoint created for session {}", guard.id);
        }

        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&store),
            Arc::clone(&checkpoint),
            Arc::clone(&progress),
            interval,
            cancel.clone(),
        ));

        Self {
            store,
            checkpoint,
            progress,
            cancel,
            ticker: Some(ticker),
        }
    }

    /// Write now; waits behind any write in flight.
    pub async fn record_state_change(&self) {
        let mut guard = self.checkpoint.lock().await;
        persist(self.store.as_ref(), &mut guard, self.progress.progress()).await;
    }

    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            store: Arc::clone(&self.store),
            checkpoint: Arc::clone(&self.checkpoint),
            progress: Arc::clone(&self.progress),
        }
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.checkpoint.lock().await.clone()
    }

    /// Stop the periodic writer and delete the checkpoint.
    pub async fn finish(mut self) {
        self.stop_ticker().await;
        let _guard = self.checkpoint.lock().await;
        match self.store.clear().await {
            Ok(()) => debug!("Recovery checkpoint cleared"),
            Err(e) => warn!("Failed to clear recovery checkpoint: {}", e),
        }
    }

    /// Stop the periodic writer and leave the checkpoint for the next start.
    pub async fn abandon(mut self) {
        self.stop_ticker().await;
        let mut guard = self.checkpoint.lock().await;
        persist(self.store.as_ref(), &mut guard, self.progress.progress()).await;
        info!("Recovery checkpoint kept for session {}", guard.id);
    }

    async fn stop_ticker(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
    }
}

impl Drop for RecoverySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn persist(store: &dyn CheckpointStore, checkpoint: &mut Checkpoint, progress: Progress) {
    checkpoint.duration_ms = progress.elapsed.as_millis() as u64;
    checkpoint.chunk_count = progress.chunk_count;
    checkpoint.paused = progress.paused;
    checkpoint.last_save_time = Utc::now();
    if let Err(e) = store.save(checkpoint).await {
        warn!("Failed to save recovery checkpoint: {}", e);
    }
}

async fn run_ticker(
    store: Arc<dyn CheckpointStore>,
    checkpoint: Arc<Mutex<Checkpoint>>,
    progress: Arc<dyn ProgressSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match checkpoint.try_lock() {
                    Ok(mut guard) => {
                        persist(store.as_ref(), &mut guard, progress.progress()).await;
                    }
                    Err(_) => debug!("Checkpoint write in flight, skipping tick"),
                }
            }
        }
    }
}
