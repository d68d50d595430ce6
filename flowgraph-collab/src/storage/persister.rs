//! Background task that writes document updates to a [`DocumentStore`].
//!
//! Updates arrive over an unbounded channel (the sender is called from
//! synchronous engine callbacks), are coalesced, and written in batches on
//! the blocking pool. A failed batch is kept and retried with exponential
//! backoff. Every `compact_every` persisted updates the whole document is
//! written as a snapshot, which drops the deltas it covers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{DocumentStore, StoreError, WriteCoalescer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub flush_max_updates: usize,
    pub flush_max_bytes: usize,
    pub flush_interval: Duration,
    /// Write a full snapshot after this many persisted updates.
    pub compact_every: u64,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_max_updates: 64,
            flush_max_bytes: 64 * 1024,
            flush_interval: Duration::from_millis(250),
            compact_every: 500,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(10),
        }
    }
}

impl PersistenceConfig {
    pub fn for_testing() -> Self {
        Self {
            flush_max_updates: 8,
            flush_max_bytes: 16 * 1024,
            flush_interval: Duration::from_millis(20),
            compact_every: 10,
            retry_initial_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(80),
        }
    }
}

/// Produces the full encoded document for compaction. Runs on the
/// blocking pool, so it may take locks.
pub type SnapshotSource = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;
/// Called for every failed write.
pub type ErrorSink = Box<dyn Fn(&StoreError) + Send + Sync>;

enum Command {
    Update(Vec<u8>),
    Flush(oneshot::Sender<Result<(), StoreError>>),
    Shutdown(oneshot::Sender<Result<(), StoreError>>),
}

/// Cheap cloneable sender for use inside synchronous callbacks.
#[derive(Clone)]
pub struct PersisterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PersisterHandle {
    /// Queue an encoded update. Returns `false` once the persister is gone.
    pub fn update(&self, update: Vec<u8>) -> bool {
        self.tx.send(Command::Update(update)).is_ok()
    }
}

pub struct Persister {
    handle: PersisterHandle,
    task: JoinHandle<()>,
}

impl Persister {
    /// Start persisting `doc_id`. `next_seq` continues the stored sequence.
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        doc_id: impl Into<String>,
        config: PersistenceConfig,
        next_seq: u64,
        snapshot: SnapshotSource,
        on_error: ErrorSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coalescer = WriteCoalescer::new(
            config.flush_max_updates,
            config.flush_max_bytes,
            config.flush_interval,
            next_seq,
        );
        let worker = Worker {
            store,
            doc_id: doc_id.into(),
            config,
            coalescer,
            snapshot,
            on_error,
            since_compaction: 0,
            last_written: next_seq.saturating_sub(1),
            backoff: None,
            retry_at: None,
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            handle: PersisterHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> PersisterHandle {
        self.handle.clone()
    }

    pub fn update(&self, update: Vec<u8>) -> bool {
        self.handle.update(update)
    }

    /// Write everything buffered now, ignoring any pending backoff.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::Flush(reply))
            .map_err(|_| StoreError::Unavailable("persister stopped".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("persister stopped".into()))?
    }

    /// Flush and stop the task.
    pub async fn shutdown(self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown(reply)).is_err() {
            return Ok(());
        }
        let result = rx
            .await
            .map_err(|_| StoreError::Unavailable("persister stopped".into()))?;
        let _ = self.task.await;
        result
    }
}

struct Worker {
    store: Arc<dyn DocumentStore>,
    doc_id: String,
    config: PersistenceConfig,
    coalescer: WriteCoalescer,
    snapshot: SnapshotSource,
    on_error: ErrorSink,
    since_compaction: u64,
    /// Highest sequence known to be stored.
    last_written: u64,
    backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Update(update)) => {
                        self.coalescer.push(update, Instant::now());
                        if self.coalescer.needs_flush() && self.may_retry(Instant::now()) {
                            let _ = self.write().await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.write().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.write().await);
                        break;
                    }
                    None => {
                        let _ = self.write().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if self.coalescer.due(now) && self.may_retry(now) {
                        let _ = self.write().await;
                    }
                }
            }
        }
        log::debug!("Persister for {} stopped", self.doc_id);
    }

    fn may_retry(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    async fn write(&mut self) -> Result<(), StoreError> {
        let batch = self.coalescer.take();
        if batch.is_empty() {
            return Ok(());
        }

        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let (batch, result) = match tokio::task::spawn_blocking(move || {
            let result = store.append_deltas(&doc_id, &batch);
            (batch, result)
        })
        .await
        {
            Ok(done) => done,
            Err(e) => {
                // The batch went down with the blocking task.
                let err = StoreError::Unavailable(format!("write task failed: {e}"));
                self.fail(&err);
                return Err(err);
            }
        };

        match result {
            Ok(()) => {
                let count = batch.len() as u64;
                if let Some((seq, _)) = batch.last() {
                    self.last_written = self.last_written.max(*seq);
                }
                if self.backoff.is_some() {
                    log::info!("Persistence of {} recovered", self.doc_id);
                }
                self.backoff = None;
                self.retry_at = None;
                self.since_compaction += count;
                log::trace!("Persisted {count} updates of {}", self.doc_id);
                if self.since_compaction >= self.config.compact_every {
                    self.compact().await;
                }
                Ok(())
            }
            Err(e) => {
                self.coalescer.restore(batch, Instant::now());
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&mut self, e: &StoreError) {
        let backoff = match self.backoff {
            None => self.config.retry_initial_backoff,
            Some(current) => (current * 2).min(self.config.retry_max_backoff),
        };
        self.backoff = Some(backoff);
        self.retry_at = Some(Instant::now() + backoff);
        log::error!(
            "Failed to persist {} ({} updates pending), retrying in {backoff:?}: {e}",
            self.doc_id,
            self.coalescer.len()
        );
        (self.on_error)(e);
    }

    /// Replace covered deltas with a full snapshot.
    async fn compact(&mut self) {
        let snapshot = self.snapshot.clone();
        let up_to = self.last_written;
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let encoded = snapshot();
            store.save_snapshot(&doc_id, &encoded, up_to)
        })
        .await;

        match result {
            Ok(Ok(meta)) => {
                self.since_compaction = 0;
                log::info!(
                    "Compacted {} up to seq {up_to} ({} bytes, {} deltas left)",
                    self.doc_id,
                    meta.compressed_size,
                    meta.delta_count
                );
            }
            Ok(Err(e)) => {
                log::warn!("Compaction of {} failed: {e}", self.doc_id);
                (self.on_error)(&e);
            }
            Err(e) => log::warn!("Compaction task of {} failed: {e}", self.doc_id),
        }
    }
}
