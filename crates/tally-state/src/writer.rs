//! Background writer for durable state.
//!
//! Single-writer pattern: one thread owns all writes to the [`StateStore`]
//! and drains a channel of [`WriteOp`]s, applying up to `batch_size` of them
//! per transaction. The queue is bounded and submitting never blocks, so
//! recording threads only pay for a channel send. Operations are applied in
//! submission order, which gives last-writer-wins per key.
//!
//! If a write to a scope fails (disk full, permission denied), or the queue
//! is full because the disk has stalled, that scope is marked degraded and
//! further writes to it are dropped for the rest of the process; in-memory
//! values stay authoritative until the next restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tally_core::{Lifetime, WriterConfig};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::WriteOp;

/// Where the writer thread applies its batches.
pub trait WriteTarget: Send + 'static {
    /// Apply `ops` in order, all or nothing.
    fn apply(&self, ops: &[WriteOp]) -> StateResult<()>;
}

impl WriteTarget for StateStore {
    fn apply(&self, ops: &[WriteOp]) -> StateResult<()> {
        StateStore::apply(self, ops)
    }
}

enum Command {
    Write(WriteOp),
    Flush(Sender<()>),
    Shutdown,
}

/// Per-scope "writes are failing" flags.
#[derive(Debug, Default)]
struct DegradedScopes([AtomicBool; 3]);

impl DegradedScopes {
    fn is_degraded(&self, lifetime: Lifetime) -> bool {
        self.0[lifetime.index()].load(Ordering::Acquire)
    }

    /// Returns true the first time a scope is marked.
    fn mark(&self, lifetime: Lifetime) -> bool {
        !self.0[lifetime.index()].swap(true, Ordering::AcqRel)
    }
}

/// Cheap cloneable sender side of the writer, held by storage engines.
#[derive(Clone)]
pub struct WriterHandle {
    tx: SyncSender<Command>,
    degraded: Arc<DegradedScopes>,
}

impl WriterHandle {
    /// Queue an operation. Never blocks; operations for degraded scopes and
    /// operations submitted after shutdown are dropped. A full queue
    /// degrades the operation's scope.
    pub fn submit(&self, op: WriteOp) {
        let scope = op.scope();
        if self.degraded.is_degraded(scope) {
            return;
        }
        match self.tx.try_send(Command::Write(op)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.degraded.mark(scope) {
                    warn!(%scope, "state write queue full, values kept in memory only");
                }
            }
            Err(TrySendError::Disconnected(_)) => debug!("state writer stopped, dropping write"),
        }
    }
}

/// Owner of the writer thread.
pub struct StateWriter {
    handle: WriterHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
    flush_timeout: Duration,
}

impl StateWriter {
    /// Spawn the writer thread over `target`, usually a [`StateStore`].
    pub fn spawn(target: impl WriteTarget, config: &WriterConfig) -> StateResult<Self> {
        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let degraded = Arc::new(DegradedScopes::default());
        let worker = Worker {
            target,
            rx,
            batch_size: config.batch_size.max(1),
            degraded: Arc::clone(&degraded),
        };
        let thread = thread::Builder::new()
            .name("tally-writer".to_string())
            .spawn(move || worker.run())
            .map_err(|e| StateError::Worker(e.to_string()))?;

        Ok(Self {
            handle: WriterHandle { tx, degraded },
            thread: Mutex::new(Some(thread)),
            flush_timeout: Duration::from_millis(config.flush_timeout_ms),
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    pub fn submit(&self, op: WriteOp) {
        self.handle.submit(op);
    }

    /// Whether writes to `lifetime` have been abandoned after an I/O failure
    /// or a full queue.
    pub fn is_degraded(&self, lifetime: Lifetime) -> bool {
        self.handle.degraded.is_degraded(lifetime)
    }

    /// Wait until every operation submitted before this call is applied.
    /// Returns false if the writer is gone or the flush timed out. Waits for
    /// queue space first.
    pub fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.handle.tx.send(Command::Flush(ack_tx)).is_err() {
            return false;
        }
        match ack_rx.recv_timeout(self.flush_timeout) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, timeout = ?self.flush_timeout, "state flush did not complete");
                false
            }
        }
    }

    /// Apply everything queued so far, then stop the thread. Idempotent.
    pub fn shutdown(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let _ = self.handle.tx.send(Command::Shutdown);
            if thread.join().is_err() {
                warn!("state writer thread panicked");
            }
        }
    }
}

impl Drop for StateWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<T> {
    target: T,
    rx: Receiver<Command>,
    batch_size: usize,
    degraded: Arc<DegradedScopes>,
}

impl<T: WriteTarget> Worker<T> {
    fn run(self) {
        info!(batch_size = self.batch_size, "state writer started");
        let mut batch = Vec::with_capacity(self.batch_size);

        'outer: loop {
            let mut next = match self.rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            };
            let mut acks = Vec::new();
            let mut stop = false;

            while let Some(cmd) = next.take() {
                match cmd {
                    Command::Write(op) => batch.push(op),
                    Command::Flush(ack) => acks.push(ack),
                    Command::Shutdown => {
                        stop = true;
                        break;
                    }
                }
                if batch.len() >= self.batch_size {
                    break;
                }
                next = self.rx.try_recv().ok();
            }

            self.apply_batch(std::mem::take(&mut batch));
            for ack in acks {
                let _ = ack.send(());
            }
            if stop {
                break 'outer;
            }
        }

        info!("state writer stopped");
    }

    fn apply_batch(&self, ops: Vec<WriteOp>) {
        let ops: Vec<WriteOp> = ops
            .into_iter()
            .filter(|op| !self.degraded.is_degraded(op.scope()))
            .collect();
        if ops.is_empty() {
            return;
        }

        match self.target.apply(&ops) {
            Ok(()) => debug!(count = ops.len(), "write batch applied"),
            Err(e) => {
                warn!(error = %e, count = ops.len(), "write batch failed, retrying one by one");
                // Isolate the failing scope so healthy scopes keep persisting.
                for op in &ops {
                    let scope = op.scope();
                    if self.degraded.is_degraded(scope) {
                        continue;
                    }
                    if let Err(e) = self.target.apply(std::slice::from_ref(op)) {
                        if self.degraded.mark(scope) {
                            warn!(
                                %scope,
                                error = %e,
                                "persistence disabled for scope, values kept in memory only"
                            );
                        }
                    }
                }
            }
        }
    }
}
