//! Batch interface for submitting and controlling graph mutations.
//!
//! This module provides a minimal, thread-per-batch runner that accepts
//! mutation batches, executes them on a background thread, and reports the
//! outcome back to the caller. It uses cooperative cancellation via an
//! `Arc<AtomicBool>`.
//!
//! A batch is the unit of settlement: the session runs one batch to
//! completion, inverse links and dirtied computations included, before the
//! next one starts, so no batch ever observes another mid-update.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::graph::Engine;

/// Cancellation token shared with the worker thread. Cancellation is only
/// observed before a batch starts; a running batch always settles.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(u64);

/// What became of a submitted batch.
#[derive(Debug)]
pub enum BatchOutcome {
    Completed(Result<()>),
    /// Cancelled before it started, or its worker died.
    Skipped,
}

/// Handle to a running or completed batch.
pub struct BatchHandle {
    pub id: BatchId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<()>>,
    outcome: Receiver<BatchOutcome>,
}

impl BatchHandle {
    /// Request cancellation. Only effective while the batch is still queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the batch to finish and collect its outcome.
    pub fn wait(mut self) -> BatchOutcome {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.outcome.recv().unwrap_or(BatchOutcome::Skipped)
    }
    /// Elapsed time since submission.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry managing batch lifecycles over a shared engine.
pub struct Session {
    engine: Arc<Engine>,
    next_id: Mutex<u64>,
    active: Arc<Mutex<HashMap<BatchId, CancelToken>>>,
    // Held for the duration of each batch; this is the settlement boundary.
    gate: Arc<Mutex<()>>,
}

impl Session {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    fn allocate_id(&self) -> BatchId {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        BatchId(*guard)
    }

    /// Submit a mutation batch for execution on a background thread.
    pub fn submit<F>(&self, batch: F) -> BatchHandle
    where
        F: FnOnce(&Engine) -> Result<()> + Send + 'static,
    {
        let id = self.allocate_id();
        let cancel = CancelToken::new();
        self.active.lock().unwrap().insert(id, cancel.clone());

        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let gate = Arc::clone(&self.gate);
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let join = std::thread::spawn(move || {
            let outcome = {
                let _settled = gate.lock().unwrap();
                if cancel_for_thread.is_cancelled() {
                    debug!(batch = ?id, "batch cancelled before start");
                    BatchOutcome::Skipped
                } else {
                    let result = batch(&engine);
                    if let Err(e) = &result {
                        warn!(batch = ?id, error = %e, "batch failed");
                    }
                    BatchOutcome::Completed(result)
                }
            };
            active.lock().unwrap().remove(&id);
            let _ = tx.send(outcome);
        });

        BatchHandle { id, cancel, started: Instant::now(), join: Some(join), outcome: rx }
    }

    /// Run a batch synchronously on the current thread, still honoring the
    /// settlement boundary with respect to submitted batches.
    pub fn run_sync<F>(&self, batch: F) -> Result<()>
    where
        F: FnOnce(&Engine) -> Result<()>,
    {
        let _settled = self.gate.lock().unwrap();
        batch(&self.engine)
    }

    /// Cancel a batch by id. Returns false when it already finished.
    pub fn cancel(&self, id: BatchId) -> bool {
        if let Some(token) = self.active.lock().unwrap().get(&id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}
