//! Bounded fan-out over independent pieces of work.
//!
//! Work is split into chunks that run on a dedicated rayon pool sized to
//! the configured parallelism. A shared [`CancelToken`] stops workers from
//! picking up further pieces once the first error has been reported
//! through an [`ErrorChannel`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{FrameworkError, FrameworkResult};

/// Default number of worker threads.
pub const DEFAULT_PARALLELISM: usize = 16;

/// Cooperative cancellation flag shared by the tasks of one phase.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask in-flight work to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Holds the first error reported by any parallel task; later errors are
/// dropped.
#[derive(Debug)]
pub struct ErrorChannel<E> {
    slot: Mutex<Option<E>>,
}

impl<E> Default for ErrorChannel<E> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<E> ErrorChannel<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` unless an error is already pending.
    pub fn send(&self, err: E) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Record `err` and cancel the phase.
    pub fn send_with_cancel(&self, err: E, cancel: &CancelToken) {
        self.send(err);
        cancel.cancel();
    }

    /// Take the first error sent, if any.
    pub fn receive(&self) -> Option<E> {
        self.slot.lock().take()
    }
}

/// Chunk size that grows with the item count: `√n`, capped so every worker
/// still gets at least one chunk.
pub fn chunk_size_for(pieces: usize, parallelism: usize) -> usize {
    let sqrt = (pieces as f64).sqrt() as usize;
    let per_worker = pieces / parallelism.max(1) + 1;
    sqrt.min(per_worker).max(1)
}

/// Worker pool shared by the Filter and Score phases of a profile.
#[derive(Clone)]
pub struct Parallelizer {
    pool: Arc<rayon::ThreadPool>,
    parallelism: usize,
}

impl std::fmt::Debug for Parallelizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallelizer")
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl Parallelizer {
    /// Build a pool of `parallelism` worker threads (at least one).
    pub fn new(parallelism: usize) -> FrameworkResult<Self> {
        let parallelism = parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("fleetgrid-worker-{i}"))
            .build()
            .map_err(|e| FrameworkError::WorkerPool(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            parallelism,
        })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run `work(i)` for every `i` in `0..pieces`, stopping early once
    /// `cancel` fires.
    pub fn until<F>(&self, cancel: &CancelToken, pieces: usize, work: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if pieces == 0 {
            return;
        }
        let chunk = chunk_size_for(pieces, self.parallelism);
        let chunks = pieces.div_ceil(chunk);
        self.pool.install(|| {
            (0..chunks).into_par_iter().for_each(|c| {
                let start = c * chunk;
                let end = (start + chunk).min(pieces);
                for i in start..end {
                    if cancel.is_cancelled() {
                        return;
                    }
                    work(i);
                }
            });
        });
    }

    /// Like [`until`](Self::until) but collects results in index order.
    /// Pieces skipped after cancellation yield `None`.
    pub fn map<T, F>(&self, cancel: &CancelToken, pieces: usize, work: F) -> Vec<Option<T>>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        if pieces == 0 {
            return Vec::new();
        }
        let chunk = chunk_size_for(pieces, self.parallelism);
        self.pool.install(|| {
            (0..pieces)
                .into_par_iter()
                .with_min_len(chunk)
                .map(|i| {
                    if cancel.is_cancelled() {
                        None
                    } else {
                        Some(work(i))
                    }
                })
                .collect()
        })
    }
}
