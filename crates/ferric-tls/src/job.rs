//! Async job dispatcher.
//!
//! Connections in async mode route handshake and I/O through a dispatcher
//! that parks an operation when it signals it is waiting on an external
//! event, and resumes it on a later call. Job capacity is bounded by a pool
//! shared across every connection of one context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ferric_types::{Retry, TlsError};

use crate::engine::ProtocolEngine;

/// Which class of operation a parked job belongs to. A paused read must be
/// resumed by a read, and likewise for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Read,
    Write,
    /// Handshake and shutdown operations.
    Other,
}

/// Dispatch outcome reported to the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Paused,
    Finished,
}

/// Callback observing job transitions.
pub type JobStatusCallback = Arc<dyn Fn(JobStatus) + Send + Sync>;

/// Bounded pool of job slots, shared by all connections of one context.
#[derive(Debug)]
pub struct JobPool {
    max_jobs: usize,
    in_use: AtomicUsize,
}

impl JobPool {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn available(&self) -> usize {
        self.max_jobs.saturating_sub(self.in_use.load(Ordering::Acquire))
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.max_jobs {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Event-wait bookkeeping for a paused job. Created lazily on the first
/// dispatch of a connection.
#[derive(Default)]
pub struct WaitContext {
    status_cb: Option<JobStatusCallback>,
}

impl WaitContext {
    fn notify(&self, status: JobStatus) {
        if let Some(cb) = &self.status_cb {
            cb(status);
        }
    }
}

impl std::fmt::Debug for WaitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitContext")
            .field("status_cb", &self.status_cb.is_some())
            .finish()
    }
}

/// Per-connection dispatcher. Holds at most one parked job.
pub struct Dispatcher {
    pool: Arc<JobPool>,
    parked: Option<JobKind>,
    wait: Option<WaitContext>,
    status_cb: Option<JobStatusCallback>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("parked", &self.parked)
            .field("wait", &self.wait)
            .field("status_cb", &self.status_cb.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(pool: Arc<JobPool>) -> Self {
        Self {
            pool,
            parked: None,
            wait: None,
            status_cb: None,
        }
    }

    /// Register a callback observing pause/finish transitions. Takes effect
    /// from the next dispatch that creates or reuses the wait context.
    pub fn set_status_callback(&mut self, cb: JobStatusCallback) {
        self.status_cb = Some(cb);
        if let Some(wait) = &mut self.wait {
            wait.status_cb = self.status_cb.clone();
        }
    }

    pub fn has_parked_job(&self) -> bool {
        self.parked.is_some()
    }

    /// Run `op` inside a job slot.
    ///
    /// `Err(Retry(WantEvent))` from the operation parks the job and surfaces
    /// as `Retry::AsyncPaused`; the caller must re-invoke the same operation
    /// to resume. Any other outcome completes the job and frees its slot.
    /// With no parked job and no free slot, returns `Retry::AsyncNoJobs`
    /// without running the operation.
    pub fn dispatch<F>(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        kind: JobKind,
        mut op: F,
    ) -> Result<usize, TlsError>
    where
        F: FnMut(&mut dyn ProtocolEngine) -> Result<usize, TlsError>,
    {
        match self.parked {
            Some(parked) if parked != kind => {
                return Err(TlsError::Sequence(
                    "a paused async operation of a different kind is pending".into(),
                ));
            }
            Some(_) => {}
            None => {
                if !self.pool.try_acquire() {
                    return Err(TlsError::Retry(Retry::AsyncNoJobs));
                }
                self.parked = None;
            }
        }
        if self.wait.is_none() {
            self.wait = Some(WaitContext {
                status_cb: self.status_cb.clone(),
            });
        }

        match op(engine) {
            Err(TlsError::Retry(Retry::WantEvent)) => {
                self.parked = Some(kind);
                if let Some(wait) = &self.wait {
                    wait.notify(JobStatus::Paused);
                }
                Err(TlsError::Retry(Retry::AsyncPaused))
            }
            result => {
                self.complete();
                result
            }
        }
    }

    fn complete(&mut self) {
        self.parked = None;
        self.pool.release();
        if let Some(wait) = &self.wait {
            wait.notify(JobStatus::Finished);
        }
    }

    /// Abandon any parked job, freeing its slot. Used when the connection is
    /// torn down with an operation still paused.
    pub fn forfeit(&mut self) {
        if self.parked.take().is_some() {
            self.pool.release();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.forfeit();
    }
}
