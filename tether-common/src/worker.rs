use std::{
    panic::{self, AssertUnwindSafe},
    sync::mpsc as std_mpsc,
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker thread is shut down")]
    Closed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A dedicated OS thread that runs submitted jobs one at a time, in submission order.
///
/// Jobs never run concurrently with each other, so state that is only touched from jobs
/// needs no further synchronization. A panicking job is logged and the worker keeps going.
pub struct SerialWorker {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl SerialWorker {
    /// Spawns the worker thread with the given name.
    pub fn spawn(name: impl Into<String>) -> Result<Self, WorkerError> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!(worker = %thread_name, "worker started");

            while let Some(job) = rx.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(worker = %thread_name, "job panicked");
                }
            }

            tracing::debug!(worker = %thread_name, "worker stopped");
        })?;

        let thread_id = handle.thread().id();

        Ok(Self { name, tx: Mutex::new(Some(tx)), handle: Mutex::new(Some(handle)), thread_id })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueues a job. Returns immediately.
    pub fn submit<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(WorkerError::Closed);
        };

        tx.send(Box::new(job)).map_err(|_| WorkerError::Closed)
    }

    /// Blocks until every job submitted before this call has run.
    ///
    /// Calling this from the worker thread returns immediately, since waiting there would
    /// deadlock. Safe to call from any other thread, including one driving a tokio runtime,
    /// but it parks that thread until the queue ahead of it has drained.
    pub fn flush(&self) -> Result<(), WorkerError> {
        if self.is_current() {
            return Ok(());
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.submit(move || {
            let _ = tx.send(());
        })?;

        rx.recv().map_err(|_| WorkerError::Closed)
    }

    /// Stops accepting jobs, drains the queue and joins the thread.
    ///
    /// Like [`SerialWorker::flush`] this parks the calling thread, and is safe inside a runtime.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());

        if self.is_current() {
            return;
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for SerialWorker {
    fn drop(&mut self) {
        // Closing the channel lets the thread exit once the queue is drained.
        drop(self.tx.lock().take());
    }
}

impl std::fmt::Debug for SerialWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialWorker").field("name", &self.name).finish()
    }
}
