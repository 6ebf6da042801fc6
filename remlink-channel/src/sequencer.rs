//! The I/O sequencer (`pipeWriter`).
//!
//! A single dedicated thread executes remote-invoked I/O jobs strictly in
//! the order the peer issued them (ioIds are allocated monotonically on the
//! sending side and the wire preserves order). A completion watermark lets
//! async callers wait until everything up to a given ioId has executed,
//! which is what makes "all pipe effects before this response" an
//! executed-before guarantee rather than a wire-order one.

use crate::error::ChannelError;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::{oneshot, watch};

enum Job {
    /// Ordered I/O work; advances the watermark to `io_id` once run.
    Io {
        io_id: u64,
        work: Box<dyn FnOnce() + Send>,
    },
    /// Drain marker; completes when everything queued before it has run.
    Marker(oneshot::Sender<()>),
}

/// Single-threaded, ioId-keyed work queue.
pub struct Sequencer {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    completed: watch::Receiver<u64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sequencer {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = watch::channel(0u64);
        let thread = std::thread::Builder::new()
            .name(format!("{name} pipe writer"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Io { io_id, work } => {
                            work();
                            let _ = done_tx.send(io_id);
                        }
                        Job::Marker(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            completed: done_rx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules `work` under `io_id`. Returns false after shutdown, in
    /// which case the work is dropped (the channel is tearing down and its
    /// sinks are being failed through the export table anyway).
    pub fn submit(&self, io_id: u64, work: Box<dyn FnOnce() + Send>) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(Job::Io { io_id, work }).is_ok(),
            None => false,
        }
    }

    /// Waits until every job with an ioId ≤ `io_id` has executed.
    ///
    /// `sync(0)` completes immediately: ioId 0 is never allocated.
    pub async fn sync(&self, io_id: u64) -> Result<(), ChannelError> {
        if io_id == 0 {
            return Ok(());
        }
        let mut rx = self.completed.clone();
        rx.wait_for(|&done| done >= io_id)
            .await
            .map(|_| ())
            .map_err(|_| ChannelError::Closed {
                cause: "pipe writer stopped".to_string(),
            })
    }

    /// Waits until everything queued so far has executed.
    pub async fn drain(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        {
            let guard = self.tx.lock();
            let sender = guard.as_ref().ok_or_else(|| ChannelError::Closed {
                cause: "pipe writer stopped".to_string(),
            })?;
            sender.send(Job::Marker(tx)).map_err(|_| ChannelError::Closed {
                cause: "pipe writer stopped".to_string(),
            })?;
        }
        rx.await.map_err(|_| ChannelError::Closed {
            cause: "pipe writer stopped".to_string(),
        })
    }

    /// Last executed ioId.
    pub fn watermark(&self) -> u64 {
        *self.completed.borrow()
    }

    /// Stops accepting work. Already-queued jobs still run; the thread
    /// exits once the queue is empty.
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let seq = Sequencer::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for io_id in 1..=50u64 {
            let log = log.clone();
            seq.submit(io_id, Box::new(move || log.lock().push(io_id)));
        }
        seq.sync(50).await.unwrap();
        assert_eq!(*log.lock(), (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_sync_zero_is_noop() {
        let seq = Sequencer::new("test").unwrap();
        seq.sync(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_observes_all_prior_effects() {
        let seq = Sequencer::new("test").unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        for io_id in 1..=10u64 {
            let counter = counter.clone();
            seq.submit(
                io_id,
                Box::new(move || {
                    counter.fetch_add(io_id, Ordering::SeqCst);
                }),
            );
        }
        seq.sync(10).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn test_drain_waits_for_queued_work() {
        let seq = Sequencer::new("test").unwrap();
        let done = Arc::new(AtomicU64::new(0));
        {
            let done = done.clone();
            seq.submit(
                1,
                Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(30));
                    done.store(1, Ordering::SeqCst);
                }),
            );
        }
        seq.drain().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let seq = Sequencer::new("test").unwrap();
        seq.shutdown();
        assert!(!seq.submit(1, Box::new(|| {})));
    }

    #[tokio::test]
    async fn test_sync_fails_once_stopped_before_watermark() {
        let seq = Sequencer::new("test").unwrap();
        seq.shutdown();
        // Give the worker a moment to observe the closed queue and exit.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(seq.sync(5).await.is_err());
    }
}
