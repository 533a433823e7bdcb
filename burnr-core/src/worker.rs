//! The background I/O thread behind each stream.
//!
//! Each stream owns exactly one worker, so device requests leave a stream
//! in the order they were queued: strictly increasing block order for the
//! sliding windows the streams maintain. The job queue is bounded by the
//! stream's ring size, and every job carries its own completion channel.
use crate::error::StreamError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How often [`WorkerThread::join_within`] checks on the thread.
const JOIN_POLL: Duration = Duration::from_millis(10);

pub(crate) struct IoWorker<J: Send + 'static> {
    name: String,
    jobs: Option<SyncSender<J>>,
    handle: Option<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
}

impl<J: Send + 'static> IoWorker<J> {
    /// Spawns a worker thread running `handler` for every queued job.
    ///
    /// The handler is told whether the worker has been cancelled, so it can
    /// hand the job's buffer back without touching the device.
    pub(crate) fn spawn<H>(name: &str, depth: usize, mut handler: H) -> io::Result<Self>
    where
        H: FnMut(J, bool) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<J>(depth.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            trace!(worker = %thread_name, "I/O worker started");
            for job in rx {
                handler(job, flag.load(Ordering::SeqCst));
            }
            trace!(worker = %thread_name, "I/O worker stopped");
        })?;

        Ok(Self {
            name: name.to_string(),
            jobs: Some(tx),
            handle: Some(handle),
            cancelled,
        })
    }

    pub(crate) fn submit(&self, job: J) -> Result<(), StreamError> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|_| StreamError::Closed),
            None => Err(StreamError::Closed),
        }
    }

    /// Lets queued jobs finish, then joins the thread.
    pub(crate) fn shutdown(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!(worker = %self.name, "I/O worker panicked");
            }
        }
    }

    /// Cancels queued jobs without waiting for a request that may be stuck
    /// inside the device. The thread stays reachable through
    /// [`IoWorker::take_thread`].
    pub(crate) fn abort(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.jobs = None;
    }

    /// Hands over the worker thread, if it has not been joined yet. Queued
    /// jobs no longer reach the device once the worker is aborted, but a
    /// request already inside the device runs to completion.
    pub(crate) fn take_thread(&mut self) -> Option<WorkerThread> {
        self.handle.take().map(|handle| WorkerThread {
            name: self.name.clone(),
            handle,
        })
    }
}

impl<J: Send + 'static> Drop for IoWorker<J> {
    fn drop(&mut self) {
        if self.jobs.is_some() {
            self.abort();
        }
    }
}

/// A stream's I/O thread that may still be inside a device request.
#[derive(Debug)]
pub(crate) struct WorkerThread {
    name: String,
    handle: JoinHandle<()>,
}

impl WorkerThread {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Waits up to `limit` for the thread to exit. Gives the thread back if
    /// it is still running.
    pub(crate) fn join_within(self, limit: Duration) -> Result<(), WorkerThread> {
        let deadline = Instant::now() + limit;
        while !self.handle.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                return Err(self);
            }
            thread::sleep(JOIN_POLL.min(deadline - now));
        }
        if self.handle.join().is_err() {
            debug!(worker = %self.name, "I/O worker panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_in_submission_order() {
        let (out_tx, out_rx) = mpsc::channel();
        let mut worker = IoWorker::spawn("test-worker", 4, move |job: u32, _| {
            out_tx.send(job).unwrap();
        })
        .unwrap();

        for i in 0..16 {
            worker.submit(i).unwrap();
        }
        worker.shutdown();

        let seen: Vec<u32> = out_rx.iter().collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn aborted_worker_skips_queued_jobs_and_can_be_joined() {
        let (out_tx, out_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let mut worker = IoWorker::spawn("test-worker", 4, move |job: u32, cancelled| {
            if job == 0 {
                started_tx.send(()).unwrap();
                gate_rx.recv().ok();
            }
            out_tx.send((job, cancelled)).unwrap();
        })
        .unwrap();

        for i in 0..3 {
            worker.submit(i).unwrap();
        }
        started_rx.recv().unwrap();
        worker.abort();
        let thread = worker.take_thread().unwrap();
        assert!(worker.take_thread().is_none());

        // Still blocked inside job 0.
        let thread = thread.join_within(Duration::from_millis(50)).unwrap_err();
        gate_tx.send(()).unwrap();
        thread.join_within(Duration::from_secs(5)).unwrap();

        let seen: Vec<(u32, bool)> = out_rx.iter().collect();
        assert_eq!(seen, vec![(0, false), (1, true), (2, true)]);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut worker = IoWorker::spawn("test-worker", 1, |_job: (), _| {}).unwrap();
        worker.shutdown();
        assert!(matches!(worker.submit(()), Err(StreamError::Closed)));
    }
}
