//! Bulk-OUT transfer dispatch
//!
//! Every open connection owns one dedicated `usb-transfer` thread. Print jobs
//! are queued to it and executed one at a time, so writes on a connection
//! never interleave. Callers only learn that a job was accepted; the outcome
//! is logged and published on a result channel.

use crate::usb::host::UsbConnection;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for a bulk print transfer (100 seconds)
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(100);

/// Default number of jobs that may wait behind the running one
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Cooperative cancellation flag shared between a submitter and the worker
///
/// Cancelling only affects jobs that have not started; a running bulk
/// transfer always runs to completion or timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adapter-wide transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Returned to the submitter of an accepted job
#[derive(Debug, Clone)]
pub struct TransferTicket {
    pub id: TransferId,
    pub cancel: CancelToken,
}

/// A queued bulk write
#[derive(Debug)]
pub struct TransferJob {
    pub id: TransferId,
    pub payload: Vec<u8>,
    pub cancel: CancelToken,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed { written: usize },
    Failed { error: String },
    Cancelled,
}

/// Result record published after each job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub id: TransferId,
    /// Payload length of the job
    pub requested: usize,
    pub status: TransferStatus,
}

/// Per-connection transfer thread
pub struct TransferWorker {
    jobs: Sender<TransferJob>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl TransferWorker {
    /// Spawn the worker thread for a connection
    pub fn spawn(
        connection: Arc<dyn UsbConnection>,
        endpoint: u8,
        timeout: Duration,
        queue_depth: usize,
        outcomes: Sender<TransferOutcome>,
    ) -> common::Result<Self> {
        let (jobs_tx, jobs_rx) = bounded(queue_depth.max(1));
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("usb-transfer".to_string())
            .spawn(move || {
                run_worker(
                    connection,
                    endpoint,
                    timeout,
                    jobs_rx,
                    worker_cancel,
                    outcomes,
                )
            })?;

        debug!(
            "Transfer worker started for endpoint {:#04x} (timeout {:?})",
            endpoint, timeout
        );

        Ok(Self {
            jobs: jobs_tx,
            cancel,
            handle: Some(handle),
        })
    }

    /// Queue a payload without blocking
    pub fn submit(&self, id: TransferId, payload: Vec<u8>) -> common::Result<TransferTicket> {
        let cancel = CancelToken::new();
        let job = TransferJob {
            id,
            payload,
            cancel: cancel.clone(),
        };

        match self.jobs.try_send(job) {
            Ok(()) => Ok(TransferTicket { id, cancel }),
            Err(TrySendError::Full(_)) => Err(common::Error::Channel(
                "transfer queue is full".to_string(),
            )),
            Err(TrySendError::Closed(_)) => Err(common::Error::Channel(
                "transfer worker has stopped".to_string(),
            )),
        }
    }

    /// Number of jobs waiting to run
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Stop accepting jobs and skip the queued ones
    ///
    /// Does not wait for a running transfer; the thread exits on its own once
    /// that transfer returns.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        self.jobs.close();
        if let Some(handle) = self.handle.take()
            && handle.is_finished()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.jobs.close();
    }
}

fn run_worker(
    connection: Arc<dyn UsbConnection>,
    endpoint: u8,
    timeout: Duration,
    jobs: Receiver<TransferJob>,
    cancel: CancelToken,
    outcomes: Sender<TransferOutcome>,
) {
    while let Ok(job) = jobs.recv_blocking() {
        let requested = job.payload.len();

        let status = if cancel.is_cancelled() || job.cancel.is_cancelled() {
            debug!("Transfer {:?} cancelled before start", job.id);
            TransferStatus::Cancelled
        } else {
            execute_bulk_out(connection.as_ref(), endpoint, &job.payload, timeout)
        };

        match &status {
            TransferStatus::Completed { written } => {
                info!("Transfer {:?} return status: {} bytes", job.id, written)
            }
            TransferStatus::Failed { error } => {
                warn!("Transfer {:?} failed: {}", job.id, error)
            }
            TransferStatus::Cancelled => {}
        }

        let outcome = TransferOutcome {
            id: job.id,
            requested,
            status,
        };
        if let Err(e) = outcomes.try_send(outcome) {
            debug!("Transfer outcome not published: {}", e);
        }
    }

    debug!("Transfer worker for endpoint {:#04x} stopped", endpoint);
}

/// Execute one bulk-OUT write
fn execute_bulk_out(
    connection: &dyn UsbConnection,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> TransferStatus {
    debug!(
        "Bulk OUT transfer: endpoint={:#04x}, data_len={}, timeout={}ms",
        endpoint,
        data.len(),
        timeout.as_millis()
    );

    match connection.write_bulk(endpoint, data, timeout) {
        Ok(written) => {
            if written != data.len() {
                warn!(
                    "Short bulk write on endpoint {:#04x}: {} of {} bytes",
                    endpoint,
                    written,
                    data.len()
                );
            }
            TransferStatus::Completed { written }
        }
        Err(e) => TransferStatus::Failed {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnection {
        writes: Mutex<Vec<(u8, Vec<u8>)>>,
        fail: AtomicBool,
    }

    impl UsbConnection for RecordingConnection {
        fn claim_interface(&self, _interface: u8, _force: bool) -> common::Result<()> {
            Ok(())
        }

        fn release_interface(&self, _interface: u8) -> common::Result<()> {
            Ok(())
        }

        fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> common::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(common::Error::Usb("Pipe error".to_string()));
            }
            self.writes.lock().unwrap().push((endpoint, data.to_vec()));
            Ok(data.len())
        }

        fn close(&self) {}
    }

    fn worker_for(connection: Arc<RecordingConnection>) -> (TransferWorker, Receiver<TransferOutcome>) {
        let (tx, rx) = bounded(16);
        let worker = TransferWorker::spawn(connection, 0x02, Duration::from_secs(1), 8, tx).unwrap();
        (worker, rx)
    }

    #[test]
    fn test_jobs_run_in_order() {
        let connection = Arc::new(RecordingConnection::default());
        let (worker, outcomes) = worker_for(connection.clone());

        worker.submit(TransferId(1), b"first".to_vec()).unwrap();
        worker.submit(TransferId(2), b"second".to_vec()).unwrap();

        let a = outcomes.recv_blocking().unwrap();
        let b = outcomes.recv_blocking().unwrap();
        assert_eq!(a.id, TransferId(1));
        assert_eq!(a.status, TransferStatus::Completed { written: 5 });
        assert_eq!(b.id, TransferId(2));

        let writes = connection.writes.lock().unwrap();
        assert_eq!(writes[0], (0x02, b"first".to_vec()));
        assert_eq!(writes[1], (0x02, b"second".to_vec()));
    }

    #[test]
    fn test_failure_is_reported_not_raised() {
        let connection = Arc::new(RecordingConnection::default());
        connection.fail.store(true, Ordering::SeqCst);
        let (worker, outcomes) = worker_for(connection);

        assert!(worker.submit(TransferId(7), vec![0x1B, 0x40]).is_ok());

        let outcome = outcomes.recv_blocking().unwrap();
        assert_eq!(outcome.requested, 2);
        assert!(matches!(outcome.status, TransferStatus::Failed { .. }));
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let connection = Arc::new(RecordingConnection::default());
        let (tx, outcomes) = bounded(16);
        let (jobs_tx, jobs_rx) = bounded(4);

        let token = CancelToken::new();
        token.cancel();
        jobs_tx
            .try_send(TransferJob {
                id: TransferId(1),
                payload: b"skip me".to_vec(),
                cancel: token,
            })
            .unwrap();
        jobs_tx.close();

        run_worker(
            connection.clone(),
            0x01,
            Duration::from_secs(1),
            jobs_rx,
            CancelToken::new(),
            tx,
        );

        assert_eq!(
            outcomes.recv_blocking().unwrap().status,
            TransferStatus::Cancelled
        );
        assert!(connection.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let connection = Arc::new(RecordingConnection::default());
        let (worker, _outcomes) = worker_for(connection);
        let jobs = worker.jobs.clone();
        worker.shutdown();

        assert!(jobs.is_closed());
    }
}
