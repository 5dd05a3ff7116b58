//! Single-consumer operation queue.
//!
//! Operations submitted to an [`OpQueue`] run one at a time on a worker task,
//! strictly in submission order. A failing operation is logged and reported
//! to its submitter; the worker then moves on to the next one. Siblings are
//! never rolled back.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::Error;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Default)]
struct State {
    tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

/// FIFO queue with one worker task, started on first use.
#[derive(Debug, Default)]
pub struct OpQueue {
    state: Mutex<State>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Job>, Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::QueueClosed);
        }
        if let Some(tx) = &state.tx {
            return Ok(tx.clone());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        state.worker = Some(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        }));
        state.tx = Some(tx.clone());
        Ok(tx)
    }

    /// Enqueue `op` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or `Error::QueueClosed` if the queue
    /// was drained before the operation could run.
    pub async fn submit<T, F>(&self, label: &'static str, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = op.await;
            if let Err(e) = &result {
                tracing::warn!(op = label, error = %e, "queued operation failed");
            }
            let _ = done_tx.send(result);
        });

        self.sender()?.send(job).map_err(|_| Error::QueueClosed)?;
        done_rx.await.map_err(|_| Error::QueueClosed)?
    }

    /// Stop accepting operations and wait until every queued one has run.
    pub async fn drain(&self) {
        let worker = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.tx = None;
            state.worker.take()
        };
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::warn!(error = %e, "operation queue worker ended abnormally");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let queue = OpQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let ops = (0..5u64).map(|i| {
            let log = Arc::clone(&log);
            queue.submit("push", async move {
                tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                log.lock().unwrap().push(i);
                Ok(i)
            })
        });
        let results = futures_util::future::join_all(ops).await;

        assert_eq!(results.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_worker() {
        let queue = OpQueue::new();
        let failed = queue.submit("fail", async { Err::<(), _>(Error::Conflict("k".into())) }).await;
        assert!(matches!(failed, Err(Error::Conflict(_))));

        let ok = queue.submit("ok", async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_drain_waits_then_closes() {
        let queue = Arc::new(OpQueue::new());
        let done = Arc::new(Mutex::new(false));

        let pending = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                queue
                    .submit("slow", async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        *done.lock().unwrap() = true;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.drain().await;
        assert!(*done.lock().unwrap());
        assert!(pending.await.unwrap().is_ok());
        assert!(queue.is_closed());
        assert!(matches!(queue.submit("late", async { Ok(()) }).await, Err(Error::QueueClosed)));
    }
}
