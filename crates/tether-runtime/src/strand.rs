//! Sequential execution context for one object.

use futures::future::BoxFuture;
use std::sync::OnceLock;
use tether_types::{Error, Result};
use tokio::sync::mpsc;
use tracing::debug;

/// Runs posted jobs one after another on a dedicated tokio task.
///
/// The task is spawned on first use, on the runtime of the posting
/// thread. Jobs never overlap, so a handler bound to a strand does not
/// need to be reentrant.
#[derive(Default)]
pub struct Strand {
    tx: OnceLock<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

impl Strand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind every job posted before it.
    pub fn post(&self, job: BoxFuture<'static, ()>) -> Result<()> {
        self.sender()?
            .send(job)
            .map_err(|_| Error::Config("execution strand has stopped".to_string()))
    }

    fn sender(&self) -> Result<&mpsc::UnboundedSender<BoxFuture<'static, ()>>> {
        if let Some(tx) = self.tx.get() {
            return Ok(tx);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("an execution strand needs a running tokio runtime".to_string())
        })?;
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("Execution strand stopped");
        });
        // A racing initializer wins; our sender is dropped and its task exits.
        let _ = self.tx.set(tx);
        self.tx
            .get()
            .ok_or_else(|| Error::Config("execution strand unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order_without_overlap() {
        let strand = Strand::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        for i in 0..5u32 {
            let log = Arc::clone(&log);
            strand
                .post(Box::pin(async move {
                    log.lock().unwrap().push(format!("start {i}"));
                    // Later jobs sleep less; order must still hold.
                    tokio::time::sleep(Duration::from_millis(u64::from(10 - 2 * i))).await;
                    log.lock().unwrap().push(format!("end {i}"));
                }))
                .unwrap();
        }
        strand
            .post(Box::pin(async move {
                let _ = done_tx.send(());
            }))
            .unwrap();
        done_rx.await.unwrap();
        let log = log.lock().unwrap();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log, expected);
    }

    #[test]
    fn test_post_without_runtime_fails() {
        let strand = Strand::new();
        assert!(matches!(
            strand.post(Box::pin(async {})),
            Err(Error::Config(_))
        ));
    }
}
