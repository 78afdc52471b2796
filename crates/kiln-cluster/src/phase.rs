//! Concurrent phases.
//!
//! A phase launches independent steps together, waits for every one of them,
//! and only then reports. Errors are reported in the order the steps were
//! added, not the order they happened, so callers decide which failure a user
//! sees first by the order they queue work.

use futures::future::{join_all, BoxFuture};
use tracing::{debug, error};

use kiln_common::Result;

/// Steps of one phase, run concurrently
pub struct Phase<'a> {
    name: &'static str,
    steps: Vec<(String, BoxFuture<'a, Result<()>>)>,
}

impl<'a> Phase<'a> {
    /// Empty phase
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Queue a step; `label` names it in logs
    pub fn push(&mut self, label: impl Into<String>, step: BoxFuture<'a, Result<()>>) {
        self.steps.push((label.into(), step));
    }

    /// Number of queued steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// No steps queued
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step to completion and return the first error in queue order
    pub async fn run(self) -> Result<()> {
        if self.steps.is_empty() {
            return Ok(());
        }
        let phase = self.name;
        debug!(phase, steps = self.steps.len(), "running phase");

        let (labels, steps): (Vec<_>, Vec<_>) = self.steps.into_iter().unzip();
        let results = join_all(steps).await;

        let mut first = None;
        for (label, result) in labels.iter().zip(results) {
            if let Err(e) = result {
                error!(phase, step = %label, error = %e, "step failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                debug!(phase, "phase completed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;
    use kiln_common::Error;

    use super::*;

    #[tokio::test]
    async fn failure_is_reported_after_every_step_finished() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut phase = Phase::new("datastores");
        for i in 0..5u64 {
            let completed = completed.clone();
            phase.push(
                format!("datastore {}", i),
                async move {
                    // index 3 fails fast, the others are still running
                    if i != 3 {
                        tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    }
                    completed.fetch_add(1, Ordering::SeqCst);
                    if i == 3 {
                        return Err(Error::state("datastore 3 failed"));
                    }
                    Ok(())
                }
                .boxed(),
            );
        }

        let err = phase.run().await.unwrap_err();
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(err.to_string().contains("datastore 3"));
    }

    #[tokio::test]
    async fn queue_order_decides_which_error_is_returned() {
        let mut phase = Phase::new("vms");
        phase.push(
            "load balancer",
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(Error::state("lb"))
            }
            .boxed(),
        );
        phase.push("worker", async { Err(Error::state("worker")) }.boxed());

        let err = phase.run().await.unwrap_err();
        assert!(err.to_string().contains("lb"));
    }

    #[tokio::test]
    async fn empty_phase_succeeds() {
        let phase = Phase::new("nothing");
        assert!(phase.is_empty());
        phase.run().await.unwrap();
    }
}
