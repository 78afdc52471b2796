//! Bounded exponential backoff.
//!
//! One primitive serves every polling or flaky call site: watching a cloud
//! resource until it reports ready, deleting a network until the provider
//! stops refusing, reopening an SSH session. Each call site supplies its own
//! notion of success.
//!
//! # Example
//!
//! ```ignore
//! let instance = Backoff::new(Duration::from_secs(10), 2, 6)
//!     .run(
//!         &cancel,
//!         "watch instance",
//!         || client.get_instance(&id),
//!         |vm| vm.status == InstanceStatus::Active,
//!         ErrorAction::retry,
//!         Ok,
//!     )
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// What to do with an action error
#[derive(Debug)]
pub enum ErrorAction {
    /// Record the error and keep trying
    Continue(Error),
    /// Stop immediately and return this error
    Escalate(Error),
}

impl ErrorAction {
    /// Classifier that retries every error
    pub fn retry(err: Error) -> Self {
        ErrorAction::Continue(err)
    }

    /// Classifier that retries only errors flagged retryable
    pub fn retry_if_retryable(err: Error) -> Self {
        if err.is_retryable() {
            ErrorAction::Continue(err)
        } else {
            ErrorAction::Escalate(err)
        }
    }
}

/// Backoff parameters: initial wait, multiplicative factor, retry budget.
///
/// A budget of `max_retries` makes `max_retries + 1` action invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Wait before the second attempt
    pub initial: Duration,
    /// Wait multiplier applied after every sleep (1 keeps it constant)
    pub factor: u32,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Backoff {
    /// Create a backoff with the given parameters
    pub fn new(initial: Duration, factor: u32, max_retries: u32) -> Self {
        Self {
            initial,
            factor,
            max_retries,
        }
    }

    /// Run `action` until `is_successful` accepts its output.
    ///
    /// # Arguments
    /// * `cancel` - Checked before every attempt and raced against every sleep
    /// * `operation` - Name for logging and error messages
    /// * `action` - The fallible call to repeat
    /// * `is_successful` - Predicate over a successful action output
    /// * `on_error` - Classifies action errors as retryable or escalating
    /// * `on_success` - Completion callback whose result is returned
    ///
    /// # Returns
    /// `Cancelled` if the token fires, the escalated error if `on_error`
    /// escalates, otherwise `Timeout` wrapping the last observed error.
    pub async fn run<T, R, A, Fut, P, E, S>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut action: A,
        mut is_successful: P,
        mut on_error: E,
        on_success: S,
    ) -> Result<R>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut(&T) -> bool,
        E: FnMut(Error) -> ErrorAction,
        S: FnOnce(T) -> Result<R>,
    {
        let mut wait = self.initial;
        let mut last_error = None;
        let mut attempts = 0u32;

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(operation));
            }
            attempts += 1;

            match action().await {
                Ok(output) => {
                    if is_successful(&output) {
                        debug!(operation = %operation, attempt = attempts, "operation succeeded");
                        return on_success(output);
                    }
                    warn!(
                        operation = %operation,
                        attempt = attempts,
                        "operation not ready yet"
                    );
                }
                Err(err) => match on_error(err) {
                    ErrorAction::Escalate(err) => return Err(err),
                    ErrorAction::Continue(err) => {
                        warn!(
                            operation = %operation,
                            attempt = attempts,
                            error = %err,
                            "operation failed, retrying"
                        );
                        last_error = Some(err);
                    }
                },
            }

            if attempt == self.max_retries {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
                _ = tokio::time::sleep(wait) => {}
            }
            wait *= self.factor;
        }

        Err(Error::timeout(operation, attempts, last_error))
    }

    /// Repeat `action` until it stops erroring.
    pub async fn retry<T, A, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        action: A,
    ) -> Result<T>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(cancel, operation, action, |_| true, ErrorAction::retry, Ok)
            .await
    }
}
