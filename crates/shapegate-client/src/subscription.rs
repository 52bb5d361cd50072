// crates/shapegate-client/src/subscription.rs
// ============================================================================
// Module: Shape Subscription
// Description: Long-lived poll loop feeding a shape handle.
// Purpose: Consume the change stream with cursor resume, backoff, and cancel.
// Dependencies: tokio, tracing
// ============================================================================

//! ## Overview
//! The loop is `poll -> apply -> advance cursor -> repeat`. The cursor lives in
//! the collection and moves only inside [`ShapeHandle::apply`], so a poll that
//! fails or is cancelled leaves it untouched and the next poll resumes from
//! the last applied batch. Transient failures back off without touching the
//! snapshot; unauthorized and protocol failures end the loop. Cancelling drops
//! the in-flight request, which releases the proxy's upstream connection.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use crate::engine::ShapeHandle;
use crate::error::ClientError;
use crate::transport::ShapeLog;

// ============================================================================
// SECTION: Backoff
// ============================================================================

/// Client-side retry schedule for failed polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retry number `failures` (1-based), doubling up to `max`.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }
}

// ============================================================================
// SECTION: Subscription
// ============================================================================

/// Stream consumer for one shape.
pub struct ShapeSubscription {
    /// Collection fed by the loop.
    handle: ShapeHandle,
    /// Shape source.
    log: Arc<dyn ShapeLog>,
    /// Client filter sent as `where`.
    filter: Option<String>,
    /// Retry schedule.
    backoff: Backoff,
}

impl ShapeSubscription {
    /// Creates a subscription for a handle.
    #[must_use]
    pub fn new(handle: ShapeHandle, log: Arc<dyn ShapeLog>) -> Self {
        Self {
            handle,
            log,
            filter: None,
            backoff: Backoff::default(),
        }
    }

    /// Sets the client filter; the server still scopes it to the principal.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets the retry schedule.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` turns true or a terminal error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for failures that retrying cannot fix.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let table = self.handle.table();
        let mut failures: u32 = 0;
        info!(table = table.as_str(), "shape subscription started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let cursor = self.handle.cursor().await;
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.log.poll(table, &cursor, self.filter.as_deref()) => polled,
            };
            match polled {
                Ok(batch) => {
                    failures = 0;
                    let outcome = self.handle.apply(batch).await;
                    if outcome.must_refetch {
                        info!(table = table.as_str(), "shape rotated; refetching from the start");
                    }
                }
                Err(error) if error.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    warn!(table = table.as_str(), failures, delay_ms = delay.as_millis(), error = %error, "shape poll failed; backing off");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    warn!(table = table.as_str(), error = %error, "shape subscription stopped");
                    return Err(error);
                }
            }
        }
        info!(table = table.as_str(), "shape subscription cancelled");
        Ok(())
    }

    /// Spawns the loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> SubscriptionTask {
        let (shutdown, receiver) = watch::channel(false);
        SubscriptionTask {
            shutdown,
            join: tokio::spawn(self.run(receiver)),
        }
    }
}

/// Running subscription.
pub struct SubscriptionTask {
    /// Cancellation signal.
    shutdown: watch::Sender<bool>,
    /// Loop task.
    join: JoinHandle<Result<(), ClientError>>,
}

impl SubscriptionTask {
    /// Cancels the loop and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the loop's terminal error, if it ended with one.
    pub async fn cancel(self) -> Result<(), ClientError> {
        let _ = self.shutdown.send(true);
        self.join.await.map_err(|err| ClientError::Transport(format!("subscription task failed: {err}")))?
    }

    /// Returns true once the loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
