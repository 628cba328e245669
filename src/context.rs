//! Shared per-run context.
//!
//! One [`InstallContext`] is threaded through every component of an install
//! run. It bundles the cancellation token with the event sink so that every
//! suspension point can re-check for cancellation and every component can
//! report through the same observer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{FragmenterError, FragmenterResult};
use crate::events::EventSink;

/// Cancellation signal and event sink for one install run.
#[derive(Clone)]
pub struct InstallContext {
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
}

impl InstallContext {
    pub fn new(cancel: CancellationToken, sink: Arc<dyn EventSink>) -> Self {
        Self { cancel, sink }
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub fn shared_sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `UserAborted` if cancellation was requested.
    ///
    /// Called after every suspension point before further work proceeds.
    pub fn ensure_active(&self) -> FragmenterResult<()> {
        if self.cancel.is_cancelled() {
            Err(FragmenterError::user_aborted())
        } else {
            Ok(())
        }
    }

    /// Sleep that loses a race against cancellation.
    ///
    /// Retry backoffs use this so an abort does not wait out the backoff.
    pub async fn sleep(&self, duration: Duration) -> FragmenterResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FragmenterError::user_aborted()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
