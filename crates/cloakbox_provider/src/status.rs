//! Provider status state machine.
//!
//! ```text
//! Uninitialized ──► Initializing ──► Initialized
//!       ▲                │                │
//!       │  (cancelled)   │                │
//!       └────────────────┤                │
//!                        ▼                ▼
//!                      Error ◄────────────┘
//! ```
//!
//! `Error` is terminal for a provider instance until it is closed, which
//! returns it to `Uninitialized`.

use crate::error::{ProviderError, ProviderResult};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderStatus {
    /// Constructed, not yet initialized.
    Uninitialized,
    /// An `init` call is in progress.
    Initializing,
    /// Ready for CRUD operations.
    Initialized,
    /// Initialization failed or the provider hit a fatal error.
    Error,
}

impl ProviderStatus {
    /// Returns true if CRUD operations are permitted.
    pub fn is_ready(&self) -> bool {
        matches!(self, ProviderStatus::Initialized)
    }

    /// Returns true if this is the terminal error state.
    pub fn is_error(&self) -> bool {
        matches!(self, ProviderStatus::Error)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Uninitialized => "uninitialized",
            ProviderStatus::Initializing => "initializing",
            ProviderStatus::Initialized => "initialized",
            ProviderStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Shared, thread-safe holder of a provider's status.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<ProviderStatus>,
}

/// Outcome of trying to start initialization.
pub enum InitStart<'a> {
    /// The provider is already initialized.
    Ready,
    /// Initialization cannot start from the current status.
    Blocked(ProviderStatus),
    /// Initialization started; the guard must be resolved.
    Started(InitGuard<'a>),
}

impl StatusCell {
    /// Creates a cell in the `Uninitialized` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProviderStatus::Uninitialized),
        }
    }

    /// Returns the current status.
    pub fn get(&self) -> ProviderStatus {
        *self.inner.lock()
    }

    /// Fails fast unless the provider is `Initialized`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotInitialized`] carrying the current status.
    pub fn require_ready(&self) -> ProviderResult<()> {
        let status = self.get();
        if status.is_ready() {
            Ok(())
        } else {
            Err(ProviderError::NotInitialized { status })
        }
    }

    /// Moves `Uninitialized` to `Initializing`.
    pub fn begin_init(&self) -> InitStart<'_> {
        let mut status = self.inner.lock();
        match *status {
            ProviderStatus::Uninitialized => {
                *status = ProviderStatus::Initializing;
                InitStart::Started(InitGuard {
                    cell: self,
                    resolved: false,
                })
            }
            ProviderStatus::Initialized => InitStart::Ready,
            other => InitStart::Blocked(other),
        }
    }

    /// Marks the provider as failed.
    pub fn mark_error(&self) {
        *self.inner.lock() = ProviderStatus::Error;
    }

    /// Returns the provider to `Uninitialized` (after close).
    pub fn reset(&self) {
        *self.inner.lock() = ProviderStatus::Uninitialized;
    }

    fn set(&self, status: ProviderStatus) -> ProviderStatus {
        *self.inner.lock() = status;
        status
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a provider in `Initializing` until resolved.
///
/// Dropping an unresolved guard (for example when the `init` future is
/// dropped mid-flight) resets the status to `Uninitialized`, so a provider
/// is never left wedged in `Initializing`.
pub struct InitGuard<'a> {
    cell: &'a StatusCell,
    resolved: bool,
}

impl InitGuard<'_> {
    /// Completes initialization successfully.
    pub fn succeed(mut self) -> ProviderStatus {
        self.resolved = true;
        self.cell.set(ProviderStatus::Initialized)
    }

    /// Completes initialization with a failure.
    pub fn fail(mut self) -> ProviderStatus {
        self.resolved = true;
        self.cell.set(ProviderStatus::Error)
    }

    /// Abandons initialization and returns to `Uninitialized`.
    pub fn cancel(mut self) -> ProviderStatus {
        self.resolved = true;
        self.cell.set(ProviderStatus::Uninitialized)
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.cell.set(ProviderStatus::Uninitialized);
        }
    }
}

/// Drives a provider through initialization.
///
/// `attempt` performs one connect/verify attempt. Attempts run strictly one
/// after another with no backoff; `retry_attempts` is the total number of
/// attempts (at least one is always made). Exhaustion yields
/// [`ProviderStatus::Error`]. Cancelling `cancel` drops the in-flight attempt
/// (releasing whatever it had opened) and yields `Uninitialized`.
pub async fn run_init<F, Fut>(
    cell: &StatusCell,
    provider: &str,
    retry_attempts: u32,
    cancel: &CancellationToken,
    mut attempt: F,
) -> ProviderStatus
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<()>>,
{
    let guard = match cell.begin_init() {
        InitStart::Ready => return ProviderStatus::Initialized,
        InitStart::Blocked(status) => {
            debug!(provider, %status, "init skipped");
            return status;
        }
        InitStart::Started(guard) => guard,
    };

    let attempts = retry_attempts.max(1);
    for n in 1..=attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(provider, attempt = n, "provider initialization cancelled");
                return guard.cancel();
            }
            result = attempt() => result,
        };

        match outcome {
            Ok(()) => {
                info!(provider, attempt = n, "provider initialized");
                return guard.succeed();
            }
            Err(e) => {
                warn!(provider, attempt = n, attempts, error = %e, "provider initialization attempt failed");
            }
        }
    }

    guard.fail()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_checks() {
        assert!(ProviderStatus::Initialized.is_ready());
        assert!(!ProviderStatus::Initializing.is_ready());
        assert!(ProviderStatus::Error.is_error());
        assert_eq!(ProviderStatus::Uninitialized.to_string(), "uninitialized");
    }

    #[test]
    fn require_ready_fails_fast() {
        let cell = StatusCell::new();
        let err = cell.require_ready().unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotInitialized {
                status: ProviderStatus::Uninitialized
            }
        ));
    }

    #[test]
    fn dropped_guard_resets_status() {
        let cell = StatusCell::new();
        match cell.begin_init() {
            InitStart::Started(guard) => {
                assert_eq!(cell.get(), ProviderStatus::Initializing);
                drop(guard);
            }
            _ => panic!("expected init to start"),
        }
        assert_eq!(cell.get(), ProviderStatus::Uninitialized);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let cell = StatusCell::new();
        let calls = AtomicU32::new(0);
        let status = run_init(&cell, "test", 3, &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::transport_retryable("refused"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(status, ProviderStatus::Initialized);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cell.require_ready().is_ok());
    }

    #[tokio::test]
    async fn exhaustion_yields_error_status() {
        let cell = StatusCell::new();
        let calls = AtomicU32::new(0);
        let status = run_init(&cell, "test", 2, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::transport_retryable("refused")) }
        })
        .await;

        assert_eq!(status, ProviderStatus::Error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Error is terminal: a second init does not run any attempt.
        let status = run_init(&cell, "test", 2, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(status, ProviderStatus::Error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_init_returns_to_uninitialized() {
        let cell = StatusCell::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = run_init(&cell, "test", 5, &cancel, || async {
            std::future::pending::<ProviderResult<()>>().await
        })
        .await;

        assert_eq!(status, ProviderStatus::Uninitialized);
        assert_eq!(cell.get(), ProviderStatus::Uninitialized);
    }
}
