//! Cancellation signals and in-flight tracking.
//!
//! A connector cancels the contexts of the handlers it runs through one
//! [`ShutdownSignal`] per lifetime, and counts those handlers with an
//! [`InFlightTracker`] so that shutdown can wait for them to drain. Both are
//! built on `tokio::sync::watch`, so late subscribers see the current state.
//!
//! ```rust,ignore
//! let lifetime = ShutdownSignal::new();
//! tokio::select! {
//!     () = lifetime.recv() => debug!("Connector stopping"),
//!     res = handler(ctx, req) => reply(res).await,
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::watch;

/// A trigger-once cancellation signal shared by all of its clones.
///
/// ```rust
/// use microbus_core::ShutdownSignal;
///
/// let lifetime = ShutdownSignal::new();
/// let observer = lifetime.clone();
/// lifetime.trigger();
/// assert!(observer.is_shutdown());
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// A signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Fires the signal. Firing again has no effect.
    pub fn trigger(&self) {
        self.state.send_if_modified(|fired| !std::mem::replace(fired, true));
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.state.borrow()
    }

    /// Completes once the signal fires, or right away if it already has.
    pub fn recv(&self) -> ShutdownReceiver {
        let mut state = self.state.subscribe();
        ShutdownReceiver {
            fired: Box::pin(async move {
                // An error means every clone of the signal is gone
                let _ = state.wait_for(|fired| *fired).await;
            }),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`ShutdownSignal::recv`].
pub struct ShutdownReceiver {
    fired: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Future for ShutdownReceiver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.fired.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for ShutdownReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownReceiver").finish_non_exhaustive()
    }
}

/// Completes on SIGINT or SIGTERM (Ctrl+C outside Unix).
///
/// Never completes if the handlers cannot be installed.
pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Cannot listen for interrupts");
                return std::future::pending().await;
            }
        };
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Interrupted");
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for interrupts");
            return std::future::pending().await;
        }
        tracing::info!(signal = "ctrl-c", "Interrupted");
    }
}

/// Counts running handlers, background jobs or connections.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    count: Arc<watch::Sender<usize>>,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTracker {
    /// Nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Counts one unit of work until the returned token drops.
    #[must_use]
    pub fn acquire(&self) -> InFlightToken {
        self.count.send_modify(|n| *n += 1);
        InFlightToken {
            count: Arc::clone(&self.count),
        }
    }

    /// Units currently in flight.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits up to `timeout` for the count to reach zero. Returns whether it
    /// did.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        let drained = tokio::time::timeout(timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|res| res.is_ok());
        drained
    }
}

/// One unit of work counted by an [`InFlightTracker`].
#[derive(Debug)]
pub struct InFlightToken {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_receiver_completes() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receiver_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = tokio::spawn(signal.recv());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracker_drains() {
        let tracker = InFlightTracker::new();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.count(), 2);
        drop(first);
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(second);
        });
        assert!(tracker.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(tracker.count(), 0);
    }
}
