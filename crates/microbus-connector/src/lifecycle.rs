//! Startup and shutdown of a connector.
//!
//! # Execution Order
//!
//! - **Startup**: validate, connect, fetch config, run startup callbacks in
//!   registration order, activate subscriptions, start tickers.
//! - **Shutdown**: stop tickers, deactivate subscriptions, drain in-flight
//!   handlers, run shutdown callbacks in reverse registration order, cancel
//!   the lifetime context.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use microbus_core::ids::validate_hostname;
use microbus_core::{MicrobusError, MicrobusResult, ShutdownSignal};
use microbus_transport::fragment::DEFAULT_INACTIVITY_TIMEOUT;
use microbus_transport::{MemoryBus, Transport};
use tracing::{debug, error, info, warn};

use crate::dispatch::catch_panic;
use crate::{Connector, State, SHUTDOWN_DRAIN_TIMEOUT, STARTUP_TIMEOUT};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

impl Connector {
    /// Starts the connector.
    ///
    /// On failure the connector is left unstarted and may be started again.
    pub async fn startup(&self) -> MicrobusResult<()> {
        if self
            .inner
            .state
            .compare_exchange(
                State::Unstarted as u8,
                State::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(MicrobusError::internal(format!(
                "{} is already started",
                self.hostname()
            )));
        }

        match self.do_startup().await {
            Ok(()) => {
                self.inner.state.store(State::Started as u8, Ordering::Release);
                info!(
                    host = %self.hostname(),
                    id = %self.id(),
                    version = self.version(),
                    plane = %self.plane(),
                    deployment = %self.deployment(),
                    "Microservice started"
                );
                Ok(())
            }
            Err(e) => {
                error!(host = %self.hostname(), id = %self.id(), error = %e, "Microservice failed to start");
                self.release();
                self.inner.state.store(State::Unstarted as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn do_startup(&self) -> MicrobusResult<()> {
        validate_hostname(self.hostname())?;
        {
            let mut transport = self.inner.transport.write();
            if transport.is_none() {
                let shared: Arc<dyn Transport> = MemoryBus::shared();
                *transport = Some(shared);
            }
        }
        *self.inner.lifetime.write() = ShutdownSignal::new();
        self.spawn_sweeper();

        let ctx = self.lifetime().with_timeout(STARTUP_TIMEOUT);
        self.fetch_config(&ctx, true).await?;

        let hooks = self.inner.hooks.read().on_startup.clone();
        for hook in hooks {
            let ctx = self.lifetime().with_timeout(STARTUP_TIMEOUT);
            match tokio::time::timeout(STARTUP_TIMEOUT, catch_panic(hook(ctx))).await {
                Ok(result) => result.map_err(MicrobusError::trace)?,
                Err(_) => return Err(MicrobusError::timeout("startup callback timed out")),
            }
        }

        self.bind_all().await?;
        self.run_tickers();
        Ok(())
    }

    /// Stops the connector.
    ///
    /// Shutdown callbacks all run even if some fail; the last failure is
    /// returned.
    pub async fn shutdown(&self) -> MicrobusResult<()> {
        if self
            .inner
            .state
            .compare_exchange(
                State::Started as u8,
                State::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(MicrobusError::internal(format!(
                "{} is not started",
                self.hostname()
            )));
        }

        self.stop_tickers();
        self.unbind_all();
        if !self.inner.in_flight.wait_idle(SHUTDOWN_DRAIN_TIMEOUT).await {
            warn!(
                host = %self.hostname(),
                pending = self.inner.in_flight.count(),
                "Shutdown proceeding with requests still in flight"
            );
        }

        let mut last_err = None;
        let hooks = self.inner.hooks.read().on_shutdown.clone();
        for hook in hooks.into_iter().rev() {
            let ctx = self.lifetime().with_timeout(STARTUP_TIMEOUT);
            let result = match tokio::time::timeout(STARTUP_TIMEOUT, catch_panic(hook(ctx))).await {
                Ok(result) => result,
                Err(_) => Err(MicrobusError::timeout("shutdown callback timed out")),
            };
            if let Err(e) = result {
                error!(host = %self.hostname(), error = %e, "Shutdown callback failed");
                last_err = Some(e);
            }
        }

        self.release();
        self.inner.state.store(State::Unstarted as u8, Ordering::Release);
        info!(host = %self.hostname(), id = %self.id(), "Microservice stopped");
        last_err.map_or(Ok(()), Err)
    }

    /// Cancels the lifetime and stops all background work.
    fn release(&self) {
        self.stop_tickers();
        self.unbind_all();
        self.inner.lifetime.read().trigger();
        for task in self.inner.background.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_sweeper(&self) {
        let weak = self.downgrade();
        let lifetime = self.lifetime_signal();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            let stop = lifetime.recv();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(con) = weak.upgrade() else {
                            break;
                        };
                        let expired = con.inner.defrag.sweep(DEFAULT_INACTIVITY_TIMEOUT);
                        if !expired.is_empty() {
                            debug!(host = %con.hostname(), count = expired.len(), "Discarded incomplete messages");
                        }
                        for key in &expired {
                            con.reply_incomplete(key).await;
                        }
                    }
                    () = &mut stop => break,
                }
            }
        });
        self.inner.background.lock().push(handle);
    }
}
