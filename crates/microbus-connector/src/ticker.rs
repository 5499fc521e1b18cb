//! Recurring jobs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use microbus_core::{BoxFuture, Context, MicrobusError, MicrobusResult};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::dispatch::catch_panic;
use crate::{Connector, State};

/// A ticker callback.
pub type TickerHandler = Arc<dyn Fn(Context) -> BoxFuture<'static, MicrobusResult<()>> + Send + Sync>;

/// A named job run at a fixed interval.
pub(crate) struct Ticker {
    pub name: String,
    pub interval: Duration,
    pub handler: TickerHandler,
    busy: AtomicBool,
    runs: AtomicU64,
}

impl Connector {
    /// Registers a ticker. Its handler runs every `interval` while the
    /// connector is started. A tick is skipped while the previous run is
    /// still in progress, and missed ticks are not made up.
    pub fn start_ticker<F, Fut>(&self, name: &str, interval: Duration, handler: F) -> MicrobusResult<()>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MicrobusResult<()>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(MicrobusError::bad_input(format!(
                "ticker '{name}' must have a positive interval"
            )));
        }
        let ticker = Arc::new(Ticker {
            name: name.to_string(),
            interval,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            busy: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        });
        {
            let mut tickers = self.inner.tickers.write();
            if tickers.contains_key(name) {
                return Err(MicrobusError::bad_input(format!(
                    "ticker '{name}' already defined"
                )));
            }
            tickers.insert(name.to_string(), Arc::clone(&ticker));
        }
        if self.state() == State::Started {
            self.run_ticker(ticker);
        }
        Ok(())
    }

    /// Removes a ticker.
    pub fn stop_ticker(&self, name: &str) {
        self.inner.tickers.write().shift_remove(name);
        if let Some(task) = self.inner.ticker_tasks.lock().remove(name) {
            task.abort();
        }
    }

    /// Number of completed runs of a ticker.
    #[must_use]
    pub fn ticker_runs(&self, name: &str) -> u64 {
        self.inner
            .tickers
            .read()
            .get(name)
            .map_or(0, |t| t.runs.load(Ordering::Relaxed))
    }

    pub(crate) fn run_tickers(&self) {
        let tickers: Vec<Arc<Ticker>> = self.inner.tickers.read().values().cloned().collect();
        for ticker in tickers {
            self.run_ticker(ticker);
        }
    }

    pub(crate) fn stop_tickers(&self) {
        for (_, task) in self.inner.ticker_tasks.lock().drain() {
            task.abort();
        }
    }

    fn run_ticker(&self, ticker: Arc<Ticker>) {
        let weak = self.downgrade();
        let lifetime = self.lifetime_signal();
        let name = ticker.name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + ticker.interval, ticker.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let stop = lifetime.recv();
            tokio::pin!(stop);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(con) = weak.upgrade() else {
                            break;
                        };
                        if ticker.busy.swap(true, Ordering::AcqRel) {
                            debug!(host = %con.hostname(), ticker = %ticker.name, "Skipping tick, previous run in progress");
                            continue;
                        }
                        let ticker = Arc::clone(&ticker);
                        let token = con.inner.in_flight.acquire();
                        let ctx = con.lifetime().with_timeout(con.time_budget());
                        tokio::spawn(async move {
                            let _token = token;
                            let result = catch_panic((ticker.handler)(ctx)).await;
                            if let Err(e) = result {
                                error!(host = %con.hostname(), ticker = %ticker.name, error = %e, "Ticker failed");
                            }
                            ticker.runs.fetch_add(1, Ordering::Relaxed);
                            ticker.busy.store(false, Ordering::Release);
                        });
                    }
                    () = &mut stop => {
                        break;
                    }
                }
            }
        });

        info!(host = %self.hostname(), ticker = %name, "Ticker started");
        if let Some(previous) = self.inner.ticker_tasks.lock().insert(name, handle) {
            previous.abort();
        }
    }
}
