//! The [`Connector`] type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use microbus_core::{
    BoxFuture, Context, Deployment, Handler, InFlightTracker, MicrobusError, MicrobusResult,
    Request, ShutdownSignal,
};
use microbus_transport::{DefragMap, Transport};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{Changed, ConfigEntry};
use crate::dcache::CacheState;
use crate::subscription::{Endpoint, Route, RouteTable, SubscriptionOptions};
use crate::ticker::Ticker;
use crate::{DEFAULT_ACK_TIMEOUT, DEFAULT_TIME_BUDGET};

/// A lifecycle callback.
pub type LifecycleHook = Arc<dyn Fn(Context) -> BoxFuture<'static, MicrobusResult<()>> + Send + Sync>;

/// A callback invoked with the names of changed config properties.
pub type ConfigChangedHook =
    Arc<dyn Fn(Context, Changed) -> BoxFuture<'static, MicrobusResult<()>> + Send + Sync>;

/// A microservice: anything built around a [`Connector`].
pub trait Service: Send + Sync + 'static {
    /// The connector of the microservice.
    fn connector(&self) -> &Connector;
}

impl Service for Connector {
    fn connector(&self) -> &Connector {
        self
    }
}

/// Lifecycle state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Not running.
    Unstarted = 0,
    /// Running the startup sequence.
    Starting = 1,
    /// Serving requests.
    Started = 2,
    /// Running the shutdown sequence.
    Stopping = 3,
}

impl State {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Unstarted,
        }
    }
}

#[derive(Default)]
pub(crate) struct Hooks {
    pub on_startup: Vec<LifecycleHook>,
    pub on_shutdown: Vec<LifecycleHook>,
    pub on_config_changed: Vec<ConfigChangedHook>,
}

pub(crate) struct Inner {
    pub hostname: String,
    pub id: String,
    pub description: RwLock<String>,
    pub version: AtomicU32,
    pub plane: RwLock<String>,
    pub deployment: RwLock<Deployment>,
    pub transport: RwLock<Option<Arc<dyn Transport>>>,
    pub state: AtomicU8,
    pub lifetime: RwLock<ShutdownSignal>,
    pub in_flight: InFlightTracker,
    pub time_budget: RwLock<Duration>,
    pub ack_timeout: RwLock<Duration>,
    pub endpoints: RwLock<IndexMap<String, Arc<Endpoint>>>,
    pub routes: RwLock<RouteTable>,
    pub readers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    pub tickers: RwLock<IndexMap<String, Arc<Ticker>>>,
    pub ticker_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    pub background: Mutex<Vec<JoinHandle<()>>>,
    pub configs: RwLock<IndexMap<String, ConfigEntry>>,
    pub hooks: RwLock<Hooks>,
    pub defrag: DefragMap<Request>,
    pub cache: CacheState,
}

/// The bus endpoint of a microservice.
///
/// A connector owns the subscriptions, tickers, config properties and
/// outgoing calls of one microservice instance. It is cheap to clone; all
/// clones share the same instance.
///
/// # Example
///
/// ```no_run
/// use microbus_connector::Connector;
/// use microbus_core::{Context, Request, Response, ResponseExt};
///
/// # async fn run() -> microbus_core::MicrobusResult<()> {
/// let con = Connector::new("hello.example");
/// con.subscribe("GET", "/hello", |_ctx: Context, _req: Request| async {
///     Ok(Response::text("Hello"))
/// })?;
/// con.startup().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connector {
    pub(crate) inner: Arc<Inner>,
}

/// A non-owning reference to a [`Connector`].
///
/// Handlers registered on a connector hold one of these to call back into
/// it without keeping it alive.
#[derive(Clone, Debug)]
pub struct WeakConnector {
    inner: Weak<Inner>,
}

impl WeakConnector {
    /// The connector, if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Connector> {
        self.inner.upgrade().map(|inner| Connector { inner })
    }
}

impl Connector {
    /// Creates a connector for `hostname`. The host name is folded to lower
    /// case and validated at startup.
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        let con = Self {
            inner: Arc::new(Inner {
                hostname: hostname.trim().to_ascii_lowercase(),
                id: microbus_core::ids::random_lower_id(10),
                description: RwLock::new(String::new()),
                version: AtomicU32::new(0),
                plane: RwLock::new("microbus".to_string()),
                deployment: RwLock::new(Deployment::Local),
                transport: RwLock::new(None),
                state: AtomicU8::new(State::Unstarted as u8),
                lifetime: RwLock::new(ShutdownSignal::new()),
                in_flight: InFlightTracker::new(),
                time_budget: RwLock::new(DEFAULT_TIME_BUDGET),
                ack_timeout: RwLock::new(DEFAULT_ACK_TIMEOUT),
                endpoints: RwLock::new(IndexMap::new()),
                routes: RwLock::new(RouteTable::default()),
                readers: Mutex::new(HashMap::new()),
                tickers: RwLock::new(IndexMap::new()),
                ticker_tasks: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                configs: RwLock::new(IndexMap::new()),
                hooks: RwLock::new(Hooks::default()),
                defrag: DefragMap::new(microbus_transport::fragment::DEFAULT_MAX_MESSAGE_SIZE),
                cache: CacheState::default(),
            }),
        };
        con.subscribe_control();
        con
    }

    /// A non-owning reference to this connector.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnector {
        WeakConnector {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Host name the microservice is addressable by.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Random identifier of this instance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> String {
        self.inner.description.read().clone()
    }

    /// Sets the description.
    pub fn set_description(&self, description: &str) {
        *self.inner.description.write() = description.to_string();
    }

    /// Version of the microservice.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.version.load(Ordering::Relaxed)
    }

    /// Sets the version. Only allowed before startup.
    pub fn set_version(&self, version: u32) -> MicrobusResult<()> {
        self.ensure_unstarted("set the version")?;
        self.inner.version.store(version, Ordering::Relaxed);
        Ok(())
    }

    /// Bus subject namespace.
    #[must_use]
    pub fn plane(&self) -> String {
        self.inner.plane.read().clone()
    }

    /// Sets the plane. Only allowed before startup.
    pub fn set_plane(&self, plane: &str) -> MicrobusResult<()> {
        self.ensure_unstarted("set the plane")?;
        if plane.is_empty() || !plane.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MicrobusError::bad_input(format!(
                "plane must be alphanumeric: '{plane}'"
            )));
        }
        *self.inner.plane.write() = plane.to_string();
        Ok(())
    }

    /// Deployment environment.
    #[must_use]
    pub fn deployment(&self) -> Deployment {
        *self.inner.deployment.read()
    }

    /// Sets the deployment. Only allowed before startup.
    pub fn set_deployment(&self, deployment: Deployment) -> MicrobusResult<()> {
        self.ensure_unstarted("set the deployment")?;
        *self.inner.deployment.write() = deployment;
        Ok(())
    }

    /// Sets the transport. Only allowed before startup. The shared
    /// in-process bus is used when none is set.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) -> MicrobusResult<()> {
        self.ensure_unstarted("set the transport")?;
        *self.inner.transport.write() = Some(transport);
        Ok(())
    }

    /// Default time budget of outgoing requests.
    #[must_use]
    pub fn time_budget(&self) -> Duration {
        *self.inner.time_budget.read()
    }

    /// Sets the default time budget of outgoing requests.
    pub fn set_time_budget(&self, budget: Duration) {
        *self.inner.time_budget.write() = budget;
    }

    /// How long outgoing requests wait for acknowledgements.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        *self.inner.ack_timeout.read()
    }

    /// Sets how long outgoing requests wait for acknowledgements.
    pub fn set_ack_timeout(&self, timeout: Duration) {
        *self.inner.ack_timeout.write() = timeout;
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns `true` once startup completed and until shutdown begins.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == State::Started
    }

    /// A context cancelled when the connector shuts down.
    #[must_use]
    pub fn lifetime(&self) -> Context {
        Context::background().with_cancel(self.inner.lifetime.read().clone())
    }

    pub(crate) fn lifetime_signal(&self) -> ShutdownSignal {
        self.inner.lifetime.read().clone()
    }

    pub(crate) fn transport(&self) -> MicrobusResult<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .clone()
            .ok_or_else(|| MicrobusError::internal(format!("{} is not started", self.hostname())))
    }

    pub(crate) fn ensure_unstarted(&self, what: &str) -> MicrobusResult<()> {
        if self.state() == State::Unstarted {
            Ok(())
        } else {
            Err(MicrobusError::internal(format!(
                "cannot {what} of {} after startup",
                self.hostname()
            )))
        }
    }

    /// Subscribes a handler to a method and route with the default queue.
    ///
    /// Subscriptions made after startup are bound to the bus in the
    /// background.
    pub fn subscribe<H: Handler>(&self, method: &str, route: &str, handler: H) -> MicrobusResult<()> {
        self.subscribe_with(method, route, SubscriptionOptions::new(), handler)
    }

    /// Subscribes a handler with explicit options.
    pub fn subscribe_with<H: Handler>(
        &self,
        method: &str,
        route: &str,
        opts: SubscriptionOptions,
        handler: H,
    ) -> MicrobusResult<()> {
        let route = Route::parse(self.hostname(), route)?;
        let endpoint = Arc::new(Endpoint::new(method, route, &opts, Arc::new(handler)));
        {
            let mut endpoints = self.inner.endpoints.write();
            if endpoints.contains_key(&endpoint.key) {
                return Err(MicrobusError::bad_input(format!(
                    "already subscribed to {}",
                    endpoint.key
                )));
            }
            self.inner.routes.write().insert(&endpoint)?;
            endpoints.insert(endpoint.key.clone(), Arc::clone(&endpoint));
        }
        tracing::debug!(host = %self.hostname(), endpoint = %endpoint.key, "Subscribed");

        if self.state() == State::Started {
            let con = self.clone();
            tokio::spawn(async move {
                if let Err(e) = con.bind(&endpoint).await {
                    tracing::error!(host = %con.hostname(), endpoint = %endpoint.key, error = %e, "Failed to bind subscription");
                }
            });
        }
        Ok(())
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, method: &str, route: &str) -> MicrobusResult<()> {
        let route = Route::parse(self.hostname(), route)?;
        let key = crate::subscription::endpoint_key(method, &route);
        let Some(endpoint) = self.inner.endpoints.write().shift_remove(&key) else {
            return Err(MicrobusError::not_found(format!("not subscribed to {key}")));
        };
        self.inner.routes.write().remove(&endpoint);
        self.unbind(&key);
        tracing::debug!(host = %self.hostname(), endpoint = %key, "Unsubscribed");
        Ok(())
    }

    /// Keys of the current subscriptions, in the form `METHOD https://host:port/path`.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.endpoints.read().keys().cloned().collect()
    }

    /// Registers a callback run during startup, after config is fetched
    /// and before subscriptions are activated. Callbacks run in order of
    /// registration.
    pub fn on_startup<F, Fut>(&self, hook: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MicrobusResult<()>> + Send + 'static,
    {
        self.inner
            .hooks
            .write()
            .on_startup
            .push(Arc::new(move |ctx| Box::pin(hook(ctx))));
    }

    /// Registers a callback run during shutdown. Callbacks run in reverse
    /// order of registration.
    pub fn on_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MicrobusResult<()>> + Send + 'static,
    {
        self.inner
            .hooks
            .write()
            .on_shutdown
            .push(Arc::new(move |ctx| Box::pin(hook(ctx))));
    }

    /// Registers a callback run when config values change.
    pub fn on_config_changed<F, Fut>(&self, hook: F)
    where
        F: Fn(Context, Changed) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MicrobusResult<()>> + Send + 'static,
    {
        self.inner
            .hooks
            .write()
            .on_config_changed
            .push(Arc::new(move |ctx, changed| Box::pin(hook(ctx, changed))));
    }

    /// Spawns a background job bound to the lifetime of the connector.
    ///
    /// The job receives a context carrying the frame and trace of `ctx`,
    /// cancelled at shutdown. Shutdown waits for running jobs.
    pub fn go<F, Fut>(&self, ctx: &Context, job: F)
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = MicrobusResult<()>> + Send + 'static,
    {
        let mut job_ctx = self.lifetime().with_otel(ctx.otel().clone());
        if let Some(headers) = ctx.headers() {
            job_ctx = job_ctx.with_frame(headers.clone());
        }
        let token = self.inner.in_flight.acquire();
        let host = self.hostname().to_string();
        tokio::spawn(async move {
            let _token = token;
            if let Err(e) = job(job_ctx).await {
                tracing::warn!(host = %host, error = %e, "Background job failed");
            }
        });
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("hostname", &self.inner.hostname)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbus_core::{Request, Response, ResponseExt};

    #[test]
    fn test_new_connector() {
        let con = Connector::new("Hello.Example");
        assert_eq!(con.hostname(), "hello.example");
        assert_eq!(con.id().len(), 10);
        assert_eq!(con.plane(), "microbus");
        assert_eq!(con.deployment(), Deployment::Local);
        assert_eq!(con.state(), State::Unstarted);
        assert!(!con.is_started());
        assert_ne!(con.id(), Connector::new("hello.example").id());
    }

    #[test]
    fn test_setters_before_startup() {
        let con = Connector::new("hello.example");
        con.set_version(3).unwrap();
        con.set_plane("p1").unwrap();
        con.set_deployment(Deployment::Testing).unwrap();
        con.set_description("Says hello");
        assert_eq!(con.version(), 3);
        assert_eq!(con.plane(), "p1");
        assert_eq!(con.deployment(), Deployment::Testing);
        assert_eq!(con.description(), "Says hello");
        assert!(con.set_plane("not.valid").is_err());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let con = Connector::new("hello.example");
        let before = con.subscriptions().len();
        con.subscribe("GET", "/echo", |_ctx: Context, _req: Request| async {
            Ok(Response::text("echo"))
        })
        .unwrap();
        assert!(con
            .subscriptions()
            .contains(&"GET https://hello.example:443/echo".to_string()));
        assert!(con
            .subscribe("get", "/echo", |_ctx: Context, _req: Request| async {
                Ok(Response::text("again"))
            })
            .is_err());
        con.unsubscribe("GET", "/echo").unwrap();
        assert_eq!(con.subscriptions().len(), before);
        assert!(con.unsubscribe("GET", "/echo").is_err());
    }

    #[test]
    fn test_weak_connector() {
        let con = Connector::new("hello.example");
        let weak = con.downgrade();
        assert!(weak.upgrade().is_some());
        drop(con);
        assert!(weak.upgrade().is_none());
    }
}
