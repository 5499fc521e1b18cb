//! A collection of microservices that start and stop together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use microbus_config::MicrobusConfig;
use microbus_connector::{Service, CONFIGURATOR_HOSTNAME};
use microbus_core::ids::random_id;
use microbus_core::{wait_for_os_signal, Deployment, MicrobusError, MicrobusResult, ShutdownSignal};
use microbus_transport::Transport;
use parking_lot::RwLock;
use tracing::{error, info, warn};

/// Default time allowed for all microservices to start.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Default time allowed for each microservice to stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Plane of applications created with [`Application::new`].
pub const DEFAULT_PLANE: &str = "microbus";

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const STAGGER: Duration = Duration::from_millis(1);
const TESTING_PLANE_LEN: usize = 8;

/// Microservices added together.
type Group = Vec<Arc<dyn Service>>;

/// Runs microservices on a common plane.
///
/// Microservices are added in groups. Groups start one after the other in
/// the order they were added, and the microservices of a group start in
/// parallel. The configurator, if present, always starts first. Shutdown
/// goes in the reverse order.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use microbus::{Application, Connector};
/// use microbus::connector::Service;
///
/// # async fn run() -> microbus::core::MicrobusResult<()> {
/// let app = Application::new();
/// let group: Vec<Arc<dyn Service>> = vec![
///     Arc::new(Connector::new("alpha.example")),
///     Arc::new(Connector::new("beta.example")),
/// ];
/// app.add(group);
/// app.run().await
/// # }
/// ```
pub struct Application {
    groups: RwLock<Vec<Group>>,
    plane: String,
    deployment: Deployment,
    transport: Option<Arc<dyn Transport>>,
    interrupt: ShutdownSignal,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    /// Creates an application on the default plane in the `LOCAL`
    /// deployment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_plane(DEFAULT_PLANE, Deployment::Local)
    }

    /// Creates an application for tests, on a random plane so that
    /// concurrent tests do not see each other's traffic.
    #[must_use]
    pub fn new_testing() -> Self {
        Self::with_plane(&random_id(TESTING_PLANE_LEN), Deployment::Testing)
    }

    /// Creates an application from process settings, connecting to the bus
    /// they name.
    pub async fn from_config(config: &MicrobusConfig) -> MicrobusResult<Self> {
        config.validate()?;
        let transport = microbus_transport::connect(&config.nats).await?;
        let mut app = Self::with_plane(&config.plane, config.deployment());
        app.transport = Some(transport);
        Ok(app)
    }

    fn with_plane(plane: &str, deployment: Deployment) -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            plane: plane.to_string(),
            deployment,
            transport: None,
            interrupt: ShutdownSignal::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Sets the transport of all microservices. Without one, microservices
    /// use the shared in-process bus.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the time allowed for startup, retries included.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets the time allowed for each microservice to stop.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The plane of the application.
    #[must_use]
    pub fn plane(&self) -> &str {
        &self.plane
    }

    /// The deployment of the application.
    #[must_use]
    pub const fn deployment(&self) -> Deployment {
        self.deployment
    }

    /// Adds a group of microservices that start in parallel.
    pub fn add(&self, services: impl IntoIterator<Item = Arc<dyn Service>>) {
        let group: Group = services.into_iter().collect();
        if !group.is_empty() {
            self.groups.write().push(group);
        }
    }

    /// Adds a single microservice as its own group.
    pub fn add_service<S: Service>(&self, service: S) {
        self.groups.write().push(vec![Arc::new(service)]);
    }

    /// Removes the microservices with the given host name. Returns `true`
    /// if any were removed. Running microservices are not stopped.
    pub fn remove(&self, hostname: &str) -> bool {
        let mut groups = self.groups.write();
        let before: usize = groups.iter().map(Vec::len).sum();
        for group in groups.iter_mut() {
            group.retain(|svc| !svc.connector().hostname().eq_ignore_ascii_case(hostname));
        }
        groups.retain(|g| !g.is_empty());
        let after: usize = groups.iter().map(Vec::len).sum();
        before != after
    }

    /// All microservices, in startup order.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.groups.read().iter().flatten().cloned().collect()
    }

    /// Starts all microservices.
    ///
    /// A microservice that fails to start is retried every second until the
    /// startup timeout, after which the last error is returned and the
    /// microservices already started are shut down.
    pub async fn startup(&self) -> MicrobusResult<()> {
        self.hoist_configurator();
        let groups = self.groups.read().clone();
        let deadline = Instant::now() + self.startup_timeout;
        info!(plane = %self.plane, deployment = %self.deployment, "Starting application");

        for group in &groups {
            for svc in group {
                self.prepare(svc.as_ref())?;
            }
            let results = join_all(group.iter().enumerate().map(|(i, svc)| async move {
                let stagger = STAGGER.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
                tokio::time::sleep(stagger).await;
                start_with_retry(svc.as_ref(), deadline).await
            }))
            .await;
            if let Some(err) = results.into_iter().filter_map(Result::err).last() {
                error!(plane = %self.plane, error = %err, "Application failed to start");
                if let Err(e) = self.shutdown().await {
                    warn!(error = %e, "Failed to stop microservices after startup failure");
                }
                return Err(err);
            }
        }
        info!(plane = %self.plane, services = groups.iter().map(Vec::len).sum::<usize>(), "Application started");
        Ok(())
    }

    /// Stops all running microservices, in reverse order. All are stopped
    /// even if some fail; the last error is returned.
    pub async fn shutdown(&self) -> MicrobusResult<()> {
        let groups = self.groups.read().clone();
        let mut last_err = None;
        for group in groups.iter().rev() {
            let results = join_all(
                group
                    .iter()
                    .filter(|svc| svc.connector().is_started())
                    .map(|svc| async move {
                        tokio::time::timeout(self.shutdown_timeout, svc.connector().shutdown())
                            .await
                            .unwrap_or_else(|_| {
                                Err(MicrobusError::timeout(format!(
                                    "{} did not stop in time",
                                    svc.connector().hostname()
                                )))
                            })
                    }),
            )
            .await;
            for result in results {
                if let Err(e) = result {
                    warn!(error = %e, "Microservice failed to stop");
                    last_err = Some(e);
                }
            }
        }
        info!(plane = %self.plane, "Application stopped");
        last_err.map_or(Ok(()), Err)
    }

    /// Waits for SIGINT, SIGTERM or [`Application::interrupt`].
    pub async fn wait_for_interrupt(&self) {
        tokio::select! {
            () = wait_for_os_signal() => {}
            () = self.interrupt.recv() => {}
        }
    }

    /// Releases [`Application::wait_for_interrupt`].
    pub fn interrupt(&self) {
        self.interrupt.trigger();
    }

    /// Starts up, waits for an interrupt and shuts down.
    pub async fn run(&self) -> MicrobusResult<()> {
        self.startup().await?;
        self.wait_for_interrupt().await;
        self.shutdown().await
    }

    /// Moves the configurator into its own group at the front.
    fn hoist_configurator(&self) {
        let mut groups = self.groups.write();
        let mut found = None;
        for group in groups.iter_mut() {
            if let Some(pos) = group
                .iter()
                .position(|svc| svc.connector().hostname() == CONFIGURATOR_HOSTNAME)
            {
                found = Some(group.remove(pos));
                break;
            }
        }
        if let Some(cfg) = found {
            groups.retain(|g| !g.is_empty());
            groups.insert(0, vec![cfg]);
        }
    }

    fn prepare(&self, svc: &dyn Service) -> MicrobusResult<()> {
        let con = svc.connector();
        if con.is_started() {
            return Ok(());
        }
        con.set_plane(&self.plane)?;
        con.set_deployment(self.deployment)?;
        if let Some(transport) = &self.transport {
            con.set_transport(Arc::clone(transport))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts: Vec<Vec<String>> = self
            .groups
            .read()
            .iter()
            .map(|g| g.iter().map(|s| s.connector().hostname().to_string()).collect())
            .collect();
        f.debug_struct("Application")
            .field("plane", &self.plane)
            .field("deployment", &self.deployment)
            .field("groups", &hosts)
            .finish_non_exhaustive()
    }
}

async fn start_with_retry(svc: &dyn Service, deadline: Instant) -> MicrobusResult<()> {
    let con = svc.connector();
    if con.is_started() {
        return Ok(());
    }
    loop {
        match con.startup().await {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() + RETRY_INTERVAL >= deadline => return Err(e),
            Err(e) => {
                warn!(host = %con.hostname(), error = %e, "Microservice failed to start, retrying");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}
