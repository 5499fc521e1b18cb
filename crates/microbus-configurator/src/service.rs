//! The `configurator.sys` microservice.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use microbus_config::ConfigError;
use microbus_connector::{
    post_json_request, Connector, Service, State, SubscriptionOptions, ValuesRequest,
    ValuesResponse, CONFIGURATOR_HOSTNAME,
};
use microbus_core::{Context, MicrobusResult, Request, RequestExt, Response, ResponseExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::repository::Repository;

/// How often the fleet is told to refresh its config.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Config files loaded at startup, in order.
pub const CONFIG_FILES: [&str; 2] = ["config.yaml", "config.local.yaml"];

/// Body of `POST https://configurator.sys/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// When the sender's repository last changed.
    pub timestamp: DateTime<Utc>,
    /// The sender's values, by domain.
    pub values: BTreeMap<String, BTreeMap<String, String>>,
}

/// Serves config values to the microservices of the application and keeps
/// its peers in sync.
///
/// # Example
///
/// ```rust,no_run
/// use microbus_configurator::Configurator;
///
/// # async fn run() -> microbus_core::MicrobusResult<()> {
/// let configurator = Configurator::new();
/// configurator.load_yaml("all:\n  TimeBudget: 30s\n")?;
/// configurator.connector().startup().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Configurator {
    con: Connector,
    repo: Arc<RwLock<Repository>>,
    dir: Arc<RwLock<Option<PathBuf>>>,
}

impl Default for Configurator {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for Configurator {
    fn connector(&self) -> &Connector {
        &self.con
    }
}

impl Configurator {
    /// Creates the configurator. Config files are read from the working
    /// directory at startup.
    #[must_use]
    pub fn new() -> Self {
        let svc = Self {
            con: Connector::new(CONFIGURATOR_HOSTNAME),
            repo: Arc::new(RwLock::new(Repository::new())),
            dir: Arc::new(RwLock::new(Some(PathBuf::from(".")))),
        };
        svc.con
            .set_description("The configurator is the central source of config values of the microservices.");
        svc.subscribe_all();
        svc
    }

    /// The connector of the configurator.
    #[must_use]
    pub fn connector(&self) -> &Connector {
        &self.con
    }

    /// Sets the directory config files are read from, or `None` to skip
    /// reading files.
    pub fn set_config_dir(&self, dir: Option<&Path>) {
        *self.dir.write() = dir.map(Path::to_path_buf);
    }

    /// Merges YAML values into the repository.
    pub fn load_yaml(&self, yaml: &str) -> Result<(), ConfigError> {
        self.repo.write().load_yaml(yaml)
    }

    /// A snapshot of the repository.
    #[must_use]
    pub fn repository(&self) -> Repository {
        self.repo.read().clone()
    }

    /// Value of a property for a host.
    #[must_use]
    pub fn value(&self, host: &str, name: &str) -> Option<String> {
        self.repo.read().value(host, name).map(ToString::to_string)
    }

    fn subscribe_all(&self) {
        let weak = self.downgrade();
        let result = self
            .con
            .subscribe("POST", ":443/values", {
                let weak = weak.clone();
                move |_ctx: Context, req: Request| {
                    let svc = weak.upgrade();
                    async move { alive(svc)?.values(&req) }
                }
            })
            .and_then(|()| {
                self.con.subscribe("POST", ":443/refresh", {
                    let weak = weak.clone();
                    move |ctx: Context, _req: Request| {
                        let svc = weak.upgrade();
                        async move {
                            alive(svc)?.refresh(&ctx).await?;
                            Response::json(&serde_json::json!({}))
                        }
                    }
                })
            })
            .and_then(|()| {
                self.con.subscribe_with(
                    "POST",
                    ":443/sync",
                    SubscriptionOptions::new().no_queue(),
                    {
                        let weak = weak.clone();
                        move |ctx: Context, req: Request| {
                            let svc = weak.upgrade();
                            async move {
                                alive(svc)?.sync(&ctx, &req)?;
                                Response::json(&serde_json::json!({}))
                            }
                        }
                    },
                )
            })
            .and_then(|()| {
                self.con.start_ticker("refresh", DEFAULT_REFRESH_INTERVAL, {
                    let weak = weak.clone();
                    move |ctx: Context| {
                        let svc = weak.upgrade();
                        async move { alive(svc)?.periodic(&ctx).await }
                    }
                })
            });
        if let Err(e) = result {
            warn!(error = %e, "Failed to set up configurator endpoints");
        }

        self.con.on_startup({
            let weak = weak.clone();
            move |ctx: Context| {
                let svc = weak.upgrade();
                async move { alive(svc)?.on_startup(&ctx) }
            }
        });
    }

    fn downgrade(&self) -> WeakConfigurator {
        WeakConfigurator {
            con: self.con.downgrade(),
            repo: Arc::downgrade(&self.repo),
            dir: Arc::downgrade(&self.dir),
        }
    }

    fn on_startup(&self, ctx: &Context) -> MicrobusResult<()> {
        let dir = self.dir.read().clone();
        if let Some(dir) = dir {
            let mut repo = self.repo.write();
            for name in CONFIG_FILES {
                let path = dir.join(name);
                if !path.exists() {
                    continue;
                }
                let yaml = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::unreadable(&path, e))?;
                repo.load_yaml(&yaml)?;
                info!(path = %path.display(), "Loaded config file");
            }
        }

        // Announce once subscriptions are active
        let svc = self.clone();
        self.con.go(ctx, move |ctx| async move {
            while svc.con.state() == State::Starting {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(10)) => {}
                    () = ctx.done() => return Ok(()),
                }
            }
            if svc.con.state() != State::Started {
                return Ok(());
            }
            svc.periodic(&ctx).await
        });
        Ok(())
    }

    fn values(&self, req: &Request) -> MicrobusResult<Response> {
        let ValuesRequest { names } = req.json()?;
        let host = req.frame().from_host().to_string();
        let repo = self.repo.read();
        let values: HashMap<String, String> = names
            .into_iter()
            .filter_map(|name| {
                let value = repo.value(&host, &name)?.to_string();
                Some((name, value))
            })
            .collect();
        drop(repo);
        debug!(host = %host, count = values.len(), "Serving config values");
        Response::json(&ValuesResponse { values })
    }

    /// Tells every microservice to refetch its config.
    pub async fn refresh(&self, ctx: &Context) -> MicrobusResult<()> {
        let req = post_json_request("https://all:888/config-refresh", &serde_json::json!({}))?;
        let mut responses = self.con.publish(ctx, req);
        let mut failed = 0;
        while let Some(res) = responses.next().await {
            if let Err(e) = res {
                failed += 1;
                warn!(error = %e, "Config refresh failed");
            }
        }
        info!(failed = failed, "Config refresh sent");
        Ok(())
    }

    /// Broadcasts the repository to peer configurators.
    pub async fn broadcast(&self, ctx: &Context) -> MicrobusResult<()> {
        let body = {
            let repo = self.repo.read();
            SyncRequest {
                timestamp: repo.timestamp(),
                values: repo.to_map(),
            }
        };
        let req = post_json_request(&format!("https://{CONFIGURATOR_HOSTNAME}:443/sync"), &body)?;
        let mut responses = self.con.publish(ctx, req);
        while let Some(res) = responses.next().await {
            if let Err(e) = res {
                debug!(error = %e, "Sync not acknowledged");
            }
        }
        Ok(())
    }

    async fn periodic(&self, ctx: &Context) -> MicrobusResult<()> {
        if let Err(e) = self.broadcast(ctx).await {
            warn!(error = %e, "Failed to sync peers");
        }
        self.refresh(ctx).await
    }

    fn sync(&self, ctx: &Context, req: &Request) -> MicrobusResult<()> {
        let frame = req.frame();
        if frame.from_host() != self.con.hostname() || frame.from_id() == self.con.id() {
            return Ok(());
        }
        let SyncRequest { timestamp, values } = req.json()?;
        let incoming = Repository::from_map(values, timestamp);

        let mut repo = self.repo.write();
        if repo.equals(&incoming) {
            return Ok(());
        }
        // Equal timestamps accept the incoming repository
        if incoming.timestamp() >= repo.timestamp() {
            *repo = incoming;
            drop(repo);
            info!(from = %frame.from_id(), "Accepted newer config from peer");
            return Ok(());
        }
        drop(repo);
        debug!(from = %frame.from_id(), "Local config is newer, broadcasting");
        let svc = self.clone();
        self.con
            .go(ctx, move |ctx| async move { svc.broadcast(&ctx).await });
        Ok(())
    }
}

#[derive(Clone)]
struct WeakConfigurator {
    con: microbus_connector::WeakConnector,
    repo: std::sync::Weak<RwLock<Repository>>,
    dir: std::sync::Weak<RwLock<Option<PathBuf>>>,
}

impl WeakConfigurator {
    fn upgrade(&self) -> Option<Configurator> {
        Some(Configurator {
            con: self.con.upgrade()?,
            repo: self.repo.upgrade()?,
            dir: self.dir.upgrade()?,
        })
    }
}

fn alive(svc: Option<Configurator>) -> MicrobusResult<Configurator> {
    svc.ok_or_else(|| microbus_core::MicrobusError::internal("configurator is gone"))
}
