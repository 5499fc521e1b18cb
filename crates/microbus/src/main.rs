//! Microbus - Entry point
//!
//! Runs the configurator and the HTTP ingress. Settings are read from the
//! environment (and `.env`): `MICROBUS_PLANE`, `MICROBUS_DEPLOYMENT`,
//! `MICROBUS_NATS`, `MICROBUS_LOG_LEVEL` and `MICROBUS_LOG_FORMAT`.

use std::process::ExitCode;

use anyhow::Context as _;
use tracing::{error, info};

use microbus::config::ConfigLoader;
use microbus::telemetry::{init_telemetry, TelemetryGuard};
use microbus::{Application, Configurator, Ingress};

/// Exit code when the application fails to start.
const EXIT_STARTUP_FAILED: u8 = 19;

async fn boot() -> anyhow::Result<(Application, TelemetryGuard)> {
    let config = ConfigLoader::new()
        .with_dotenv()
        .with_env_prefix("MICROBUS")
        .load()
        .context("loading settings")?;
    let guard = init_telemetry(config.telemetry("microbus")).context("initializing telemetry")?;

    let app = Application::from_config(&config)
        .await
        .context("connecting to the bus")?;
    app.add_service(Configurator::new());
    app.add_service(Ingress::new());

    info!(version = env!("CARGO_PKG_VERSION"), plane = %app.plane(), "Starting Microbus");
    app.startup().await.context("starting microservices")?;
    Ok((app, guard))
}

#[tokio::main]
async fn main() -> ExitCode {
    let (app, _guard) = match boot().await {
        Ok(booted) => booted,
        Err(e) => {
            // Logging may not be up yet
            eprintln!("Microbus failed to start: {e:#}");
            error!(error = %format!("{e:#}"), "Microbus failed to start");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };

    app.wait_for_interrupt().await;

    if let Err(e) = app.shutdown().await {
        error!(error = %e, "Microbus failed to shut down cleanly");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
