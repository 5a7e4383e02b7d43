use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use solcast_forecast::config::Config;
use solcast_forecast::engine::{AppState, StartStatus};
use solcast_forecast::scheduler::{PeriodicTaskConfig, TaskScheduler};
use solcast_forecast::solcast::SolcastClient;
use solcast_forecast::{api, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    telemetry::init_tracing(&cfg.logging);
    let client = SolcastClient::new(&cfg.solcast).context("building HTTP client")?;
    let app_state = AppState::new(cfg.clone(), Arc::new(client))?;

    match app_state.engine.start().await? {
        StartStatus::Sites { reason } => {
            error!(?reason, "no rooftop sites available, serving status only");
        }
        status => {
            if let StartStatus::DataIncompatible { found } = status {
                warn!(
                    found,
                    "stored forecast history used an incompatible schema and was refetched"
                );
            }
            let scheduler = Arc::new(TaskScheduler::with_config(
                app_state.engine.clone(),
                PeriodicTaskConfig::from(&cfg.scheduler),
            ));
            scheduler.start();
        }
    }

    let app = api::router(app_state);
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("server binding to 0.0.0.0, the API is reachable from the network without authentication");
    }
    info!(%addr, "starting solcast forecast service");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
