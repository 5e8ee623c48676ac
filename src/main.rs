mod acquisition;
mod aggregator;
mod api;
mod catalog;
mod config;
mod db;
mod error;
mod export;
mod resolver;
mod types;

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::acquisition::http::{PageSource, RenderServiceSource, VerificationServiceSource};
use crate::acquisition::{AcquisitionController, ExtractionSource, Sources};
use crate::api::routes::{router, ApiState};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::db::Store;
use crate::error::Result;
use crate::export::{ArtifactWriter, Exporter};

#[derive(Parser)]
#[command(name = "poller", version, about = "Retail price poller: acquire, reconcile, export")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one acquisition cycle over the whole catalog.
    Acquire,
    /// Re-run the chain for targets queued by failed cycles.
    Retry {
        /// Egress route to try first instead of the direct one.
        #[arg(long)]
        force_route: Option<String>,
    },
    /// Aggregate the store and write the polled artifacts.
    Export,
    /// Serve the same artifacts over HTTP, computed per request.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg, cli.command).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    let store = Store::connect(&cfg.db_path).await?;
    let catalog = Arc::new(Catalog::load(&cfg.catalog_path).await?);
    info!(
        coins = catalog.coins.len(),
        vendors = catalog.vendors.len(),
        targets = catalog.targets.len(),
        agent = %cfg.agent_id,
        "Catalog loaded from {}",
        cfg.catalog_path
    );
    debug!(
        vendors = ?catalog.vendors.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
        "Catalog vendors"
    );

    match command {
        Command::Acquire => {
            let controller = build_controller(&cfg, store)?;
            controller
                .run_cycle(catalog.acquisition_targets(), Utc::now())
                .await?;
        }
        Command::Retry { force_route } => {
            let forced = force_route
                .as_deref()
                .map(|name| cfg.fetch.route(name))
                .transpose()?;
            let controller = build_controller(&cfg, store)?;
            controller
                .run_retry_pass(&catalog.acquisition_targets(), forced, Utc::now())
                .await?;
        }
        Command::Export => {
            let exporter = Exporter::new(store, catalog, cfg.windows.clone(), cfg.thresholds.clone());
            exporter
                .run(Utc::now(), &ArtifactWriter::new(&cfg.output_dir))
                .await?;
        }
        Command::Serve => {
            let exporter = Exporter::new(
                store.clone(),
                catalog,
                cfg.windows.clone(),
                cfg.thresholds.clone(),
            );
            let app = router(ApiState { store, exporter });
            let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
            let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
            info!("HTTP API listening on {bind_addr}");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

fn build_controller(cfg: &Config, store: Store) -> Result<AcquisitionController> {
    let rendered = match &cfg.fetch.render_service_url {
        Some(url) => Some(Arc::new(RenderServiceSource::new(url, &cfg.fetch)?) as Arc<dyn ExtractionSource>),
        None => None,
    };
    let verification = match &cfg.fetch.verify_service_url {
        Some(url) => {
            Some(Arc::new(VerificationServiceSource::new(url, &cfg.fetch)?) as Arc<dyn ExtractionSource>)
        }
        None => None,
    };
    if rendered.is_none() {
        info!("RENDER_SERVICE_URL not set, rendered fallback disabled");
    }
    if verification.is_none() {
        info!("VERIFY_SERVICE_URL not set, verification readings disabled");
    }

    let sources = Sources {
        primary: Arc::new(PageSource::new(&cfg.fetch)),
        rendered,
        verification,
    };
    Ok(AcquisitionController::new(
        store,
        sources,
        cfg.fetch.egress_proxies.clone(),
        cfg.agent_id.clone(),
        cfg.windows.width,
        (cfg.fetch.jitter_min_ms, cfg.fetch.jitter_max_ms),
    ))
}
