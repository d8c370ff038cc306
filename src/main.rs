//! Tradewarden - headless per-user trading supervisor.
//!
//! Starts one supervisor per configured user, the LTP stream, and the HTTP
//! control surface. No UI; operators watch structured logs and the control
//! endpoints.
//!
//! # Usage
//! ```sh
//! USER_IDS=1,2 DATABASE_URL=sqlite://data/tradewarden.db cargo run
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::prelude::*;
use tradewarden::application::bootstrap::Application;
use tradewarden::application::supervisor::ServiceMode;
use tradewarden::config::Config;
use tradewarden::infrastructure::mock::FixedRecommendationSource;
use tradewarden::interfaces::api::{ApiState, router};

#[derive(Debug, Parser)]
#[command(name = "tradewarden", about = "Per-user trading supervisor")]
struct Args {
    /// Start supervisors for the configured users immediately
    #[arg(long, default_value_t = true)]
    autostart: bool,

    /// Bind address for the control surface (overrides API_BIND_ADDRESS)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Tradewarden {} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.api_bind_address = bind;
    }
    info!(
        "Configuration loaded: {} users, market {}-{}, db {}",
        config.user_ids.len(),
        config.market.market_open,
        config.market.market_close,
        config.database_url
    );

    // The analysis pipeline is an external collaborator; until one is
    // wired in, the buy task sees an empty recommendation list
    let recommendations = Arc::new(FixedRecommendationSource::empty());
    warn!("No recommendation source configured; buy_orders will be a no-op");

    let app = Application::build(config.clone(), recommendations).await?;

    if args.autostart {
        for &user_id in &config.user_ids {
            app.service_manager
                .start(user_id, ServiceMode::Unified)
                .await?;
        }
        info!("Started unified supervisors for {} users", config.user_ids.len());
    }

    let state = Arc::new(ApiState {
        orders: app.orders.clone(),
        order_services: app.order_services.clone(),
        manager: app.service_manager.clone(),
        admin_token: config.admin_token.clone(),
    });

    let listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("Control surface listening on {}", config.api_bind_address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received.");
        })
        .await?;

    // Cooperative shutdown: in-flight ticks complete, broker orders stay live
    for &user_id in &config.user_ids {
        if let Err(e) = app.service_manager.stop(user_id).await {
            warn!("Shutdown: stop for user {} reported: {:#}", user_id, e);
        }
    }
    info!("Goodbye.");

    Ok(())
}
