use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use labsync_relay::{
    auth::jwt::JwtAccessTokenService,
    build_router,
    config::{LogFormat, RelayConfig},
    cors::cors_layer,
    db::migrations::run_migrations,
    hub::LabHub,
    store::{EditSink, LabStore},
    ws::SessionTickets,
    RelayServices,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TICKET_PRUNE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set LABSYNC_RELAY_JWT_SECRET in production");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let hub = Arc::new(build_hub(&config).await?);
    let _sweeper = hub.spawn_sweeper(config.heartbeat_interval);

    let tickets = SessionTickets::default();
    let _pruner = spawn_ticket_pruner(tickets.clone());

    let app = build_router(RelayServices {
        jwt_service,
        hub,
        tickets,
        ws_base_url: config.ws_base_url.clone(),
        heartbeat_interval: config.heartbeat_interval,
        ingest_token: config.ingest_token.clone(),
    })
    .layer(cors_layer(config.cors_origins.as_deref()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        persistent = config.database_url.is_some(),
        capture_enabled = config.ingest_token.is_some(),
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn build_hub(config: &RelayConfig) -> anyhow::Result<LabHub> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("LABSYNC_RELAY_DATABASE_URL not set; running on the in-memory store");
        return Ok(LabHub::in_memory(config.hub_config()));
    };

    let store = LabStore::connect(database_url).await?;
    let Some(pool) = store.pool().cloned() else {
        anyhow::bail!("postgres store did not expose a pool");
    };
    run_migrations(&pool).await.context("failed to run relay migrations")?;

    let hub = LabHub::new(config.hub_config(), store, EditSink::Postgres(pool.clone()));
    let recovered = hub
        .sequencer()
        .recover_from_change_log(&pool)
        .await
        .context("failed to recover lab sequence counters")?;
    info!(labs = recovered, "recovered lab sequence counters");
    Ok(hub)
}

fn spawn_ticket_pruner(tickets: SessionTickets) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICKET_PRUNE_PERIOD);
        loop {
            ticker.tick().await;
            let pruned = tickets.prune_expired(Utc::now()).await;
            if pruned > 0 {
                info!(pruned, "pruned expired session tickets");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
