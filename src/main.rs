use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::info;
use tracing_subscriber::EnvFilter;

use groupchan_core::bus::LocalBus;
use groupchan_core::config::Config;
use groupchan_core::db;
use groupchan_core::gateway;
use groupchan_core::registry::SubscriptionRegistry;
use groupchan_core::service::ChannelService;
use groupchan_core::state::AppState;
use groupchan_core::store::{PgChannelStore, PgUserDirectory};

async fn health_check() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "groupchan_core=info,sqlx=warn".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("groupchan-core starting");

    let config = Config::from_env().expect("failed to load configuration");
    info!("configuration loaded");

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");
    db::health_check(&pool).await.expect("database health check failed");
    info!("database connection established");

    let store = Arc::new(PgChannelStore::new(pool.clone()));
    let users = Arc::new(PgUserDirectory::new(pool));
    let bus = Arc::new(LocalBus::new());

    let service = ChannelService::new(
        store,
        bus.clone(),
        users,
        config.retry_max_attempts,
        config.retry_backoff,
    );
    let registry = SubscriptionRegistry::new(bus, config.session_max_duration);
    let app_state = AppState { service, registry };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(gateway::router())
        .with_state(app_state);

    let addr = config.server_addr();
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("server failed to start");
}
