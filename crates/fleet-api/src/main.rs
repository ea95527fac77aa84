mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env().expect("invalid API configuration");

    // `fleet-api issue-token <subject> [ttl-secs]` prints a bearer token and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("issue-token") {
        let subject = args.get(1).expect("usage: fleet-api issue-token <subject> [ttl-secs]");
        let ttl = args
            .get(2)
            .map(|s| s.parse::<i64>().expect("ttl-secs must be an integer"))
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        let expires_at = chrono::Utc::now().timestamp() + ttl;
        let token = auth::sign(&config.token_secret, subject, expires_at).expect("failed to sign token");
        println!("{token}");
        return;
    }

    // Provisioning subsystem
    let fleet = fleet_infra::FleetConfig::from_env().expect("invalid provisioning configuration");
    let deployer = fleet_infra::build_deployer(fleet)
        .await
        .expect("failed to initialize provisioning subsystem");

    let state = AppState {
        deployer: Arc::new(deployer),
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting fleet API");

    axum::serve(listener, app).await.expect("server error");
}
