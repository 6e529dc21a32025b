use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod database;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use database::connection::get_pool;
use services::mpesa_service::{MpesaGateway, TokenCache};
use services::notifications::{run_dispatcher, SmsClient};
use services::sweeps;
use state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match get_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to Postgres: {}", e);
            std::process::exit(1);
        }
    };

    let mpesa = match MpesaGateway::new((*config).clone(), Arc::new(TokenCache::new())) {
        Ok(gateway) => {
            if gateway.is_mock() {
                tracing::warn!("M-Pesa gateway running in mock mode");
            } else {
                tracing::info!("M-Pesa gateway initialized");
            }
            Arc::new(gateway)
        }
        Err(e) => {
            tracing::error!("Failed to initialize M-Pesa gateway: {}", e);
            std::process::exit(1);
        }
    };

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let sms = SmsClient::new(
        config.sms_api_key.clone(),
        config.sms_username.clone(),
        config.sms_from.clone(),
    );
    tokio::spawn(run_dispatcher(
        events_rx,
        sms,
        config.admin_alert_phone.clone(),
    ));

    let app_state = AppState::new(pool, config.clone(), mpesa, events_tx);

    tokio::spawn(sweeps::run_scheduler(app_state.clone(), SWEEP_INTERVAL));

    let app = build_router(app_state);
    start_server(app, &config).await;
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/bookings", routes::bookings::routes(app_state.clone()))
        .nest("/api", routes::bookings::public_routes())
        .nest("/api/payments", routes::payments::routes(app_state.clone()))
        .nest("/api/payments", routes::payments::webhook_routes())
        .layer(cors)
        .with_state(app_state)
}

async fn start_server(app: Router, config: &AppConfig) {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    tracing::info!("🚀 Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "🚛 UsafiLink Exhauster Services API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    let db_status = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "mpesa_mock": state.mpesa.is_mock(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
