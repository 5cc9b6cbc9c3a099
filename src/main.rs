use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod database;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use database::connection::get_db_client;
use services::daraja::DarajaService;
use services::initiation::PaymentInitiator;
use services::ledger::MongoLedger;
use services::notifier::MongoNotifier;
use services::reconciler::PaymentReconciler;
use services::recovery::run_stuck_pending_sweep;
use services::transactions::MongoTransactionRepo;
use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env();
    tracing::info!("📱 Short code: {}", config.mpesa_short_code);
    tracing::info!("🌐 Environment: {}", config.mpesa_environment);

    let db = get_db_client(&config.database_url, &config.database_name).await;
    let app_state = initialize_app_state(db, config.clone()).await;

    // Stuck-pending transactions are re-driven through the status-query path.
    tokio::spawn(run_stuck_pending_sweep(
        app_state.daraja.clone(),
        app_state.transactions.clone(),
        app_state.reconciler.clone(),
        config.stuck_pending_minutes,
    ));

    let app = build_router(app_state);
    start_server(app, &config).await;
}

async fn initialize_app_state(db: mongodb::Database, config: AppConfig) -> AppState {
    let daraja = Arc::new(DarajaService::new(config));

    // Verify gateway credentials up front; a failure here is not fatal, the
    // token is re-requested on first use.
    match daraja.access_token().await {
        Ok(_) => tracing::info!("✅ Daraja access token obtained"),
        Err(e) => tracing::warn!("❌ Could not obtain daraja access token yet: {}", e),
    }

    let transactions = Arc::new(MongoTransactionRepo::new(&db));
    let ledger = Arc::new(MongoLedger::new(&db));
    let notifier = Arc::new(MongoNotifier::new(&db));

    let initiator = Arc::new(PaymentInitiator::new(daraja.clone(), transactions.clone()));
    let reconciler = Arc::new(PaymentReconciler::new(
        transactions.clone(),
        ledger.clone(),
        notifier.clone(),
    ));

    AppState {
        db,
        daraja,
        transactions,
        ledger,
        notifier,
        initiator,
        reconciler,
    }
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/payments", routes::payments::payment_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn start_server(app: Router, config: &AppConfig) {
    let addr = SocketAddr::new(
        config.host.parse().expect("HOST must be a valid IP address"),
        config.port,
    );

    tracing::info!("🚀 Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            axum::serve(listener, app).await.unwrap();
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "🪙 Chama Payments API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
