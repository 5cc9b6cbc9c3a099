use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::payments;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        // Health
        .route("/health", get(payments_health))
        // Initiation
        .route("/contributions", post(payments::initiate_contribution))
        .route("/loans/:loan_id/repayments", post(payments::initiate_loan_repayment))
        .route("/penalties/:penalty_id", post(payments::initiate_penalty_payment))
        // Asynchronous outcome delivery
        .route("/callback", post(payments::stk_callback))
        // Active status check (funnels through the same reconcile path)
        .route("/status/:checkout_id", get(payments::check_payment_status))
        // Listing
        .route("/transactions", get(payments::my_transactions))
}

async fn payments_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "payments",
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "callback", "status-query", "recovery-sweep"]
    }))
}
