//! HTTP API for health checks, swap inspection, and operator commands
//!
//! `POST /retry` is the only path that clears a FailedTo* state; nothing in
//! the engine retries a failed action on its own. The order endpoints are
//! the engine-side halves of order placement: they persist the local record
//! and call the order book, nothing more.

use crate::config::ApiConfig;
use crate::error::{SettlerError, SettlerResult};
use crate::orderbook::OrderbookApi;
use crate::store::SwapLedger;
use crate::types::{hash_secret, new_secret};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<SwapLedger>,
    pub orderbook: Arc<dyn OrderbookApi>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    ledger: Arc<SwapLedger>,
    orderbook: Arc<dyn OrderbookApi>,
) -> SettlerResult<()> {
    let state = AppState { ledger, orderbook };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/swaps/:account", get(list_swaps))
        .route("/retry", post(retry_swap))
        .route("/orders", post(create_order))
        .route("/orders/:id/fill", post(fill_order))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the ledger is reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(()) => (StatusCode::OK, Json(ReadinessResponse { ready: true })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse { ready: false }),
        ),
    }
}

/// All local swap records for an account
async fn list_swaps(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<Vec<SwapSummary>>, ApiError> {
    let records = state.ledger.list_all(&account).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| SwapSummary {
                secret_hash: r.secret_hash,
                order_id: r.order_id,
                state: r.state.to_string(),
                last_error: r.last_error,
                initiate_tx_hash: r.initiate_tx_hash,
                redeem_tx_hash: r.redeem_tx_hash,
                refund_tx_hash: r.refund_tx_hash,
                updated_at: r.updated_at.to_string(),
            })
            .collect(),
    ))
}

/// Operator path: roll a FailedTo* record back to its retry target
async fn retry_swap(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, ApiError> {
    let target = state
        .ledger
        .retry(&request.account, &request.secret_hash)
        .await?;
    Ok(Json(RetryResponse {
        state: target.to_string(),
    }))
}

/// Place a new order: generate the secret, persist the record, then call
/// the order book and bind the assigned id.
async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderApiRequest>,
) -> Result<Json<CreateOrderApiResponse>, ApiError> {
    let secret = new_secret();
    let secret_hex = hex::encode(secret);
    let secret_hash = hex::encode(hash_secret(&secret));

    state
        .ledger
        .create_record(&request.account, &secret_hash, Some(&secret_hex), 0)
        .await?;

    let order_id = state
        .orderbook
        .create_order(
            &request.from_address,
            &request.to_address,
            &request.pair,
            &request.send_amount,
            &request.receive_amount,
            &secret_hash,
        )
        .await?;
    state
        .ledger
        .bind_order(&request.account, &secret_hash, order_id)
        .await?;

    info!(
        account = %request.account,
        order_id,
        secret_hash = %secret_hash,
        "order placed"
    );
    Ok(Json(CreateOrderApiResponse {
        order_id,
        secret_hash,
    }))
}

/// Fill an existing order: persist the taker record (hash only), then call
/// the order book.
async fn fill_order(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<FillOrderApiRequest>,
) -> Result<StatusCode, ApiError> {
    let order = state.orderbook.get_order(id).await?;
    state
        .ledger
        .create_record(&request.account, &order.secret_hash, None, id)
        .await?;
    state
        .orderbook
        .fill_order(id, &request.from_address, &request.to_address)
        .await?;

    info!(account = %request.account, order_id = id, "order filled");
    Ok(StatusCode::OK)
}

// Request/response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
}

#[derive(Serialize)]
struct SwapSummary {
    secret_hash: String,
    order_id: u64,
    state: String,
    last_error: Option<String>,
    initiate_tx_hash: Option<String>,
    redeem_tx_hash: Option<String>,
    refund_tx_hash: Option<String>,
    updated_at: String,
}

#[derive(Deserialize)]
struct RetryRequest {
    account: String,
    secret_hash: String,
}

#[derive(Serialize)]
struct RetryResponse {
    state: String,
}

#[derive(Deserialize)]
struct CreateOrderApiRequest {
    account: String,
    from_address: String,
    to_address: String,
    pair: String,
    send_amount: String,
    receive_amount: String,
}

#[derive(Serialize)]
struct CreateOrderApiResponse {
    order_id: u64,
    secret_hash: String,
}

#[derive(Deserialize)]
struct FillOrderApiRequest {
    account: String,
    from_address: String,
    to_address: String,
}

/// Engine errors mapped onto HTTP statuses
struct ApiError(SettlerError);

impl From<SettlerError> for ApiError {
    fn from(e: SettlerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            SettlerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SettlerError::DuplicateKey { .. } => StatusCode::CONFLICT,
            SettlerError::NotRetryable { .. } | SettlerError::IllegalTransition { .. } => {
                StatusCode::CONFLICT
            }
            SettlerError::Orderbook(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
