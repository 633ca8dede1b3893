//! HTTP Handlers

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

use meter_billing::{
    BalanceView, BillingError, Cancellation, CheckoutSession, PaymentRequiredReason,
    PaymentStatusView, PaymentTransaction, Payments, PointsPackage, ReconcileOutcome,
    SettlementSummary, SubscriptionPlan, SubscriptionStatusView,
};
use meter_runtime::{CapabilityError, GenerationRequest};

use crate::auth::bearer_token;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
const MAX_HANDOFF_ID_LEN: usize = 128;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub capability: String,
    pub capability_connected: bool,
    pub payments_configured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Billing half of a generation response
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum GenerationBilling {
    Settled(SettlementSummary),

    /// Output was delivered but could not be charged
    #[serde(rename_all = "camelCase")]
    Exception { payment_required: bool, message: String },
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub output: serde_json::Value,
    pub billing: GenerationBilling,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsCheckoutRequest {
    pub package_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCheckoutRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HandoffRequest {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct HandoffResponse {
    pub token: String,
}

// ============================================================================
// Error Mapping
// ============================================================================

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Map a billing error onto a transport response
pub fn billing_error(err: &BillingError) -> ApiError {
    let (status, code) = match err {
        BillingError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
        BillingError::PaymentRequired(PaymentRequiredReason::DailyQuotaExhausted) => {
            (StatusCode::PAYMENT_REQUIRED, "DAILY_QUOTA_EXHAUSTED")
        }
        BillingError::PaymentRequired(PaymentRequiredReason::NoPurchase) => {
            (StatusCode::PAYMENT_REQUIRED, "NO_PURCHASE")
        }
        BillingError::PaymentRequired(PaymentRequiredReason::InsufficientPoints)
        | BillingError::InsufficientBalance { .. } => (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_POINTS"),
        BillingError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
        BillingError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "MALFORMED_EVENT"),
        BillingError::SubscriptionNotFound(_)
        | BillingError::TransactionNotFound(_)
        | BillingError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BillingError::SubscriptionAlreadyActive => (StatusCode::CONFLICT, "SUBSCRIPTION_ACTIVE"),
        BillingError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        BillingError::UnknownCapability(_)
        | BillingError::UnknownPlan(_)
        | BillingError::UnknownPackage(_)
        | BillingError::InvalidAmount(_)
        | BillingError::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        BillingError::Gateway(_) => (StatusCode::INTERNAL_SERVER_ERROR, "GATEWAY_ERROR"),
        BillingError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    };

    if status.is_server_error() {
        tracing::error!(error = %err, code, "Request failed");
    }
    error_response(status, code, err.user_message())
}

fn capability_error(err: &CapabilityError) -> ApiError {
    tracing::error!(error = %err, "Generation failed");
    let (status, code) = if err.is_retryable() {
        (StatusCode::SERVICE_UNAVAILABLE, "CAPABILITY_UNAVAILABLE")
    } else {
        (StatusCode::BAD_GATEWAY, "CAPABILITY_ERROR")
    };
    error_response(status, code, err.user_message())
}

fn payments(state: &AppState) -> Result<&Arc<Payments>, ApiError> {
    state.payments.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "PAYMENTS_DISABLED",
            "Payments not configured",
        )
    })
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| billing_error(&BillingError::Unauthenticated))?;
    state
        .identity
        .verify(token, state.clock.now())
        .map_err(|e| billing_error(&e))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        capability: state.capability.name().to_string(),
        capability_connected: state.capability.health_check().await,
        payments_configured: state.payments.is_some(),
    })
}

/// Admit, generate, then settle
pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<GenerateResponse> {
    let account_id = authenticate(&state, &headers)?;

    let admission = state
        .billing
        .admission
        .ensure_usable(&account_id, &request.capability_id)
        .await
        .map_err(|e| billing_error(&e))?;
    tracing::debug!(account_id = %account_id, capability_id = %request.capability_id, ?admission, "Admitted");

    let generation = state
        .capability
        .generate(&request)
        .await
        .map_err(|e| capability_error(&e))?;

    // Settlement runs detached so a dropped connection cannot cancel it
    let admission_controller = state.billing.admission.clone();
    let capability_id = request.capability_id.clone();
    let (tokens_in, tokens_out) = (generation.tokens_in, generation.tokens_out);
    let settlement = tokio::spawn(async move {
        admission_controller
            .settle(&account_id, &capability_id, tokens_in, tokens_out)
            .await
    });

    let billing = match settlement.await {
        Ok(Ok(summary)) => GenerationBilling::Settled(summary),
        Ok(Err(e)) => GenerationBilling::Exception {
            payment_required: true,
            message: e.user_message().to_string(),
        },
        Err(e) => {
            tracing::error!(error = %e, capability_id = %request.capability_id, "Settlement task failed");
            GenerationBilling::Exception {
                payment_required: true,
                message: BillingError::Storage(e.to_string()).user_message().to_string(),
            }
        }
    };

    Ok(Json(GenerateResponse {
        output: generation.output,
        billing,
    }))
}

pub async fn balance(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<BalanceView> {
    let account_id = authenticate(&state, &headers)?;
    state
        .billing
        .queries
        .balance(&account_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn subscription_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<SubscriptionStatusView> {
    let account_id = authenticate(&state, &headers)?;
    state
        .billing
        .queries
        .subscription_status(&account_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Vec<PaymentTransaction>> {
    let account_id = authenticate(&state, &headers)?;
    state
        .billing
        .queries
        .payment_history(&account_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn payment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<PaymentStatusView> {
    let account_id = authenticate(&state, &headers)?;
    state
        .billing
        .queries
        .poll_payment_status(&account_id, &session_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

/// Create a points package checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PointsCheckoutRequest>,
) -> ApiResult<CheckoutSession> {
    let payments = payments(&state)?;
    let account_id = authenticate(&state, &headers)?;
    payments
        .checkout
        .create_points_checkout(&account_id, &payload.package_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn create_subscription_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubscriptionCheckoutRequest>,
) -> ApiResult<CheckoutSession> {
    let payments = payments(&state)?;
    let account_id = authenticate(&state, &headers)?;
    payments
        .checkout
        .create_subscription_checkout(&account_id, &payload.plan_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Cancellation> {
    let payments = payments(&state)?;
    let account_id = authenticate(&state, &headers)?;
    payments
        .checkout
        .cancel_subscription(&account_id)
        .await
        .map(Json)
        .map_err(|e| billing_error(&e))
}

pub async fn list_packages(State(state): State<AppState>) -> Json<Vec<PointsPackage>> {
    Json(state.billing.queries.packages().to_vec())
}

pub async fn list_plans(State(state): State<AppState>) -> Json<Vec<SubscriptionPlan>> {
    Json(state.billing.queries.plans().to_vec())
}

/// Park a freshly issued token for a polling client
pub async fn store_handoff(
    State(state): State<AppState>,
    Json(payload): Json<HandoffRequest>,
) -> Result<StatusCode, ApiError> {
    if payload.id.is_empty() || payload.id.len() > MAX_HANDOFF_ID_LEN {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "Handoff id is missing or too long",
        ));
    }
    state
        .identity
        .verify(&payload.token, state.clock.now())
        .map_err(|e| billing_error(&e))?;

    state
        .billing
        .handoffs
        .put_handoff(&payload.id, &payload.token, state.handoff_ttl)
        .await
        .map_err(|e| billing_error(&e))?;
    Ok(StatusCode::CREATED)
}

/// Read-once retrieval of a parked token
pub async fn take_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<HandoffResponse> {
    let token = state
        .billing
        .handoffs
        .take_handoff(&id)
        .await
        .map_err(|e| billing_error(&e))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Token not found or expired"))?;
    Ok(Json(HandoffResponse { token }))
}

/// Stripe webhook handler
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ReconcileOutcome> {
    let payments = payments(&state)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "MISSING_SIGNATURE", "Missing Stripe signature"))?;

    match payments.reconciler.process(&body, signature).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            if matches!(e, BillingError::InvalidSignature(_) | BillingError::MalformedEvent(_)) {
                tracing::warn!(error = %e, "Webhook rejected");
            }
            Err(billing_error(&e))
        }
    }
}
