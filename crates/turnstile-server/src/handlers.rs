//! HTTP handlers for the operator console and the embedded widget.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use turnstile_core::ids::CompanyId;
use turnstile_core::SubscriptionState;
use turnstile_engine::{Directory, EngineError};
use turnstile_store::CompanyRow;

use crate::server::AppState;

/// Company shape the console and widget consume, camelCase on the wire.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompanyDto {
    id: String,
    name: String,
    email: String,
    plan: String,
    token_balance: i64,
    max_tokens: i64,
    subscription_state: SubscriptionState,
    created_at: String,
}

impl From<&CompanyRow> for CompanyDto {
    fn from(row: &CompanyRow) -> Self {
        Self {
            id: row.id.as_str().to_string(),
            name: row.name.clone(),
            email: row.email.clone(),
            plan: row.plan.clone(),
            token_balance: row.token_balance,
            max_tokens: row.max_tokens,
            subscription_state: row.subscription,
            created_at: row.created_at.clone(),
        }
    }
}

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::QuotaExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = json!({
        "success": false,
        "error": e.to_string(),
        "code": e.code(),
        "retryable": e.is_retryable(),
    });
    (status, Json(body)).into_response()
}

/// Operator identity from the console, defaulting when absent. The
/// console is unauthenticated by design; this is attribution, not auth.
fn initiator(headers: &HeaderMap) -> String {
    headers
        .get("x-operator-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "operator".to_string())
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

// ── Directory ──

#[derive(Deserialize)]
pub struct ListParams {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

pub async fn list_companies(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let page = params.page.unwrap_or(1);
    let per_page = params.per_page.unwrap_or_else(Directory::default_per_page);

    match state.directory.list(params.q.as_deref(), page, per_page) {
        Ok(result) => {
            let data: Vec<CompanyDto> = result.companies.iter().map(CompanyDto::from).collect();
            Json(json!({
                "success": true,
                "message": "companies fetched",
                "data": data,
                "total": result.total,
                "active": result.active,
                "inactive": result.inactive,
                "page": result.page,
                "perPage": result.per_page,
            }))
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Onboarding ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCompanyBody {
    pub name: String,
    pub email: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    pub max_tokens: i64,
}

fn default_plan() -> String {
    "starter".to_string()
}

pub async fn create_company(
    State(state): State<AppState>,
    Json(body): Json<CreateCompanyBody>,
) -> Response {
    if body.name.trim().is_empty() || body.email.trim().is_empty() {
        return error_response(EngineError::Validation(
            "name and email are required".into(),
        ));
    }

    match state
        .companies
        .create(&body.name, &body.email, &body.plan, body.max_tokens)
    {
        Ok(row) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "data": CompanyDto::from(&row) })),
        )
            .into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ── Recharge ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargeBody {
    pub company_id: String,
    pub amount: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub reactivate: bool,
}

pub async fn recharge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RechargeBody>,
) -> Response {
    let company_id = CompanyId::from_raw(body.company_id);
    match state
        .coordinator
        .recharge(
            &company_id,
            body.amount,
            &body.idempotency_key,
            body.reactivate,
            &initiator(&headers),
        )
        .await
    {
        Ok(result) => Json(json!({
            "success": true,
            "tokens": result.tokens,
            "maxTokens": result.max_tokens,
            "subscription": result.subscription,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ── Widget gate ──

pub async fn token_status(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
) -> Response {
    let status = state.gate.check(&CompanyId::from_raw(company_id));
    Json(json!({
        "success": true,
        "active": status.active,
        "tokens": status.tokens,
    }))
    .into_response()
}

// ── Administration ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCapBody {
    pub max_tokens: i64,
    pub idempotency_key: String,
}

pub async fn set_cap(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetCapBody>,
) -> Response {
    let company_id = CompanyId::from_raw(company_id);
    match state
        .coordinator
        .set_max_tokens(
            &company_id,
            body.max_tokens,
            &body.idempotency_key,
            &initiator(&headers),
        )
        .await
    {
        Ok(row) => Json(json!({ "success": true, "data": CompanyDto::from(&row) })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSubscriptionBody {
    pub subscription: SubscriptionState,
    pub idempotency_key: String,
}

pub async fn set_subscription(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetSubscriptionBody>,
) -> Response {
    let company_id = CompanyId::from_raw(company_id);
    match state
        .coordinator
        .set_subscription(
            &company_id,
            body.subscription,
            &body.idempotency_key,
            &initiator(&headers),
        )
        .await
    {
        Ok(row) => Json(json!({ "success": true, "data": CompanyDto::from(&row) })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
) -> Response {
    let company_id = CompanyId::from_raw(company_id);
    // 404 for unknown companies rather than an empty log.
    if let Err(e) = state.companies.get(&company_id) {
        return error_response(e.into());
    }
    match state.transactions.list(&company_id) {
        Ok(rows) => Json(json!({ "success": true, "data": rows })).into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ── Telemetry ──

#[derive(Deserialize)]
pub struct LogsParams {
    pub level: Option<String>,
    pub company_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub async fn admin_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Response {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return error_response(EngineError::Unavailable("log sink not configured".into()));
    };

    let query = turnstile_telemetry::LogQuery {
        level: params.level,
        target: None,
        company_id: params.company_id,
        since: params.since,
        limit: params.limit,
    };
    match sink.query(&query) {
        Ok(records) => Json(json!({ "success": true, "data": records })).into_response(),
        Err(e) => error_response(EngineError::Unavailable(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct MetricsParams {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub async fn admin_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
) -> Response {
    let Some(recorder) = state.telemetry.as_ref().and_then(|t| t.metrics()) else {
        return error_response(EngineError::Unavailable("metrics not configured".into()));
    };

    // Flush live values so the query reflects the current process.
    if let Err(e) = recorder.snapshot() {
        return error_response(EngineError::Unavailable(e.to_string()));
    }
    let query = turnstile_telemetry::MetricsQuery {
        name: params.name,
        since: params.since,
        limit: params.limit,
    };
    match recorder.query(&query) {
        Ok(snapshots) => Json(json!({ "success": true, "data": snapshots })).into_response(),
        Err(e) => error_response(EngineError::Unavailable(e.to_string())),
    }
}
