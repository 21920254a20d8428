//! HTTP surface: the operator API (vehicles, reservations, links, sync) and
//! the public feed export endpoint.
//!
//! Operator routes are tenant-scoped via the `X-Corral-Tenant` header and
//! authorized by a shared bearer key. The export route is reachable without
//! the operator key: calendar subscribers cannot set headers, so it is gated
//! by the per-tenant export token in the query string instead.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use ulid::Ulid;

use crate::engine::{Conflict, Engine, EngineError, ReserveOutcome};
use crate::model::{DateRange, ExternalLink, Reservation, ReservationStatus};
use crate::observability;
use crate::sync::Synchronizer;
use crate::tenant::TenantManager;

pub const TENANT_HEADER: &str = "x-corral-tenant";

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantManager>,
    pub sync: Arc<Synchronizer>,
    pub api_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/vehicles", post(register_vehicle).get(list_vehicles))
        .route("/vehicles/{id}/availability", get(availability))
        .route("/vehicles/{id}/blocked", get(blocked_ranges))
        .route(
            "/vehicles/{id}/reservations",
            post(create_reservation).get(list_reservations),
        )
        .route("/reservations/{id}/status", post(set_reservation_status))
        .route("/reservations/{id}/cancel", post(cancel_reservation))
        .route("/vehicles/{id}/links", post(register_link).get(list_links))
        .route("/links/{id}/revoke", post(revoke_link))
        .route("/links/{id}/sync", post(sync_link))
        .route("/sync", post(sync_all))
        .route("/export-token", get(export_token))
        .route("/feeds/{tenant}/{vehicle}", get(export_feed))
        .layer(middleware::from_fn(track_metrics))
        .layer(cors)
        .with_state(state)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(req).await;
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}

// ── Errors ───────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(id) => ApiError::NotFound(id.to_string()),
            EngineError::AlreadyExists(id) => ApiError::AlreadyExists(id),
            EngineError::LimitExceeded(what) => ApiError::LimitExceeded(what),
            EngineError::WalError(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {what}")),
            ApiError::AlreadyExists(id) => {
                (StatusCode::CONFLICT, format!("already exists: {id}"))
            }
            ApiError::LimitExceeded(what) => {
                (StatusCode::UNPROCESSABLE_ENTITY, format!("limit exceeded: {what}"))
            }
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// ── Tenant + auth plumbing ───────────────────────────────

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Resolves the tenant engine for an operator request, checking the bearer
/// key first.
fn tenant_engine(state: &AppState, headers: &HeaderMap) -> Result<Arc<Engine>, ApiError> {
    authorize(state, headers)?;
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing tenant header".to_string()))?;
    state
        .tenants
        .get_or_create(tenant)
        .map_err(|e| ApiError::BadRequest(format!("tenant unavailable: {e}")))
}

fn parse_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, ApiError> {
    DateRange::new(start, end)
        .ok_or_else(|| ApiError::BadRequest("range start is after end".to_string()))
}

// ── Vehicles ─────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterVehicleRequest {
    label: Option<String>,
}

#[derive(Serialize)]
struct VehicleInfo {
    id: Ulid,
    label: Option<String>,
}

async fn register_vehicle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterVehicleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let id = Ulid::new();
    engine.register_vehicle(id, req.label.clone()).await?;
    Ok((StatusCode::CREATED, Json(VehicleInfo { id, label: req.label })))
}

async fn list_vehicles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<VehicleInfo>>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let vehicles = engine
        .list_vehicles()
        .await
        .into_iter()
        .map(|(id, label)| VehicleInfo { id, label })
        .collect();
    Ok(Json(vehicles))
}

// ── Availability ─────────────────────────────────────────

#[derive(Deserialize)]
struct RangeQuery {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Serialize)]
struct AvailabilityResponse {
    available: bool,
}

async fn availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let range = parse_range(q.start, q.end)?;
    let available = engine.is_available(id, range).await?;
    Ok(Json(AvailabilityResponse { available }))
}

async fn blocked_ranges(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<Vec<DateRange>>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    Ok(Json(engine.blocked_ranges(id).await?))
}

// ── Reservations ─────────────────────────────────────────

#[derive(Deserialize)]
struct CreateReservationRequest {
    start: NaiveDate,
    end: NaiveDate,
    label: Option<String>,
}

#[derive(Serialize)]
struct ConflictResponse {
    error: &'static str,
    conflict: Conflict,
}

async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    Json(req): Json<CreateReservationRequest>,
) -> Result<Response, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let range = parse_range(req.start, req.end)?;
    let outcome = engine.reserve(Ulid::new(), id, range, req.label).await?;
    Ok(match outcome {
        ReserveOutcome::Booked(reservation) => {
            (StatusCode::CREATED, Json(reservation)).into_response()
        }
        ReserveOutcome::Conflict(conflict) => (
            StatusCode::CONFLICT,
            Json(ConflictResponse {
                error: "range is blocked",
                conflict,
            }),
        )
            .into_response(),
    })
}

async fn list_reservations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    Ok(Json(engine.reservations(id).await?))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: ReservationStatus,
}

async fn set_reservation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    Json(req): Json<StatusRequest>,
) -> Result<StatusCode, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    engine.set_reservation_status(id, req.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<StatusCode, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    engine.cancel_reservation(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Links + sync ─────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterLinkRequest {
    feed_url: String,
    source_label: String,
}

async fn register_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    Json(req): Json<RegisterLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let link_id = Ulid::new();
    engine
        .register_link(link_id, id, req.feed_url, req.source_label)
        .await?;
    let link = engine.link_snapshot(link_id).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn list_links(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<Vec<ExternalLink>>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    Ok(Json(engine.links(id).await?))
}

async fn revoke_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<StatusCode, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    engine.revoke_link(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let result = state.sync.sync_one(&engine, id).await?;
    Ok(Json(result))
}

async fn sync_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let report = state.sync.sync_all(&engine).await;
    Ok(Json(report))
}

// ── Export ───────────────────────────────────────────────

#[derive(Serialize)]
struct ExportTokenResponse {
    token: String,
}

async fn export_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ExportTokenResponse>, ApiError> {
    let engine = tenant_engine(&state, &headers)?;
    let token = engine.export_token().await?;
    Ok(Json(ExportTokenResponse { token }))
}

#[derive(Deserialize)]
struct ExportQuery {
    token: String,
}

/// `GET /feeds/{tenant}/{vehicle}.ics?token=…` — token-gated, no operator
/// key, so calendar applications can subscribe directly.
async fn export_feed(
    State(state): State<AppState>,
    Path((tenant, vehicle)): Path<(String, String)>,
    Query(q): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let vehicle_id: Ulid = vehicle
        .strip_suffix(".ics")
        .unwrap_or(&vehicle)
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid vehicle id".to_string()))?;

    // Lookup only: this route is unauthenticated, so an unknown tenant name
    // must not create tenant state. Same response as a bad token, to avoid
    // revealing which tenant names exist.
    let engine = state.tenants.get(&tenant).ok_or(ApiError::Unauthorized)?;

    // Constant response for a bad token; do not reveal whether the vehicle
    // exists. No token issued yet means nothing can match either.
    let expected = engine.current_export_token().await.ok_or(ApiError::Unauthorized)?;
    if q.token != expected {
        return Err(ApiError::Unauthorized);
    }

    let ics = engine.export_feed(vehicle_id).await?;
    metrics::counter!(observability::FEED_EXPORTS_TOTAL).increment(1);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
        ics,
    )
        .into_response())
}
