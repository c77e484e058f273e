//! HTTP handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `POST` | `/key` | Issue (or reuse) the caller's key |
//! | `GET` | `/key` | The caller's active key, 404 if none |
//! | `GET` | `/verify-key` | Validate `key` for `playerName` |
//! | `GET` | `/get-notifications` | Pending notices |
//! | `POST` | `/clear-notifications` | Drop pending notices |
//! | `GET` | `/admin` | Sweep, then list keys and bans (admin) |
//! | `POST` | `/admin/*` | Key, blacklist and notice mutations (admin) |
//!
//! ## Admin Authentication
//!
//! Admin endpoints take the shared secret as `?access_code=<secret>` or
//! `Authorization: Bearer <secret>`. If no admin token is configured they
//! return `503 Service Unavailable`. Admin bodies are form-encoded.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, warn};

use super::AppState;
use super::identity::ClientIdentity;
use crate::Error;
use crate::admin::AdminCapability;
use crate::audit::{self, AuditEvent};
use crate::blacklist::{Ban, BanScope};
use crate::keys::Key;
use crate::mailbox::NoticeKind;

// ── Request / Response types ───────────────────────────────────────────────

/// A key plus the seconds it has left.
#[derive(Debug, Serialize)]
pub struct KeyView {
    /// The stored key.
    #[serde(flatten)]
    pub key: Key,
    /// Seconds until expiry.
    pub expires_in_secs: i64,
}

/// `GET /verify-key` query.
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    /// Token to check.
    pub key: Option<String>,
    /// Player presenting it.
    #[serde(rename = "playerName")]
    pub player_name: Option<String>,
}

/// `GET /verify-key` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Whether access is granted.
    pub valid: bool,
    /// Human-readable reason.
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
struct AccessQuery {
    access_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyForm {
    key: String,
}

#[derive(Debug, Deserialize)]
struct CustomKeyForm {
    key: String,
    duration: String,
    #[serde(rename = "maxUsers", default)]
    max_users: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddTimeForm {
    key: String,
    hours: String,
}

#[derive(Debug, Deserialize)]
struct HoursForm {
    hours: String,
}

#[derive(Debug, Deserialize)]
struct AddBanForm {
    #[serde(rename = "type")]
    scope: String,
    value: String,
    duration: String,
}

#[derive(Debug, Deserialize)]
struct ValueForm {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ModifyBanForm {
    value: String,
    hours: String,
}

#[derive(Debug, Deserialize)]
struct MessageForm {
    message: String,
}

/// Maps core errors onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if matches!(err, Error::DuplicateToken(_)) {
            return error_response(StatusCode::CONFLICT, "duplicate_token", &err.to_string());
        }
        if err.is_client_error() {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &err.to_string());
        }
        error!(error = %err, "Request failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let request_timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route("/key", get(current_key).post(issue_key))
        .route("/verify-key", get(verify_key))
        .route("/get-notifications", get(get_notifications))
        .route("/clear-notifications", post(clear_notifications))
        .route("/admin", get(admin_overview))
        .route("/admin/create-key", post(admin_create_key))
        .route("/admin/create-custom-key", post(admin_create_custom_key))
        .route("/admin/delete-key", post(admin_delete_key))
        .route("/admin/delete-expired-keys", post(admin_delete_expired))
        .route("/admin/delete-all-keys", post(admin_delete_all))
        .route("/admin/add-time", post(admin_add_time))
        .route("/admin/add-time-all", post(admin_add_time_all))
        .route("/admin/add-blacklist", post(admin_add_blacklist))
        .route("/admin/remove-blacklist", post(admin_remove_blacklist))
        .route("/admin/modify-blacklist-time", post(admin_modify_blacklist))
        .route("/admin/send-notification", post(admin_send_notification))
        .route("/admin/send-kick", post(admin_send_kick))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

// ── Public handlers ───────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `POST /key`: issue a key for the caller, reusing an active one.
async fn issue_key(
    State(state): State<Arc<AppState>>,
    ClientIdentity(identity): ClientIdentity,
) -> ApiResult<Json<KeyView>> {
    let key = state.keys.issue(&identity).await?;
    Ok(Json(state.view(key)))
}

/// `GET /key`: the caller's active key.
async fn current_key(
    State(state): State<Arc<AppState>>,
    ClientIdentity(identity): ClientIdentity,
) -> Response {
    match state.keys.current(&identity).await {
        Some(key) => Json(state.view(key)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "no_active_key",
            "No active key for this client",
        ),
    }
}

/// `GET /verify-key`: the gate decision for a player.
async fn verify_key(
    State(state): State<Arc<AppState>>,
    ClientIdentity(identity): ClientIdentity,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerifyResponse>> {
    let (Some(token), Some(player)) = (query.key, query.player_name) else {
        return Err(Error::InvalidInput("key and playerName are required".to_string()).into());
    };
    if player.trim().is_empty() {
        return Err(Error::InvalidInput("playerName is empty".to_string()).into());
    }

    let verdict = state.gate.validate(&token, &player, &identity).await?;
    Ok(Json(VerifyResponse {
        valid: verdict.allowed,
        message: verdict.reason,
    }))
}

/// `GET /get-notifications`
async fn get_notifications(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.mailbox.pending().await)
}

/// `POST /clear-notifications`
async fn clear_notifications(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let cleared = state.mailbox.clear().await?;
    Ok(Json(json!({"cleared": cleared})))
}

// ── Admin handlers ────────────────────────────────────────────────────────

/// `GET /admin`: sweep expired keys, then list keys and bans.
async fn admin_overview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let keys = state.keys.list(&cap).await?;
    let blacklist = state.blacklist.list().await;
    Ok(Json(json!({"keys": keys, "blacklist": blacklist})).into_response())
}

/// `POST /admin/create-key`
async fn admin_create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let key = state.keys.issue_admin(&cap).await?;
    Ok(Json(state.view(key)).into_response())
}

/// `POST /admin/create-custom-key`
async fn admin_create_custom_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<CustomKeyForm>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let duration: i64 = parse_field("duration", &form.duration)
        .map_err(|_| Error::InvalidDuration(format!("'{}' is not a number of hours", form.duration)))?;
    let max_users = match form.max_users.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_field::<u32>("maxUsers", raw)?),
    };

    let key = state
        .keys
        .issue_custom(&cap, &form.key, duration, max_users)
        .await?;
    Ok((StatusCode::CREATED, Json(state.view(key))).into_response())
}

/// `POST /admin/delete-key`
async fn admin_delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<KeyForm>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let deleted = state.keys.delete(&cap, form.key.trim()).await?;
    Ok(Json(json!({"deleted": deleted})).into_response())
}

/// `POST /admin/delete-expired-keys`
async fn admin_delete_expired(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }

    let deleted = state.keys.purge_expired().await?;
    Ok(Json(json!({"deleted": deleted})).into_response())
}

/// `POST /admin/delete-all-keys`
async fn admin_delete_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let deleted = state.keys.delete_all(&cap).await?;
    Ok(Json(json!({"deleted": deleted})).into_response())
}

/// `POST /admin/add-time`
async fn admin_add_time(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<AddTimeForm>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let hours: i64 = parse_field("hours", &form.hours)?;
    match state.keys.extend(&cap, form.key.trim(), hours).await? {
        Some(key) => Ok(Json(state.view(key)).into_response()),
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            "key_not_found",
            "Key not found or already expired",
        )),
    }
}

/// `POST /admin/add-time-all`
async fn admin_add_time_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<HoursForm>,
) -> ApiResult<Response> {
    let cap = match check_admin_auth(&state, &headers, &access) {
        Ok(cap) => cap,
        Err(response) => return Ok(response),
    };

    let hours: i64 = parse_field("hours", &form.hours)?;
    let extended = state.keys.extend_all(&cap, hours).await?;
    Ok(Json(json!({"extended": extended})).into_response())
}

/// `POST /admin/add-blacklist`
async fn admin_add_blacklist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<AddBanForm>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }

    let scope = BanScope::from_str(&form.scope).map_err(Error::InvalidInput)?;
    let value = form.value.trim();
    if value.is_empty() {
        return Err(Error::InvalidInput("value is required".to_string()).into());
    }

    let ban = if form.duration.trim().eq_ignore_ascii_case("permanent") {
        Ban::permanent(scope, value)
    } else {
        let hours: i64 = parse_field("duration", &form.duration)?;
        if hours <= 0 {
            return Err(Error::InvalidDuration(format!("{hours} hours (must be positive)")).into());
        }
        let until = chrono::TimeDelta::try_hours(hours)
            .and_then(|delta| state.clock.now().checked_add_signed(delta))
            .ok_or_else(|| Error::InvalidInput(format!("hours out of range: {hours}")))?;
        Ban::until(scope, value, until)
    };

    let replaced = state.blacklist.add(ban.clone()).await?;
    audit::emit(&AuditEvent::ban_added(&ban));
    Ok((
        if replaced { StatusCode::OK } else { StatusCode::CREATED },
        Json(json!({"ban": ban, "replaced": replaced})),
    )
        .into_response())
}

/// `POST /admin/remove-blacklist`
async fn admin_remove_blacklist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<ValueForm>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }

    let value = form.value.trim();
    let removed = state.blacklist.remove(value).await?;
    if removed > 0 {
        audit::emit(&AuditEvent::ban_removed(value, removed));
    }
    Ok(Json(json!({"removed": removed})).into_response())
}

/// `POST /admin/modify-blacklist-time`
async fn admin_modify_blacklist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<ModifyBanForm>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }

    let hours: i64 = parse_field("hours", &form.hours)?;
    let adjusted = state
        .blacklist
        .adjust_expiry(form.value.trim(), hours, state.clock.now())
        .await?;

    match adjusted {
        Some(ban) => {
            audit::emit(&AuditEvent::ban_adjusted(&ban));
            Ok(Json(json!({"ban": ban})).into_response())
        }
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            "ban_not_found",
            "No timed ban for this value",
        )),
    }
}

/// `POST /admin/send-notification`
async fn admin_send_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<MessageForm>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }
    post_notice(&state, NoticeKind::Notification, form.message).await
}

/// `POST /admin/send-kick`
async fn admin_send_kick(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(access): Query<AccessQuery>,
    Form(form): Form<MessageForm>,
) -> ApiResult<Response> {
    if let Err(response) = check_admin_auth(&state, &headers, &access) {
        return Ok(response);
    }
    post_notice(&state, NoticeKind::Kick, form.message).await
}

// ── Helpers ───────────────────────────────────────────────────────────────

async fn post_notice(state: &AppState, kind: NoticeKind, message: String) -> ApiResult<Response> {
    if message.trim().is_empty() {
        return Err(Error::InvalidInput("message is required".to_string()).into());
    }
    state.mailbox.post(kind, message).await?;
    audit::emit(&AuditEvent::notice_posted(&kind.to_string()));
    Ok((StatusCode::CREATED, Json(json!({"queued": true}))).into_response())
}

/// Check the presented admin secret and turn it into a capability.
///
/// The `Err` variant carries the full response to return immediately.
#[allow(clippy::result_large_err)]
fn check_admin_auth(
    state: &AppState,
    headers: &HeaderMap,
    access: &AccessQuery,
) -> Result<AdminCapability, Response> {
    let Some(ref admin) = state.admin else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin_not_configured",
            "Admin token not configured, admin endpoints disabled",
        ));
    };

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let presented = access.access_code.as_deref().or(bearer).unwrap_or_default();

    admin.verify(presented).ok_or_else(|| {
        warn!("Rejected admin request with invalid access code");
        (
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Bearer")],
            Json(json!({
                "error": "unauthorized",
                "message": "Invalid access code"
            })),
        )
            .into_response()
    })
}

/// Parse a numeric form field, rejecting anything that is not a plain integer.
fn parse_field<T: FromStr>(field: &str, raw: &str) -> Result<T, Error> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{field} must be an integer, got '{raw}'")))
}

/// Create a JSON error response.
fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
