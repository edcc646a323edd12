//! Admin HTTP surface.
//!
//! Loopback (or UNIX-socket) JSON API driving the live sessions, the
//! trust store and discovery. Every response carries `success`; failures
//! carry a `message` and one of the protocol's HTTP status codes. Device
//! references are either a raw identifier or a URL-decoded `@name`.

use crate::icon::IconCache;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use konnect_protocol::{
    Discovery, Packet, PayloadInfo, ProtocolError, ServerContext, SessionCommand, SessionHandle,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ServerContext>,
    pub discovery: Arc<Discovery>,
    pub icons: Arc<IconCache>,
    pub debug: bool,
}

/// API failure kinds and their HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    Unserialization,
    InvalidRequest(String),
    NotPaired,
    Forbidden,
    NotReachable,
    NotImplemented,
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unserialization | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotPaired => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotReachable => StatusCode::NOT_FOUND,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unserialization => "unserialization error".to_string(),
            ApiError::InvalidRequest(message) => message.clone(),
            ApiError::NotPaired => "device not paired".to_string(),
            ApiError::Forbidden => "server is not in debug mode".to_string(),
            ApiError::NotReachable => "device not reachable".to_string(),
            ApiError::NotImplemented => "not implemented".to_string(),
            ApiError::Internal(message) => message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "message": self.message() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::NotPaired(_) => ApiError::NotPaired,
            ProtocolError::NotReachable(_) => ApiError::NotReachable,
            // A dried-up transfer port pool is the caller's problem.
            ProtocolError::PortsExhausted => {
                ApiError::InvalidRequest("no transfer port available".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn ok(mut body: Value) -> ApiResult {
    if let Value::Object(ref mut map) = body {
        map.insert("success".to_string(), json!(true));
    }
    Ok((StatusCode::OK, Json(body)))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(server_info).put(announce))
        .route("/version", get(server_version))
        .route("/device", get(list_devices))
        .route("/device/{device}", get(show_device))
        .route("/pair/{device}", post(request_pair).delete(request_unpair))
        .route("/ping/{device}", post(send_ping))
        .route("/ring/{device}", post(send_ring))
        .route("/notification", get(list_all_notifications))
        .route(
            "/notification/{device}",
            get(list_notifications).post(send_notification),
        )
        .route("/notification/{device}/{reference}", delete(cancel_notification))
        .route("/command", get(list_all_commands))
        .route(
            "/command/{device}",
            get(list_commands).post(add_command).delete(clear_commands),
        )
        .route(
            "/command/{device}/{key}",
            axum::routing::put(update_command)
                .delete(remove_command)
                .patch(exec_command),
        )
        .route("/share/{device}", patch(set_share_path))
        .route("/custom/{device}", post(send_custom))
        .fallback(not_implemented)
        .method_not_allowed_fallback(not_implemented)
        .with_state(state)
}

async fn not_implemented() -> ApiError {
    ApiError::NotImplemented
}

/// Map a device reference (raw id or `@name`) onto an identifier.
fn resolve_device(ctx: &ServerContext, reference: &str) -> Option<String> {
    let Some(name) = reference.strip_prefix('@') else {
        return Some(reference.to_string());
    };

    for session in ctx.registry.snapshot() {
        if session.name() == name {
            return Some(session.identifier().to_string());
        }
    }
    for device in ctx.database.list_trusted().ok()? {
        if device.name == name {
            return Some(device.identifier);
        }
    }
    None
}

fn require_trusted(ctx: &ServerContext, identifier: Option<&String>) -> Result<String, ApiError> {
    match identifier {
        Some(identifier) if ctx.database.is_trusted(identifier) => Ok(identifier.clone()),
        _ => Err(ApiError::NotPaired),
    }
}

fn require_reachable(
    ctx: &ServerContext,
    identifier: Option<&String>,
) -> Result<SessionHandle, ApiError> {
    identifier
        .and_then(|identifier| ctx.registry.get(identifier))
        .ok_or(ApiError::NotReachable)
}

/// Union of trusted devices and live sessions, keyed by identifier.
fn device_entries(ctx: &ServerContext) -> Result<HashMap<String, Value>, ApiError> {
    let mut entries = HashMap::new();

    for device in ctx.database.list_trusted()? {
        entries.insert(
            device.identifier.clone(),
            json!({
                "identifier": device.identifier,
                "name": device.name,
                "type": device.device_type,
                "reachable": false,
                "trusted": true,
                "commands": {},
                "path": device.path,
            }),
        );
    }

    for session in ctx.registry.snapshot() {
        let commands = Value::Object(session.commands().into_iter().collect());
        match entries.get_mut(session.identifier()) {
            Some(entry) => {
                entry["reachable"] = json!(true);
                entry["commands"] = commands;
            }
            None => {
                entries.insert(
                    session.identifier().to_string(),
                    json!({
                        "identifier": session.identifier(),
                        "name": session.name(),
                        "type": session.device_type().as_str(),
                        "reachable": true,
                        "trusted": false,
                        "commands": commands,
                        "path": null,
                    }),
                );
            }
        }
    }

    Ok(entries)
}

fn parse_body(body: &str) -> Result<Value, ApiError> {
    serde_json::from_str(body).map_err(|_| ApiError::Unserialization)
}

fn body_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

async fn server_info(State(state): State<AppState>) -> ApiResult {
    ok(json!({
        "identifier": state.ctx.identifier(),
        "device": state.ctx.device_name,
        "server": format!("konnectd {}", env!("CARGO_PKG_VERSION")),
    }))
}

async fn server_version() -> ApiResult {
    ok(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn announce(State(state): State<AppState>) -> ApiResult {
    state
        .discovery
        .announce()
        .await
        .map_err(|_| ApiError::Internal("failed to broadcast identity packet".to_string()))?;
    ok(json!({}))
}

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    let entries = device_entries(&state.ctx)?;
    ok(json!({ "devices": entries.into_values().collect::<Vec<_>>() }))
}

async fn show_device(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    let entries = device_entries(&state.ctx)?;
    let entry = entries
        .get(&identifier)
        .cloned()
        .ok_or(ApiError::NotReachable)?;
    ok(entry)
}

async fn request_pair(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let session = require_reachable(&state.ctx, identifier.as_ref())?;

    session.send(SessionCommand::RequestPair)?;

    if state.ctx.database.is_trusted(session.identifier()) {
        ok(json!({ "message": "already paired" }))
    } else {
        ok(json!({}))
    }
}

async fn request_unpair(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    // A live session tells the peer; an offline unpair only clears trust.
    match state.ctx.registry.get(&identifier) {
        Some(session) => session.send(SessionCommand::RequestUnpair)?,
        None => state.ctx.database.unpair_device(&identifier)?,
    }
    ok(json!({}))
}

async fn send_ping(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;
    let session = require_reachable(&state.ctx, Some(&identifier))?;

    session.send(SessionCommand::SendPing { message: None })?;
    ok(json!({}))
}

async fn send_ring(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;
    let session = require_reachable(&state.ctx, Some(&identifier))?;

    session.send(SessionCommand::SendRing)?;
    ok(json!({}))
}

async fn list_all_notifications(State(state): State<AppState>) -> ApiResult {
    let rows = state.ctx.database.list_all_notifications()?;
    ok(json!({ "notifications": rows.iter().map(notification_json).collect::<Vec<_>>() }))
}

async fn list_notifications(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    let rows = state.ctx.database.list_notifications(&identifier)?;
    ok(json!({ "notifications": rows.iter().map(notification_json).collect::<Vec<_>>() }))
}

fn notification_json(row: &konnect_protocol::NotificationRow) -> Value {
    json!({
        "identifier": row.identifier,
        "reference": row.reference,
        "text": row.text,
        "title": row.title,
        "application": row.application,
        "cancel": row.cancel,
    })
}

async fn send_notification(
    State(state): State<AppState>,
    Path(device): Path<String>,
    body: String,
) -> ApiResult {
    let data = parse_body(&body)?;

    let (Some(text), Some(title), Some(application)) = (
        body_str(&data, "text"),
        body_str(&data, "title"),
        body_str(&data, "application"),
    ) else {
        return Err(ApiError::InvalidRequest(
            "text or title or application not found".to_string(),
        ));
    };

    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    // Empty references get a server-generated one so a later cancel can
    // address the notification.
    let reference = match body_str(&data, "reference") {
        Some(reference) if !reference.is_empty() => reference.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    state
        .ctx
        .database
        .persist_notification(&identifier, text, title, application, &reference)?;

    let Some(session) = state.ctx.registry.get(&identifier) else {
        // Not reachable: queued for replay when the peer registers its
        // notification listener.
        return Ok((
            StatusCode::CREATED,
            Json(json!({ "success": true, "reference": reference })),
        ));
    };

    let payload = match body_str(&data, "icon") {
        Some(icon) => prepare_icon_payload(&state, icon).await,
        None => None,
    };

    session.send(SessionCommand::SendNotification {
        text: text.to_string(),
        title: title.to_string(),
        application: application.to_string(),
        reference: reference.clone(),
        payload,
    })?;

    ok(json!({ "reference": reference }))
}

/// Normalise the icon and stand up a transfer port for it. Icon problems
/// degrade to a plain notification rather than failing the request.
async fn prepare_icon_payload(state: &AppState, icon: &str) -> Option<PayloadInfo> {
    let prepared = match state.icons.prepare(std::path::Path::new(icon)) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("Ignoring icon {}: {}", icon, e);
            return None;
        }
    };

    match state.ctx.transfers.serve_file(prepared.path.clone()).await {
        Ok(port) => Some(PayloadInfo {
            digest: prepared.digest,
            size: prepared.size,
            port,
        }),
        Err(e) => {
            warn!("No transfer port for icon {}: {}", icon, e);
            None
        }
    }
}

async fn cancel_notification(
    State(state): State<AppState>,
    Path((device, reference)): Path<(String, String)>,
) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    match state.ctx.registry.get(&identifier) {
        Some(session) => {
            // Live peers get the cancel now; the row has served its purpose.
            session.send(SessionCommand::SendCancel {
                reference: reference.clone(),
            })?;
            state
                .ctx
                .database
                .dismiss_notification(&identifier, &reference)?;
        }
        None => {
            // Tombstone; the next replay emits the cancel exactly once.
            state
                .ctx
                .database
                .cancel_notification(&identifier, &reference)?;
        }
    }
    ok(json!({}))
}

async fn list_all_commands(State(state): State<AppState>) -> ApiResult {
    let rows = state.ctx.database.list_all_commands()?;
    ok(json!({ "commands": rows.iter().map(command_json).collect::<Vec<_>>() }))
}

async fn list_commands(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    let rows = state.ctx.database.list_commands(&identifier)?;
    ok(json!({ "commands": rows.iter().map(command_json).collect::<Vec<_>>() }))
}

fn command_json(row: &konnect_protocol::CommandRow) -> Value {
    json!({
        "key": row.key,
        "identifier": row.identifier,
        "name": row.name,
        "command": row.command,
    })
}

async fn add_command(
    State(state): State<AppState>,
    Path(device): Path<String>,
    body: String,
) -> ApiResult {
    let data = parse_body(&body)?;
    let (Some(name), Some(command)) = (body_str(&data, "name"), body_str(&data, "command")) else {
        return Err(ApiError::InvalidRequest(
            "name or command not found".to_string(),
        ));
    };

    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    let key = Uuid::new_v4().to_string();
    state
        .ctx
        .database
        .add_command(&identifier, &key, name, command)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "key": key })),
    ))
}

async fn update_command(
    State(state): State<AppState>,
    Path((device, key)): Path<(String, String)>,
    body: String,
) -> ApiResult {
    let data = parse_body(&body)?;
    let (Some(name), Some(command)) = (body_str(&data, "name"), body_str(&data, "command")) else {
        return Err(ApiError::InvalidRequest(
            "name or command not found".to_string(),
        ));
    };

    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    if !state
        .ctx
        .database
        .update_command(&identifier, &key, name, command)?
    {
        return Err(ApiError::InvalidRequest("command not found".to_string()));
    }
    ok(json!({}))
}

async fn remove_command(
    State(state): State<AppState>,
    Path((device, key)): Path<(String, String)>,
) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    if !state.ctx.database.remove_command(&identifier, &key)? {
        return Err(ApiError::InvalidRequest("command not found".to_string()));
    }
    ok(json!({}))
}

async fn clear_commands(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    state.ctx.database.remove_commands(&identifier)?;
    ok(json!({}))
}

/// Ask the peer to run one of the commands it advertised to us.
async fn exec_command(
    State(state): State<AppState>,
    Path((device, key)): Path<(String, String)>,
) -> ApiResult {
    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;
    let session = require_reachable(&state.ctx, Some(&identifier))?;

    session.send(SessionCommand::SendRunRequest { key })?;
    ok(json!({}))
}

async fn set_share_path(
    State(state): State<AppState>,
    Path(device): Path<String>,
    body: String,
) -> ApiResult {
    let data = parse_body(&body)?;
    let path = match data.get("path") {
        Some(Value::String(path)) if !path.is_empty() => Some(path.as_str()),
        Some(Value::Null) | None => None,
        _ => return Err(ApiError::InvalidRequest("path not found".to_string())),
    };

    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;

    state.ctx.database.set_path(&identifier, path)?;
    ok(json!({}))
}

/// Debug-only escape hatch: send an arbitrary packet.
async fn send_custom(
    State(state): State<AppState>,
    Path(device): Path<String>,
    body: String,
) -> ApiResult {
    if !state.debug {
        return Err(ApiError::Forbidden);
    }

    let data = parse_body(&body)?;
    if data.get("type").and_then(Value::as_str).is_none() {
        return Err(ApiError::InvalidRequest("type not found".to_string()));
    }

    let identifier = resolve_device(&state.ctx, &device);
    let identifier = require_trusted(&state.ctx, identifier.as_ref())?;
    let session = require_reachable(&state.ctx, Some(&identifier))?;

    let packet = Packet::from_value(data).map_err(|_| ApiError::Unserialization)?;
    session.send(SessionCommand::SendCustom { packet })?;
    ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use konnect_protocol::{tls, CertificateInfo, Database, Registry, TransferManager};

    fn context() -> Arc<ServerContext> {
        let identity = CertificateInfo::generate("api_test").unwrap();
        let connector = tls::create_connector(&identity).unwrap();
        let acceptor = tls::create_acceptor(&identity).unwrap();
        Arc::new(ServerContext {
            identity,
            device_name: "test host".to_string(),
            service_port: 1764,
            connector: connector.clone(),
            database: Arc::new(Database::open_in_memory().unwrap()),
            registry: Arc::new(Registry::new()),
            transfers: Arc::new(TransferManager::new(acceptor, connector, 1763, 3)),
        })
    }

    #[test]
    fn test_resolve_raw_identifier_passes_through() {
        let ctx = context();
        assert_eq!(
            resolve_device(&ctx, "some-device-id"),
            Some("some-device-id".to_string())
        );
    }

    #[test]
    fn test_resolve_name_from_trust_store() {
        let ctx = context();
        ctx.database
            .pair_device("dev1", "PEM", "My Phone", "phone")
            .unwrap();

        assert_eq!(resolve_device(&ctx, "@My Phone"), Some("dev1".to_string()));
        assert_eq!(resolve_device(&ctx, "@Unknown"), None);
    }

    #[test]
    fn test_require_trusted() {
        let ctx = context();
        assert!(require_trusted(&ctx, Some(&"dev1".to_string())).is_err());

        ctx.database
            .pair_device("dev1", "PEM", "My Phone", "phone")
            .unwrap();
        assert_eq!(
            require_trusted(&ctx, Some(&"dev1".to_string())).unwrap(),
            "dev1"
        );
        assert!(require_trusted(&ctx, None).is_err());
    }

    #[test]
    fn test_device_entries_union() {
        let ctx = context();
        ctx.database
            .pair_device("dev1", "PEM", "My Phone", "phone")
            .unwrap();

        let entries = device_entries(&ctx).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries["dev1"];
        assert_eq!(entry["trusted"], json!(true));
        assert_eq!(entry["reachable"], json!(false));
        assert_eq!(entry["commands"], json!({}));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::Unserialization.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotPaired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotReachable.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::NotImplemented.status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ApiError::Internal("x".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
