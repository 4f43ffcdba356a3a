//! The operator-facing control-plane API.
//!
//! HTTP/JSON under `/api/v1` with bearer-token auth. Request bodies are
//! closed shapes (unknown fields are rejected), responses carry an explicit
//! top-level key, list endpoints paginate with offset/limit. The websocket
//! push channel is advisory; clients reconcile through the REST routes.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maps::{CounterSnapshot, Endpoint, Maps};
use util::time::epoch_ms;

use crate::{
    EndpointSpec, EndpointUpdate, FleetError, FleetManager, NodeRecord, NodeRegistration,
    PushEvent, SecurityConfig, Store, StoreError, SyncError, Synchronizer,
};

pub struct ApiContext {
    pub maps: Arc<Maps>,
    pub sync: Arc<Synchronizer>,
    pub fleet: Arc<FleetManager>,
    pub store: Arc<Store>,
    pub push: broadcast::Sender<PushEvent>,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub enable_jwt: bool,
    pub secret: String,
}

impl From<&SecurityConfig> for AuthSettings {
    fn from(security: &SecurityConfig) -> AuthSettings {
        AuthSettings { enable_jwt: security.enable_jwt, secret: security.jwt_secret.clone() }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Invalid(String),
    Exhausted(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, String::from("unauthorized")),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Invalid(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Exhausted(m) => (StatusCode::INSUFFICIENT_STORAGE, m),
            ApiError::Internal(m) => {
                tracing::error!("internal API failure: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, String::from("internal error"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> ApiError {
        match e {
            SyncError::Invalid(m) => ApiError::Invalid(m),
            SyncError::NotFound(id) => ApiError::NotFound(format!("no such endpoint: {id}")),
            SyncError::Saturated(e) => ApiError::Exhausted(e.to_string()),
            SyncError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> ApiError {
        match e {
            FleetError::Invalid(m) => ApiError::Invalid(m),
            FleetError::NotFound(id) => ApiError::NotFound(format!("no such node: {id}")),
            FleetError::Exhausted(limit) => ApiError::Exhausted(format!("node limit reached ({limit})")),
            FleetError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> ApiError {
        ApiError::Internal(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Pagination {
    offset: usize,
    limit: usize,
}

impl Default for Pagination {
    fn default() -> Pagination {
        Pagination { offset: 0, limit: 50 }
    }
}

impl Pagination {
    fn slice<T: Clone>(&self, rows: &[T]) -> Vec<T> {
        rows.iter().skip(self.offset).take(self.limit).cloned().collect()
    }
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    let api = Router::new()
        .route("/endpoints", get(list_endpoints).post(create_endpoint))
        .route(
            "/endpoints/:id",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/endpoints/:id/metrics", get(endpoint_metrics))
        .route("/endpoints/:id/whitelist", get(list_whitelist).post(add_whitelist))
        .route("/endpoints/:id/whitelist/:ip", axum::routing::delete(remove_whitelist))
        .route("/blacklist", get(list_blacklist).post(add_blacklist))
        .route("/blacklist/:ip", axum::routing::delete(remove_blacklist))
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/:id", get(get_node).delete(decommission_node))
        .route("/nodes/:id/status", get(node_status))
        .route("/system/status", get(system_status))
        .route("/system/stats", get(system_stats))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(Arc::clone(&ctx), require_auth))
        .with_state(ctx);
    Router::new().nest("/api/v1", api)
}

/// Binds the API listener. A failure here is fatal to startup.
pub async fn bind_api(address: &str) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("unable to bind control-plane API at {address}"))
}

/// Serves the API on a bound listener until cancellation.
pub async fn serve_api(
    ctx: Arc<ApiContext>,
    listener: tokio::net::TcpListener,
    token: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!("control-plane API listening at {address}");
    }
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("control-plane API failed")
}

async fn require_auth(
    State(ctx): State<Arc<ApiContext>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // An empty secret disables authentication entirely.
    if ctx.auth.secret.is_empty() {
        return Ok(next.run(request).await);
    }
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let authorized = if ctx.auth.enable_jwt {
        let key = DecodingKey::from_secret(ctx.auth.secret.as_bytes());
        jsonwebtoken::decode::<Claims>(bearer, &key, &Validation::new(Algorithm::HS256)).is_ok()
    } else {
        bearer == ctx.auth.secret
    };
    if !authorized {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    exp: usize,
}

// Endpoints

#[derive(Serialize)]
struct EndpointBody {
    endpoint: Endpoint,
}

async fn list_endpoints(
    State(ctx): State<Arc<ApiContext>>,
    Query(page): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = ctx.store.endpoints()?;
    Ok(Json(serde_json::json!({
        "endpoints": page.slice(&rows),
        "total": rows.len(),
    })))
}

async fn create_endpoint(
    State(ctx): State<Arc<ApiContext>>,
    Json(spec): Json<EndpointSpec>,
) -> Result<(StatusCode, Json<EndpointBody>), ApiError> {
    let endpoint = ctx.sync.add_endpoint(spec)?;
    let _ = ctx.push.send(PushEvent::EndpointUpdate(endpoint.clone()));
    Ok((StatusCode::CREATED, Json(EndpointBody { endpoint })))
}

async fn get_endpoint(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndpointBody>, ApiError> {
    let endpoint = ctx
        .store
        .endpoint(id)?
        .ok_or_else(|| ApiError::NotFound(format!("no such endpoint: {id}")))?;
    Ok(Json(EndpointBody { endpoint }))
}

async fn update_endpoint(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
    Json(update): Json<EndpointUpdate>,
) -> Result<Json<EndpointBody>, ApiError> {
    let endpoint = ctx.sync.update_endpoint(id, update)?;
    let _ = ctx.push.send(PushEvent::EndpointUpdate(endpoint.clone()));
    Ok(Json(EndpointBody { endpoint }))
}

async fn delete_endpoint(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let endpoint = ctx.sync.remove_endpoint(id)?;
    let _ = ctx.push.send(PushEvent::EndpointUpdate(endpoint));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricsQuery {
    since: Option<String>,
}

async fn endpoint_metrics(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if ctx.store.endpoint(id)?.is_none() {
        return Err(ApiError::NotFound(format!("no such endpoint: {id}")));
    }
    let window_ms = match query.since.as_deref() {
        Some(raw) => parse_duration_ms(raw)
            .ok_or_else(|| ApiError::Invalid(format!("unparseable duration: {raw}")))?,
        None => 15 * 60 * 1000,
    };
    let since = epoch_ms().saturating_sub(window_ms);
    let rows: Vec<serde_json::Value> = ctx
        .store
        .metrics_since(since)?
        .into_iter()
        .map(|(timestamp_ms, counters)| {
            serde_json::json!({ "timestamp_ms": timestamp_ms, "counters": counters })
        })
        .collect();
    Ok(Json(serde_json::json!({ "metrics": rows })))
}

/// `30s`, `15m`, `2h` or a bare number of seconds.
fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, scale) = match raw.as_bytes().last()? {
        b's' => (&raw[..raw.len() - 1], 1_000),
        b'm' => (&raw[..raw.len() - 1], 60_000),
        b'h' => (&raw[..raw.len() - 1], 3_600_000),
        _ => (raw, 1_000),
    };
    digits.parse::<u64>().ok()?.checked_mul(scale)
}

// Whitelists

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WhitelistRequest {
    ip: Ipv4Addr,
}

async fn list_whitelist(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if ctx.store.endpoint(id)?.is_none() {
        return Err(ApiError::NotFound(format!("no such endpoint: {id}")));
    }
    Ok(Json(serde_json::json!({ "whitelist": ctx.store.whitelist(id)? })))
}

async fn add_whitelist(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
    Json(request): Json<WhitelistRequest>,
) -> Result<StatusCode, ApiError> {
    if ctx.store.endpoint(id)?.is_none() {
        return Err(ApiError::NotFound(format!("no such endpoint: {id}")));
    }
    ctx.store.add_whitelist(id, request.ip)?;
    Ok(StatusCode::CREATED)
}

async fn remove_whitelist(
    State(ctx): State<Arc<ApiContext>>,
    Path((id, ip)): Path<(Uuid, Ipv4Addr)>,
) -> Result<StatusCode, ApiError> {
    if ctx.store.remove_whitelist(id, ip)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{ip} is not whitelisted for {id}")))
    }
}

// Blacklist

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlacklistRequest {
    ip: Ipv4Addr,
    ttl_ms: u64,
}

async fn list_blacklist(
    State(ctx): State<Arc<ApiContext>>,
    Query(page): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows: Vec<serde_json::Value> = ctx
        .store
        .blacklist_rows()?
        .into_iter()
        .map(|(ip, blocked_until_ms)| {
            serde_json::json!({ "ip": ip, "blocked_until_ms": blocked_until_ms })
        })
        .collect();
    Ok(Json(serde_json::json!({ "blacklist": page.slice(&rows), "total": rows.len() })))
}

async fn add_blacklist(
    State(ctx): State<Arc<ApiContext>>,
    Json(request): Json<BlacklistRequest>,
) -> Result<StatusCode, ApiError> {
    ctx.sync.add_blacklist(request.ip, request.ttl_ms)?;
    Ok(StatusCode::CREATED)
}

async fn remove_blacklist(
    State(ctx): State<Arc<ApiContext>>,
    Path(ip): Path<Ipv4Addr>,
) -> Result<StatusCode, ApiError> {
    if ctx.sync.remove_blacklist(ip)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{ip} is not blacklisted")))
    }
}

// Nodes

#[derive(Serialize)]
struct NodeBody {
    node: NodeRecord,
}

async fn list_nodes(
    State(ctx): State<Arc<ApiContext>>,
    Query(page): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = ctx.fleet.nodes();
    Ok(Json(serde_json::json!({ "nodes": page.slice(&rows), "total": rows.len() })))
}

async fn register_node(
    State(ctx): State<Arc<ApiContext>>,
    Json(registration): Json<NodeRegistration>,
) -> Result<(StatusCode, Json<NodeBody>), ApiError> {
    let node = ctx.fleet.register(registration)?;
    Ok((StatusCode::CREATED, Json(NodeBody { node })))
}

async fn get_node(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<NodeBody>, ApiError> {
    let node = ctx
        .fleet
        .node(id)
        .ok_or_else(|| ApiError::NotFound(format!("no such node: {id}")))?;
    Ok(Json(NodeBody { node }))
}

async fn decommission_node(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    ctx.fleet.decommission(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_status(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let node = ctx
        .fleet
        .node(id)
        .ok_or_else(|| ApiError::NotFound(format!("no such node: {id}")))?;
    Ok(Json(serde_json::json!({
        "status": {
            "status": node.status,
            "last_seen": node.last_seen_ms,
            "cpu_usage": node.cpu_usage,
            "memory_usage": node.memory_usage,
            "packet_rate": node.packet_rate,
            "endpoints": node.endpoints,
        }
    })))
}

// System

async fn system_status(State(ctx): State<Arc<ApiContext>>) -> Result<Json<serde_json::Value>, ApiError> {
    let nodes = ctx.fleet.nodes();
    let active = nodes.iter().filter(|n| n.status == crate::NodeStatus::Active).count();
    Ok(Json(serde_json::json!({
        "status": {
            "status": "ok",
            "endpoints": ctx.maps.endpoints.len(),
            "nodes_total": nodes.len(),
            "nodes_active": active,
        }
    })))
}

async fn system_stats(State(ctx): State<Arc<ApiContext>>) -> Json<SystemStats> {
    Json(SystemStats { stats: ctx.sync.read_counters() })
}

#[derive(Serialize)]
struct SystemStats {
    stats: CounterSnapshot,
}

// Push channel

async fn ws_upgrade(State(ctx): State<Arc<ApiContext>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| push_events(socket, ctx))
}

async fn push_events(mut socket: WebSocket, ctx: Arc<ApiContext>) {
    let mut events = ctx.push.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            // The channel is advisory; a lagging client just misses events.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use crate::{FleetConfig, NodeStatus};

    use super::*;

    const TOKEN: &str = "operator-secret";

    fn test_router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("api.redb")).unwrap());
        let maps = Arc::new(Maps::new());
        let sync = Arc::new(Synchronizer::new(Arc::clone(&maps), Arc::clone(&store)));
        let (push, _) = broadcast::channel(64);
        let fleet = Arc::new(
            FleetManager::new(Arc::clone(&store), push.clone(), FleetConfig::default()).unwrap(),
        );
        let ctx = Arc::new(ApiContext {
            maps,
            sync,
            fleet,
            store,
            push,
            auth: AuthSettings { enable_jwt: false, secret: String::from(TOKEN) },
        });
        (dir, router(ctx))
    }

    async fn call(
        router: &Router,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn endpoint_body(port: u16) -> Value {
        json!({
            "kind": "java",
            "front_ip": "198.51.100.10",
            "front_port": port,
            "origin_ip": "203.0.113.5",
            "origin_port": 25565,
            "rate_limit": 1000,
            "burst_limit": 5000,
        })
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_bearer() {
        let (_dir, router) = test_router();
        let (status, _) = call(&router, "GET", "/api/v1/endpoints", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, "GET", "/api/v1/endpoints", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, "GET", "/api/v1/endpoints", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn endpoint_crud_round_trip() {
        let (_dir, router) = test_router();

        let (status, created) =
            call(&router, "POST", "/api/v1/endpoints", Some(TOKEN), Some(endpoint_body(25565))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["endpoint"]["id"].as_str().unwrap().to_owned();

        let (status, listed) = call(&router, "GET", "/api/v1/endpoints", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["endpoints"][0]["id"], created["endpoint"]["id"]);

        let (status, updated) = call(
            &router,
            "PUT",
            &format!("/api/v1/endpoints/{id}"),
            Some(TOKEN),
            Some(json!({ "maintenance": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["endpoint"]["maintenance"], true);

        let (status, _) =
            call(&router, "DELETE", &format!("/api/v1/endpoints/{id}"), Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            call(&router, "GET", &format!("/api/v1/endpoints/{id}"), Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_request_fields_are_rejected() {
        let (_dir, router) = test_router();
        let mut body = endpoint_body(25565);
        body["surprise"] = json!(1);
        let (status, _) = call(&router, "POST", "/api/v1/endpoints", Some(TOKEN), Some(body)).await;
        assert!(status.is_client_error(), "unexpected status {status}");
    }

    #[tokio::test]
    async fn list_endpoints_paginates() {
        let (_dir, router) = test_router();
        for port in [25565, 25566, 25567] {
            let (status, _) =
                call(&router, "POST", "/api/v1/endpoints", Some(TOKEN), Some(endpoint_body(port))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (_, page) =
            call(&router, "GET", "/api/v1/endpoints?offset=0&limit=2", Some(TOKEN), None).await;
        assert_eq!(page["endpoints"].as_array().unwrap().len(), 2);
        assert_eq!(page["total"], 3);
    }

    #[tokio::test]
    async fn blacklist_routes_round_trip() {
        let (_dir, router) = test_router();

        let body = json!({ "ip": "1.2.3.4", "ttl_ms": 60_000 });
        let (status, _) = call(&router, "POST", "/api/v1/blacklist", Some(TOKEN), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, listed) = call(&router, "GET", "/api/v1/blacklist", Some(TOKEN), None).await;
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["blacklist"][0]["ip"], "1.2.3.4");

        let (status, _) = call(&router, "DELETE", "/api/v1/blacklist/1.2.3.4", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&router, "DELETE", "/api/v1/blacklist/1.2.3.4", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn whitelist_routes_round_trip() {
        let (_dir, router) = test_router();
        let (_, created) =
            call(&router, "POST", "/api/v1/endpoints", Some(TOKEN), Some(endpoint_body(25565))).await;
        let id = created["endpoint"]["id"].as_str().unwrap().to_owned();

        let (status, _) = call(
            &router,
            "POST",
            &format!("/api/v1/endpoints/{id}/whitelist"),
            Some(TOKEN),
            Some(json!({ "ip": "9.9.9.9" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, listed) =
            call(&router, "GET", &format!("/api/v1/endpoints/{id}/whitelist"), Some(TOKEN), None).await;
        assert_eq!(listed["whitelist"], json!(["9.9.9.9"]));

        let (status, _) = call(
            &router,
            "DELETE",
            &format!("/api/v1/endpoints/{id}/whitelist/9.9.9.9"),
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn node_registration_and_views() {
        let (_dir, router) = test_router();
        let registration = json!({
            "name": "edge-1",
            "data_addr": "198.51.100.10",
            "control_addr": "http://198.51.100.10:9000",
            "interface": "eth0",
        });
        let (status, created) =
            call(&router, "POST", "/api/v1/nodes", Some(TOKEN), Some(registration)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["node"]["status"], json!(NodeStatus::Active));
        let id = created["node"]["id"].as_str().unwrap().to_owned();

        let (_, nodes) = call(&router, "GET", "/api/v1/nodes", Some(TOKEN), None).await;
        assert_eq!(nodes["total"], 1);

        let (status, status_body) =
            call(&router, "GET", &format!("/api/v1/nodes/{id}/status"), Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["status"]["status"], "active");

        let (status, _) = call(&router, "DELETE", &format!("/api/v1/nodes/{id}"), Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn system_views_expose_counters() {
        let (_dir, router) = test_router();
        let (status, stats) = call(&router, "GET", "/api/v1/system/stats", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["stats"]["total_packets"], 0);

        let (status, system) = call(&router, "GET", "/api/v1/system/status", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(system["status"]["status"], "ok");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_ms("30s"), Some(30_000));
        assert_eq!(parse_duration_ms("15m"), Some(900_000));
        assert_eq!(parse_duration_ms("2h"), Some(7_200_000));
        assert_eq!(parse_duration_ms("45"), Some(45_000));
        assert_eq!(parse_duration_ms("abc"), None);
        assert_eq!(parse_duration_ms(""), None);
    }
}
