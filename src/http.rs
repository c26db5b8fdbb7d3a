//! HTTP surface: read-only REST endpoints, the realtime upgrade route and
//! the CORS/logging middleware.
//!
//! Reads prefer the store and fall back to the acquisition loop's in-memory
//! state, so the surface keeps answering while the store is down.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::hub::Hub;
use crate::models::{now_ms, LatestUpdate, RadarFrame, RadarStatus, StatusKind, CHANNELS};
use crate::server::ServerInfo;
use crate::state::Shared;
use crate::store::StoreService;

/// Handles shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: StoreService,
    pub status: Shared<RadarStatus>,
    pub last_frame: Shared<Option<RadarFrame>>,
    pub last_update: Shared<Option<LatestUpdate>>,
    pub info: Arc<ServerInfo>,
    pub radar_running: Arc<AtomicBool>,
    pub advertiser_running: Arc<AtomicBool>,
    pub plc_enabled: bool,
    pub plc_running: Arc<AtomicBool>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(server_info))
        .route("/ws", get(crate::ws::ws_handler))
        .route("/ws/health", get(ws_health))
        .route("/api/discover", get(discover))
        .route("/api/status", get(api_status))
        .route("/api/current", get(api_current))
        .route("/api/velocity-changes", get(api_velocity_changes))
        .route("/api/velocity-history/{index}", get(api_velocity_history))
        .route("/api/latest-update", get(api_latest_update))
        .with_state(state)
        .layer(middleware::from_fn(cors_and_log))
}

/// Aggregate health. Degraded when the sensor or the store is down.
async fn health(State(state): State<AppState>) -> Json<Value> {
    let radar_up = state.radar_running.load(Ordering::Relaxed)
        && state.status.read().status != StatusKind::CommFailure;
    let radar_status = if radar_up { "ok" } else { "offline" };

    let store_status = if !state.store.is_enabled() {
        "disabled"
    } else if state.store.is_connected() {
        "ok"
    } else {
        "offline"
    };

    let discovery_status = if state.advertiser_running.load(Ordering::Relaxed) {
        "ok"
    } else {
        "offline"
    };

    let plc_status = if !state.plc_enabled {
        "disabled"
    } else if state.plc_running.load(Ordering::Relaxed) {
        "ok"
    } else {
        "offline"
    };

    let overall = if !radar_up || store_status == "offline" {
        "degraded"
    } else {
        "ok"
    };

    Json(json!({
        "status": overall,
        "timestamp": now_ms(),
        "services": {
            "radar": radar_status,
            "store": store_status,
            "websocket": "ok",
            "discovery": discovery_status,
            "plc": plc_status,
        },
    }))
}

async fn server_info(State(state): State<AppState>) -> Json<Value> {
    let info = &state.info;
    let uptime = (OffsetDateTime::now_utc() - info.start_time).whole_seconds().max(0);

    Json(json!({
        "name": info.name,
        "version": info.version,
        "ip": info.ip,
        "port": info.port,
        "websocket": info.ws_url,
        "api": info.api_url,
        "startTime": info.start_time.format(&Rfc3339).unwrap_or_default(),
        "uptimeSeconds": uptime,
        "connections": state.hub.client_count(),
    }))
}

/// Connection coordinates for clients that miss the mDNS advertisement.
async fn discover(State(state): State<AppState>) -> Json<Value> {
    let info = &state.info;
    Json(json!({
        "name": info.name,
        "ip": info.ip,
        "port": info.port,
        "wsUrl": info.ws_url,
        "apiUrl": info.api_url,
        "version": info.version,
        "wsEndpoint": "/ws",
        "apiEndpoint": "/api",
    }))
}

async fn ws_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "clients": state.hub.client_count(),
        "timestamp": now_ms(),
    }))
}

async fn api_status(State(state): State<AppState>) -> Json<RadarStatus> {
    if state.store.is_connected() {
        if let Ok(status) = state.store.get_status().await {
            return Json(status);
        }
    }
    Json(state.status.read().clone())
}

async fn api_current(State(state): State<AppState>) -> Response {
    if state.store.is_connected() {
        if let Ok(snapshot) = state.store.get_snapshot().await {
            return Json(snapshot).into_response();
        }
    }
    match state.last_frame.read().clone() {
        Some(frame) => Json(frame).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no data available"),
    }
}

async fn api_velocity_changes(State(state): State<AppState>) -> Json<Vec<crate::models::VelocityChange>> {
    let changes = if state.store.is_connected() {
        state.store.get_changes(50).await.unwrap_or_default()
    } else {
        Vec::new()
    };
    Json(changes)
}

async fn api_velocity_history(
    State(state): State<AppState>,
    Path(index): Path<i64>,
) -> Response {
    if !(1..=CHANNELS as i64).contains(&index) {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("channel index must be between 1 and {CHANNELS}"),
        );
    }
    let history = state
        .store
        .get_channel_history(index)
        .await
        .unwrap_or_default();
    Json(history).into_response()
}

async fn api_latest_update(State(state): State<AppState>) -> Response {
    if let Some(update) = state.last_update.read().clone() {
        return Json(update).into_response();
    }
    if state.store.is_connected() {
        if let Ok(Some(update)) = state.store.get_latest_update().await {
            return Json(update).into_response();
        }
    }
    error_response(StatusCode::NOT_FOUND, "no changes recorded yet")
}

fn error_response(code: StatusCode, message: &str) -> Response {
    (code, Json(json!({ "error": message }))).into_response()
}

/// CORS for every response, OPTIONS preflight short-circuit, request log.
async fn cors_and_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors(response.headers_mut());
        return response;
    }

    info!("{method} {path}");
    let start = std::time::Instant::now();
    let mut response = next.run(req).await;
    apply_cors(response.headers_mut());
    debug!("{method} {path} -> {} in {:?}", response.status(), start.elapsed());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::state::new_state;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn test_state() -> AppState {
        let mut store_config = StoreConfig::default();
        store_config.enabled = false;
        let store = StoreService::connect(store_config).await;
        let status = new_state(RadarStatus::initializing());
        let last_frame = new_state(None);
        AppState {
            hub: Hub::new(8, status.clone(), last_frame.clone(), store.clone()),
            store,
            status,
            last_frame,
            last_update: new_state(None),
            info: Arc::new(ServerInfo::new("127.0.0.1".into(), 8080)),
            radar_running: Arc::new(AtomicBool::new(true)),
            advertiser_running: Arc::new(AtomicBool::new(true)),
            plc_enabled: false,
            plc_running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_disabled_store_without_degrading() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["services"]["store"], "disabled");
        assert_eq!(json["services"]["radar"], "ok");
    }

    #[tokio::test]
    async fn health_degrades_on_comm_failure() {
        let state = test_state().await;
        state.status.write().status = StatusKind::CommFailure;
        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["services"]["radar"], "offline");
    }

    #[tokio::test]
    async fn velocity_history_rejects_out_of_range_channels() {
        let router = build_router(test_state().await);
        for bad in ["0", "8", "99"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/api/velocity-history/{bad}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn current_falls_back_to_the_in_memory_frame() {
        let state = test_state().await;
        let response = build_router(state.clone())
            .oneshot(Request::builder().uri("/api/current").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        *state.last_frame.write() = Some(RadarFrame::new());
        let response = build_router(state)
            .oneshot(Request::builder().uri("/api/current").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["positions"].as_array().unwrap().len(), CHANNELS);
    }

    #[tokio::test]
    async fn options_preflight_is_accepted_with_cors_headers() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Access-Control-Allow-Origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn discover_exposes_the_connection_coordinates() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(Request::builder().uri("/api/discover").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["wsEndpoint"], "/ws");
        assert_eq!(json["apiEndpoint"], "/api");
        assert_eq!(json["wsUrl"], "ws://127.0.0.1:8080/ws");
    }
}
