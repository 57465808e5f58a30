//! HTTP surface: the `/sprinkler/*` REST routes of §6, relayed to the
//! single tick task that owns the [`Engine`](crate::engine::Engine) over
//! an `mpsc` channel. No handler ever touches engine state directly.

use crate::engine::Command;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub commands: mpsc::Sender<Command>,
}

/// Round-trip a command through the tick task's channel and wait for its
/// reply. `None` means the engine's command loop has already shut down.
async fn call<T>(
    state: &AppState,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Option<T> {
    let (tx, rx) = oneshot::channel();
    if state.commands.send(build(tx)).await.is_err() {
        error!("engine command channel closed, dropping request");
        return None;
    }
    rx.await.ok()
}

fn engine_unavailable() -> impl IntoResponse {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "engine unavailable"})))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sprinkler/config", get(get_config).post(set_config))
        .route("/sprinkler/status", get(status))
        .route("/sprinkler/raindelay", get(raindelay))
        .route("/sprinkler/rain", get(rain))
        .route("/sprinkler/index", get(index))
        .route("/sprinkler/refresh", get(refresh))
        .route("/sprinkler/program/on", get(program_on))
        .route("/sprinkler/zone/on", get(zone_on))
        .route("/sprinkler/zone/off", get(zone_off))
        .route("/sprinkler/onoff", get(onoff))
        .route("/sprinkler/weather/{*path}", get(weather_stub).post(weather_stub))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    match call(&state, Command::GetConfig).await {
        Some(v) => Json(v).into_response(),
        None => engine_unavailable().into_response(),
    }
}

async fn set_config(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match call(&state, |reply| Command::SetConfig(body, reply)).await {
        Some(Ok(())) => StatusCode::OK.into_response(),
        Some(Err(e)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
                .into_response()
        }
        None => engine_unavailable().into_response(),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match call(&state, Command::Status).await {
        Some(v) => Json(v).into_response(),
        None => engine_unavailable().into_response(),
    }
}

#[derive(Deserialize)]
struct RainDelayParams {
    amount: Option<i64>,
}

async fn raindelay(State(state): State<AppState>, Query(q): Query<RainDelayParams>) -> impl IntoResponse {
    let amount = q.amount.unwrap_or(86_400);
    if state.commands.send(Command::RainDelay(amount)).await.is_err() {
        return engine_unavailable().into_response();
    }
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct ActiveParams {
    active: Option<bool>,
}

async fn rain(State(state): State<AppState>, Query(q): Query<ActiveParams>) -> impl IntoResponse {
    let active = q.active.unwrap_or(true);
    if state.commands.send(Command::RainActive(active)).await.is_err() {
        return engine_unavailable().into_response();
    }
    StatusCode::OK.into_response()
}

async fn index(State(state): State<AppState>, Query(q): Query<ActiveParams>) -> impl IntoResponse {
    let active = q.active.unwrap_or(true);
    if state.commands.send(Command::IndexActive(active)).await.is_err() {
        return engine_unavailable().into_response();
    }
    StatusCode::OK.into_response()
}

async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    if state.commands.send(Command::Refresh).await.is_err() {
        return engine_unavailable().into_response();
    }
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct ProgramOnParams {
    name: String,
}

async fn program_on(
    State(state): State<AppState>,
    Query(q): Query<ProgramOnParams>,
) -> impl IntoResponse {
    match call(&state, |reply| Command::ProgramOn(q.name, reply)).await {
        Some(launched) => Json(json!({"launched": launched})).into_response(),
        None => engine_unavailable().into_response(),
    }
}

#[derive(Deserialize)]
struct ZoneOnParams {
    name: String,
    pulse: Option<i64>,
}

async fn zone_on(State(state): State<AppState>, Query(q): Query<ZoneOnParams>) -> impl IntoResponse {
    let pulse = q.pulse.unwrap_or(30);
    match call(&state, |reply| Command::ZoneOn(q.name, pulse, reply)).await {
        Some(ok) => Json(json!({"accepted": ok})).into_response(),
        None => engine_unavailable().into_response(),
    }
}

async fn zone_off(State(state): State<AppState>) -> impl IntoResponse {
    if state.commands.send(Command::ZoneOff).await.is_err() {
        return engine_unavailable().into_response();
    }
    StatusCode::OK.into_response()
}

async fn onoff(State(state): State<AppState>) -> impl IntoResponse {
    match call(&state, Command::OnOff).await {
        Some(on) => Json(json!({"on": on})).into_response(),
        None => engine_unavailable().into_response(),
    }
}

/// Placeholder surface for the weather integration the original wired but
/// this crate does not implement; returns an empty JSON object with 200 so
/// operator UIs built against the original protocol don't 404.
async fn weather_stub() -> impl IntoResponse {
    Json(Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{NullDepot, StaticDiscovery};
    use crate::engine::Engine;
    use crate::time_util::SimClock;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let path = format!(
            "{}/sprinkler-http-test-config-{}.json",
            std::env::temp_dir().display(),
            std::process::id()
        );
        std::fs::write(&path, r#"{"zones":[{"name":"lawn"}],"programs":[{"name":"p","zones":[]}]}"#).unwrap();
        let state_path = format!(
            "{}/sprinkler-http-test-state-{}.json",
            std::env::temp_dir().display(),
            std::process::id()
        );
        let _ = std::fs::remove_file(&state_path);

        let engine = Engine::new(
            "test-host".into(),
            path,
            state_path,
            Arc::new(StaticDiscovery::new()),
            Arc::new(NullDepot::new()),
            SimClock::real(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(engine.run(rx));
        router(AppState { commands: tx })
    }

    #[tokio::test]
    async fn status_returns_expected_top_level_shape() {
        let app = test_app().await;
        let req = Request::builder().uri("/sprinkler/status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["host"], "test-host");
        assert!(json["sprinkler"]["zone"].is_object());
    }

    #[tokio::test]
    async fn config_get_returns_json_object() {
        let app = test_app().await;
        let req = Request::builder().uri("/sprinkler/config").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["zones"].is_array());
    }

    #[tokio::test]
    async fn config_post_with_invalid_body_returns_500() {
        let app = test_app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/sprinkler/config")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn zone_on_accepts_known_zone() {
        let app = test_app().await;
        let req = Request::builder()
            .uri("/sprinkler/zone/on?name=lawn&pulse=45")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accepted"], true);
    }

    #[tokio::test]
    async fn onoff_toggles_and_reports_new_state() {
        let app = test_app().await;
        let req = Request::builder().uri("/sprinkler/onoff").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["on"].is_boolean());
    }

    #[tokio::test]
    async fn weather_stub_returns_empty_object() {
        let app = test_app().await;
        let req = Request::builder().uri("/sprinkler/weather/forecast").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({}));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = test_app().await;
        let req = Request::builder().uri("/sprinkler/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
