//! Small admin HTTP API over the ban state.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use leechban_core::BanManager;
use subtle::ConstantTimeEq;
use tokio::sync::Notify;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::ApiConfig;

const MAX_CONCURRENT_REQUESTS: usize = 32;

#[derive(Clone)]
pub struct AppCtx {
    pub bans: Arc<BanManager>,
    pub admin_token: String,
    pub shutdown: Arc<Notify>,
    /// Whether explicit removals are flushed to the state file.
    pub persist: bool,
    pub started: Instant,
}

pub fn router(ctx: AppCtx) -> Router {
    let security_headers = (
        SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::overriding(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ),
    );

    Router::new()
        .route("/health", get(h_health))
        .route("/bans", get(h_list_bans))
        .route("/bans/stats", get(h_stats))
        .route("/bans/:ip", get(h_get_ban).delete(h_delete_ban))
        .route("/admin/shutdown", post(h_admin_shutdown))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(security_headers.0)
        .layer(security_headers.1)
        .layer(security_headers.2)
}

pub async fn serve(cfg: &ApiConfig, ctx: AppCtx) -> Result<()> {
    let addr: SocketAddr = cfg
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid api.bind '{}': {}", cfg.bind, e))?;
    if cfg.token_is_weak() {
        warn!("api.admin_token is shorter than recommended 32 characters");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("admin API listening on {}", addr);
    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

/// Checks `Authorization: Bearer <token>` in constant time. An empty expected token disables the check.
fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
        .into_response()
}

async fn h_health(State(ctx): State<AppCtx>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "bans": ctx.bans.len(),
        "uptime_secs": ctx.started.elapsed().as_secs(),
    }))
}

async fn h_list_bans(State(ctx): State<AppCtx>) -> impl IntoResponse {
    Json(ctx.bans.active_bans())
}

async fn h_stats(State(ctx): State<AppCtx>) -> impl IntoResponse {
    Json(ctx.bans.stats())
}

async fn h_get_ban(State(ctx): State<AppCtx>, Path(ip): Path<String>) -> impl IntoResponse {
    match ctx.bans.get_ban(&ip) {
        Some(ban) => (StatusCode::OK, Json(ban)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn h_delete_ban(
    State(ctx): State<AppCtx>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    if !authorized(&headers, &ctx.admin_token) {
        warn!("ban removal attempt with invalid token");
        return unauthorized();
    }
    if !ctx.bans.remove_ban(&ip) {
        return StatusCode::NOT_FOUND.into_response();
    }
    info!("ban for {} removed via API", ip);

    if ctx.persist {
        let bans = ctx.bans.clone();
        match tokio::task::spawn_blocking(move || bans.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to save ban state: {e}"),
            Err(e) => error!("ban state save task failed: {e}"),
        }
    }
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

async fn h_admin_shutdown(State(ctx): State<AppCtx>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, &ctx.admin_token) {
        warn!("admin shutdown attempt with invalid token");
        return unauthorized();
    }
    info!("admin shutdown accepted");
    // A stored permit survives a cycle that is still running.
    ctx.shutdown.notify_one();
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    fn ctx() -> AppCtx {
        let bans = Arc::new(BanManager::in_memory());
        bans.add_ban("10.0.0.9", "Matched rule: leech", "leech", Duration::from_secs(600), 0);
        AppCtx {
            bans,
            admin_token: TOKEN.to_string(),
            shutdown: Arc::new(Notify::new()),
            persist: false,
            started: Instant::now(),
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn bearer_token_check() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, TOKEN));
        assert!(authorized(&headers, ""));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!authorized(&headers, TOKEN));

        let good = HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap();
        headers.insert(header::AUTHORIZATION, good);
        assert!(authorized(&headers, TOKEN));

        let raw = HeaderValue::from_str(TOKEN).unwrap();
        headers.insert(header::AUTHORIZATION, raw);
        assert!(!authorized(&headers, TOKEN));
    }

    #[tokio::test]
    async fn health_and_stats() {
        let app = router(ctx());
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["bans"], 1);

        let resp = app
            .oneshot(Request::get("/bans/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["active"], 1);
        assert_eq!(json["permanent"], 0);
    }

    #[tokio::test]
    async fn get_ban_by_ip() {
        let app = router(ctx());
        let resp = app
            .clone()
            .oneshot(Request::get("/bans/10.0.0.9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["rule_name"], "leech");

        let resp = app
            .oneshot(Request::get("/bans/10.0.0.10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_requires_token() {
        let ctx = ctx();
        let bans = ctx.bans.clone();
        let app = router(ctx);

        let resp = app
            .clone()
            .oneshot(Request::delete("/bans/10.0.0.9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(bans.is_banned("10.0.0.9"));

        let authed = || {
            Request::delete("/bans/10.0.0.9")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(authed()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!bans.is_banned("10.0.0.9"));

        let resp = app.oneshot(authed()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_stores_a_permit() {
        let ctx = ctx();
        let shutdown = ctx.shutdown.clone();
        let resp = router(ctx)
            .oneshot(
                Request::post("/admin/shutdown")
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();
    }
}
