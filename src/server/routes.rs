use axum::Router;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use super::AppState;
use super::middleware;
use crate::bridge::{CreateTokenRequest, CreateTokenResponse, PollResponse, TokenPoll};

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|State(state): State<AppState>| async move {
            Json(json!({
                "status": "ok",
                "environment": state.environment,
            }))
        }),
    );

    Router::new()
        .nest("/health", health_routes)
        .route("/api/figma/auth-bridge", post(create_bridge_token))
        .route("/api/figma/auth-bridge/{token}", get(poll_bridge_token))
        .fallback(not_found)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
        // The auth portal polls from a browser context.
        .layer(CorsLayer::permissive())
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

#[tracing::instrument(skip_all)]
async fn create_bridge_token(
    State(state): State<AppState>,
    Json(body): Json<CreateTokenRequest>,
) -> impl IntoResponse {
    match state.token_store.create(body.analysis_endpoint).await {
        Ok(created) => (
            StatusCode::OK,
            Json(CreateTokenResponse {
                token: created.token,
                expires_at: created.expires_at,
                poll_after_ms: created.poll_after.as_millis() as u64,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to create bridge token");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to create token" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct PollQuery {
    #[serde(default)]
    consume: Option<String>,
}

impl PollQuery {
    fn consuming(&self) -> bool {
        matches!(self.consume.as_deref(), Some("1") | Some("true"))
    }
}

#[tracing::instrument(skip_all, fields(token = %token))]
async fn poll_bridge_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<PollQuery>,
) -> impl IntoResponse {
    let poll = state.token_store.poll(&token, query.consuming()).await;
    let body = Json(PollResponse::from(&poll));

    // Live polls answer 200; anything irrecoverable answers 404/410 with
    // the body keeping the exact state.
    let status = match poll {
        TokenPoll::Pending { .. } | TokenPoll::Completed(_) => StatusCode::OK,
        TokenPoll::Expired | TokenPoll::Gone => StatusCode::GONE,
        TokenPoll::NotFound => StatusCode::NOT_FOUND,
    };
    (status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client::{BridgeTransport, HttpBridgeTransport};
    use crate::bridge::store::BridgeTokenStore;
    use crate::bridge::BridgeTiming;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn serve(timing: BridgeTiming) -> (String, Arc<BridgeTokenStore>) {
        let store = Arc::new(BridgeTokenStore::new(timing));
        let app = create_app_for(store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), store)
    }

    fn create_app_for(store: Arc<BridgeTokenStore>) -> Router {
        crate::server::create_app(AppState {
            token_store: store,
            environment: "test".to_string(),
        })
    }

    fn timing(ttl_ms: u64, delay_ms: u64, poll_ms: u64) -> BridgeTiming {
        BridgeTiming {
            ttl: Duration::from_millis(ttl_ms),
            completion_delay: Duration::from_millis(delay_ms),
            poll_interval: Duration::from_millis(poll_ms),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_environment() {
        let (base, _store) = serve(timing(60_000, 20, 30)).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["environment"], "test");
    }

    #[tokio::test]
    async fn full_handshake_over_http() {
        let (base, _store) = serve(timing(60_000, 20, 30)).await;
        let transport =
            HttpBridgeTransport::new(Arc::new(reqwest::Client::new()), base);

        let created = transport.create_token(None).await.unwrap();
        assert_eq!(created.poll_after, Duration::from_millis(30));

        // Before the completion delay: pending.
        match transport.poll(&created.token, false).await.unwrap() {
            TokenPoll::Pending { poll_after, .. } => {
                assert_eq!(poll_after, Duration::from_millis(30));
            }
            other => panic!("expected pending, got {other:?}"),
        }

        sleep(Duration::from_millis(40)).await;

        // Completed, repeatable while not consuming.
        let first = match transport.poll(&created.token, false).await.unwrap() {
            TokenPoll::Completed(c) => c,
            other => panic!("expected completed, got {other:?}"),
        };
        let second = match transport.poll(&created.token, false).await.unwrap() {
            TokenPoll::Completed(c) => c,
            other => panic!("expected completed, got {other:?}"),
        };
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.completed_at, second.completed_at);

        // Consume once, then gone.
        match transport.poll(&created.token, true).await.unwrap() {
            TokenPoll::Completed(c) => assert!(c.consumed_at.is_some()),
            other => panic!("expected completed, got {other:?}"),
        }
        match transport.poll(&created.token, true).await.unwrap() {
            TokenPoll::Gone => {}
            other => panic!("expected gone, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_token_maps_to_gone_status_with_expired_body() {
        let (base, _store) = serve(timing(60, 10, 30)).await;
        let client = reqwest::Client::new();
        let transport = HttpBridgeTransport::new(Arc::new(client.clone()), base.clone());

        let created = transport.create_token(None).await.unwrap();
        sleep(Duration::from_millis(80)).await;

        let response = client
            .get(format!("{base}/api/figma/auth-bridge/{}", created.token))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::GONE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "expired");

        // The transport surfaces the distinction.
        match transport.poll(&created.token, false).await.unwrap() {
            TokenPoll::NotFound => {}
            other => panic!("expected not_found after expiry cleanup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_is_404() {
        let (base, _store) = serve(timing(60_000, 20, 30)).await;
        let response = reqwest::get(format!("{base}/api/figma/auth-bridge/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trailing_slash_is_tolerated() {
        let (base, _store) = serve(timing(60_000, 20, 30)).await;
        let response = reqwest::get(format!("{base}/api/figma/auth-bridge/nope/"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "not_found");
    }
}
