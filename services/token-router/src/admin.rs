//! Admin HTTP API over the token pool
//!
//! Thin adapters over `PoolManager` operations. Responses are JSON; tokens
//! are masked unless a listing explicitly asks for them.
//!
//! Endpoints:
//! - GET    /health                 process liveness and pool headline
//! - GET    /metrics                Prometheus exposition
//! - GET    /admin/pool             pool summary and config echo
//! - GET    /admin/tokens           entries (`?unmasked=true` for raw tokens)
//! - POST   /admin/tokens           add tokens
//! - DELETE /admin/tokens           remove tokens
//! - POST   /admin/tokens/enabled   enable or disable one token
//! - POST   /admin/tokens/check     check one token against the upstream now
//! - POST   /admin/health-check     run a health-check pass now
//! - POST   /admin/reload           reload the pool file
//! - POST   /admin/pick             dry-run request routing
//! - POST   /admin/pick/ambient     dry-run ambient pick
//!
//! When an admin key is configured every `/admin` route requires it in the
//! `x-admin-key` header.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::{RegionCode, Secret, mask_token};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use token_pool::{NewToken, PickRequest, PoolManager, TaskType};
use tracing::info;

use crate::error::{ApiError, json_response};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<PoolManager>,
    admin_key: Option<Arc<Secret<String>>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AdminState {
    pub fn new(
        pool: Arc<PoolManager>,
        admin_key: Option<Secret<String>>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            pool,
            admin_key: admin_key.map(Arc::new),
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the router with every route, the admin-key guard and a concurrency
/// limit of `max_connections`.
pub fn build_router(state: AdminState, max_connections: usize) -> Router {
    let admin = Router::new()
        .route("/admin/pool", get(pool_summary))
        .route(
            "/admin/tokens",
            get(list_tokens).post(add_tokens).delete(remove_tokens),
        )
        .route("/admin/tokens/enabled", post(set_token_enabled))
        .route("/admin/tokens/check", post(check_token))
        .route("/admin/health-check", post(run_health_check))
        .route("/admin/reload", post(reload))
        .route("/admin/pick", post(pick))
        .route("/admin/pick/ambient", post(pick_ambient))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .merge(admin)
        .layer(middleware::from_fn(track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn require_admin_key(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.admin_key {
        let supplied = request
            .headers()
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if !admin_key_matches(expected.expose().as_bytes(), supplied) {
            return ApiError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

fn admin_key_matches(expected: &[u8], supplied: Option<&str>) -> bool {
    let Some(supplied) = supplied.map(str::as_bytes) else {
        return false;
    };
    if expected.len() != supplied.len() {
        return false;
    }
    expected.ct_eq(supplied).into()
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    crate::metrics::record_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// GET /health. Always 200 while the process serves requests; `status` is
/// `degraded` when an enabled pool has no live token.
async fn health(State(state): State<AdminState>) -> Response {
    let summary = state.pool.summary().await;
    let status = if !summary.enabled || summary.counts.live > 0 {
        "healthy"
    } else {
        "degraded"
    };
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": status,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "pool": {
                "enabled": summary.enabled,
                "total": summary.counts.total,
                "live": summary.counts.live,
            },
        }),
    )
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn pool_summary(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, &state.pool.summary().await)
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    unmasked: bool,
}

async fn list_tokens(State(state): State<AdminState>, Query(query): Query<ListQuery>) -> Response {
    let tokens = state.pool.entries(!query.unmasked).await;
    json_response(StatusCode::OK, &serde_json::json!({ "tokens": tokens }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTokensBody {
    tokens: Vec<NewToken>,
    #[serde(default)]
    default_region: Option<String>,
}

async fn add_tokens(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddTokensBody>,
) -> Result<Response, ApiError> {
    let default_region = parse_optional_region(body.default_region.as_deref())?;
    let report = state.pool.add_tokens(body.tokens, default_region).await?;
    Ok(json_response(StatusCode::OK, &report))
}

#[derive(Deserialize)]
struct RemoveTokensBody {
    tokens: Vec<String>,
}

async fn remove_tokens(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<RemoveTokensBody>,
) -> Result<Response, ApiError> {
    let removed = state.pool.remove_tokens(&body.tokens).await?;
    let total = state.pool.summary().await.counts.total;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "removed": removed, "total": total }),
    ))
}

#[derive(Deserialize)]
struct SetEnabledBody {
    token: String,
    enabled: bool,
}

async fn set_token_enabled(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<SetEnabledBody>,
) -> Result<Response, ApiError> {
    if !state
        .pool
        .set_token_enabled(&body.token, body.enabled)
        .await?
    {
        return Err(ApiError::NotFound(format!(
            "token {} is not in the pool",
            mask_token(&body.token)
        )));
    }
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "token": mask_token(&body.token), "enabled": body.enabled }),
    ))
}

#[derive(Deserialize)]
struct CheckBody {
    token: String,
    region: String,
}

async fn check_token(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CheckBody>,
) -> Result<Response, ApiError> {
    let region = parse_region(&body.region)?;
    let live = state.pool.check_token(&body.token, region).await?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "token": mask_token(&body.token),
            "region": region,
            "live": live,
        }),
    ))
}

async fn run_health_check(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let report = state.pool.run_health_check().await?;
    Ok(json_response(StatusCode::OK, &report))
}

async fn reload(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let count = state.pool.reload_from_disk().await?;
    info!(tokens = count, "pool reloaded via admin API");
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "tokens": count }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PickBody {
    #[serde(default)]
    authorization: Option<String>,
    #[serde(default)]
    model: Option<String>,
    task_type: TaskType,
    #[serde(default)]
    capability_tags: Vec<String>,
    #[serde(default)]
    region: Option<String>,
}

/// POST /admin/pick. Routes like a real request would and reports the
/// chosen token masked.
async fn pick(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<PickBody>,
) -> Result<Response, ApiError> {
    let request = PickRequest {
        authorization: body.authorization,
        requested_model: body.model,
        task_type: body.task_type,
        required_capability_tags: body.capability_tags,
        x_region: body.region,
    };
    let picked = state.pool.pick_token_for_request(&request).await?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "token": mask_token(&picked.token), "region": picked.region }),
    ))
}

#[derive(Deserialize, Default)]
struct AmbientBody {
    #[serde(default)]
    authorization: Option<String>,
}

async fn pick_ambient(
    State(state): State<AdminState>,
    body: Option<axum::Json<AmbientBody>>,
) -> Result<Response, ApiError> {
    let body = body.map(|axum::Json(b)| b).unwrap_or_default();
    let picked = state
        .pool
        .pick_token_from_authorization(body.authorization.as_deref())
        .await?;
    let body = match picked {
        Some(token) => serde_json::json!({
            "token": mask_token(&token.token),
            "region": token.region,
        }),
        None => serde_json::json!({ "token": null, "region": null }),
    };
    Ok(json_response(StatusCode::OK, &body))
}

fn parse_region(raw: &str) -> Result<RegionCode, ApiError> {
    RegionCode::parse(raw.trim()).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unsupported region {raw:?}, expected one of cn, us, hk, jp, sg"
        ))
    })
}

fn parse_optional_region(raw: Option<&str>) -> Result<Option<RegionCode>, ApiError> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => parse_region(raw).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::future::Future;
    use std::pin::Pin;
    use token_pool::PoolConfig;
    use tower::ServiceExt;
    use upstream::{CapabilitySnapshot, Credit, Upstream};

    /// Upstream that accepts every token except those starting with `dead`.
    struct StaticUpstream;

    impl Upstream for StaticUpstream {
        fn id(&self) -> &str {
            "static"
        }

        fn token_live_status<'a>(
            &'a self,
            token: &'a str,
            _region: RegionCode,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<bool>> + Send + 'a>> {
            Box::pin(async move { Ok(!token.starts_with("dead")) })
        }

        fn credit<'a>(
            &'a self,
            _token: &'a str,
            _region: RegionCode,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<Credit>> + Send + 'a>> {
            Box::pin(async move {
                Ok(Credit {
                    gift_credit: 10,
                    ..Credit::default()
                })
            })
        }

        fn receive_credit<'a>(
            &'a self,
            token: &'a str,
            region: RegionCode,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<Credit>> + Send + 'a>> {
            self.credit(token, region)
        }

        fn capabilities<'a>(
            &'a self,
            _token: &'a str,
            _region: RegionCode,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<CapabilitySnapshot>> + Send + 'a>>
        {
            Box::pin(async move { Ok(CapabilitySnapshot::default()) })
        }
    }

    fn test_pool(dir: &std::path::Path, enabled: bool) -> Arc<PoolManager> {
        let config = PoolConfig {
            enabled,
            file_path: dir.join("token-pool.json"),
            health_check_interval: None,
            ..PoolConfig::default()
        };
        Arc::new(PoolManager::new(config, Arc::new(StaticUpstream)))
    }

    fn test_app(pool: Arc<PoolManager>, admin_key: Option<&str>) -> Router {
        let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let state = AdminState::new(
            pool,
            admin_key.map(|k| Secret::new(k.to_string())),
            prometheus,
        );
        build_router(state, 16)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_pool_headline() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, json) = send(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pool"]["total"], 0);
    }

    #[tokio::test]
    async fn add_list_and_remove_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({
                    "tokens": ["token-admin-0001", {"token": "token-admin-0002", "region": "jp"}],
                    "defaultRegion": "us"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["added"], 2);
        assert_eq!(json["total"], 2);

        let (_, masked) = send(&app, get_request("/admin/tokens")).await;
        assert_eq!(masked["tokens"][0]["token"], "toke...0001");
        assert_eq!(masked["tokens"][0]["region"], "us");
        assert_eq!(masked["tokens"][1]["region"], "jp");

        let (_, raw) = send(&app, get_request("/admin/tokens?unmasked=true")).await;
        assert_eq!(raw["tokens"][0]["token"], "token-admin-0001");

        let (status, json) = send(
            &app,
            json_request(
                "DELETE",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["token-admin-0001", "token-missing"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 1);
        assert_eq!(json["total"], 1);
    }

    #[tokio::test]
    async fn prefixed_token_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["us-legacy-token-1"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("no longer supported"));
    }

    #[tokio::test]
    async fn unknown_default_region_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["token-admin-0001"], "defaultRegion": "eu" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn set_enabled_unknown_token_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens/enabled",
                serde_json::json!({ "token": "token-nobody-01", "enabled": false }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn check_then_pick_routes_to_live_token() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path(), true);
        let app = test_app(pool, None);

        send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["token-routable-1"], "defaultRegion": "hk" }),
            ),
        )
        .await;

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens/check",
                serde_json::json!({ "token": "token-routable-1", "region": "hk" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["live"], true);

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/pick",
                serde_json::json!({ "taskType": "image", "model": "any-model" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["token"], "toke...le-1");
        assert_eq!(json["region"], "hk");
    }

    #[tokio::test]
    async fn pick_rejection_renders_code_region_and_reason() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/pick",
                serde_json::json!({ "taskType": "video", "region": "mars" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "unsupported_region");
        assert!(json["reason"].as_str().unwrap().contains("mars"));

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/pick",
                serde_json::json!({ "taskType": "video", "authorization": "Basic abc" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "invalid_authorization_format");
    }

    #[tokio::test]
    async fn ambient_pick_without_live_tokens_returns_null() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);

        let (status, json) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/admin/pick/ambient")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["token"].is_null());

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/pick/ambient",
                serde_json::json!({ "authorization": "Bearer token-caller-0001" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["token"], "toke...0001");
    }

    #[tokio::test]
    async fn health_check_and_reload_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);
        send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["token-checked-01", "dead-token-0001"], "defaultRegion": "us" }),
            ),
        )
        .await;

        let (status, json) = send(
            &app,
            json_request("POST", "/admin/health-check", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["checked"], 2);
        assert_eq!(json["live"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["skipped"], false);

        let (status, json) = send(
            &app,
            json_request("POST", "/admin/reload", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tokens"], 2);
    }

    #[tokio::test]
    async fn disabled_pool_mutations_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), false), None);

        let (status, json) = send(
            &app,
            json_request(
                "POST",
                "/admin/tokens",
                serde_json::json!({ "tokens": ["token-refused-01"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "token pool is disabled");

        let (status, _) = send(
            &app,
            json_request("POST", "/admin/reload", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, health) = send(&app, get_request("/health")).await;
        assert_eq!(health["status"], "healthy");
    }

    #[tokio::test]
    async fn admin_key_is_enforced_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), Some("s3cret"));

        let (status, _) = send(&app, get_request("/admin/pool")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/admin/pool")
            .header(ADMIN_KEY_HEADER, "wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/admin/pool")
            .header(ADMIN_KEY_HEADER, "s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["strategy"], "random");

        // Health stays open for probes.
        let (status, _) = send(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn admin_key_comparison_requires_exact_bytes() {
        assert!(admin_key_matches(b"s3cret", Some("s3cret")));
        assert!(!admin_key_matches(b"s3cret", Some("s3cre")));
        assert!(!admin_key_matches(b"s3cret", Some("s3cret ")));
        assert!(!admin_key_matches(b"s3cret", Some("S3CRET")));
        assert!(!admin_key_matches(b"s3cret", Some("")));
        assert!(!admin_key_matches(b"s3cret", None));
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_pool(dir.path(), true), None);
        let (status, _) = send(&app, get_request("/v1/generate")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
