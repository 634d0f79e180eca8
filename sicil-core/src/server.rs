//! HTTP server for Sicil.
//!
//! Exposes health/discovery endpoints and a JSON surface over the lookup,
//! ledger and referral services for whatever transport fronts them.

use crate::config::Config;
use crate::dataset::DatasetCache;
use crate::fetcher::FetchError;
use crate::ledger::{LedgerError, QuotaLedger, UserAccount};
use crate::lookup::{LookupService, SearchOutcome};
use crate::membership::{missing_groups, MembershipGate};
use crate::model::{
    ApiError, ReferralRequest, ReferralResponse, SearchRequest, StartRequest,
    StartResponse,
};
use crate::referral::{InviteStatus, ReferralCoordinator};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use utoipa::OpenApi;

/// OpenAPI documentation for the Sicil API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sicil API",
        version = "0.1.0",
        description = "Quota-metered registry lookup with a referral ledger.",
        license(name = "MIT"),
        contact(name = "Sicil Contributors")
    ),
    paths(
        health_check,
        search,
        get_account,
        get_invite_status,
        start_session,
        record_referral,
        refresh_dataset,
    ),
    components(schemas(
        crate::model::SearchRequest,
        crate::model::StartRequest,
        crate::model::ReferralRequest,
        crate::model::ReferralResponse,
        crate::model::ApiError,
        crate::model::ApiErrorDetail,
        crate::ledger::UserAccount,
    )),
    tags(
        (name = "Lookup", description = "Registry lookups"),
        (name = "Accounts", description = "Quota and referral ledger"),
        (name = "Dataset", description = "Dataset cache control"),
        (name = "Health", description = "Server health and status")
    )
)]
pub struct ApiDoc;

/// Shared application state, created once at startup
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<QuotaLedger>,
    pub cache: Arc<DatasetCache>,
    pub lookup: LookupService,
    pub referrals: ReferralCoordinator,
    gate: Arc<dyn MembershipGate>,
}

impl AppState {
    pub fn new(
        config: Config,
        ledger: Arc<QuotaLedger>,
        cache: Arc<DatasetCache>,
        gate: Arc<dyn MembershipGate>,
    ) -> Self {
        let lookup = LookupService::new(
            Arc::clone(&ledger),
            Arc::clone(&cache),
            config.dataset.serve_stale,
        );
        let referrals = ReferralCoordinator::new(Arc::clone(&ledger), &config.referral.link_prefix);

        Self {
            config,
            ledger,
            cache,
            lookup,
            referrals,
            gate,
        }
    }

    /// Required groups the user has not joined
    pub async fn missing_groups(&self, user_id: i64) -> Vec<String> {
        missing_groups(
            self.gate.as_ref(),
            user_id,
            &self.config.membership.required_groups,
        )
        .await
    }

    async fn require_membership(&self, user_id: i64) -> Result<(), AppError> {
        let missing = self.missing_groups(user_id).await;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MembershipRequired(missing))
        }
    }
}

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/v1/search", post(search))
        .route("/v1/users/:user_id", get(get_account))
        .route("/v1/users/:user_id/invite", get(get_invite_status))
        .route("/v1/start", post(start_session))
        .route("/v1/referrals", post(record_referral))
        .route("/v1/dataset/refresh", post(refresh_dataset))
        .route("/health", get(health_check))
        .route("/", get(root))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// Discovery information
async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loaded = state.cache.snapshot().await.is_loaded();

    Json(serde_json::json!({
        "name": "Sicil",
        "status": "active",
        "version": env!("CARGO_PKG_VERSION"),
        "dataset_loaded": loaded,
        "documentation": {
            "openapi": "/openapi.json",
        },
    }))
}

/// Health check: dataset cache state and ledger reachability
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server health status")
    )
)]
#[instrument(skip(state))]
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dataset = state.cache.status().await;
    let ledger = match state.ledger.stats().await {
        Ok(stats) => serde_json::to_value(stats).unwrap_or(serde_json::Value::Null),
        Err(e) => {
            error!("Ledger unavailable during health check: {}", e);
            serde_json::Value::Null
        }
    };

    let healthy = dataset.loaded && !ledger.is_null();

    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "dataset": dataset,
        "ledger": ledger,
    }))
}

/// Look up an identifier, spending one of the caller's lookups
#[utoipa::path(
    post,
    path = "/v1/search",
    tag = "Lookup",
    request_body = SearchRequest,
    responses(
        (status = 200, description = "Matching records, or an empty result"),
        (status = 400, description = "Identifier is not 11 digits"),
        (status = 403, description = "Required groups not joined", body = ApiError),
        (status = 429, description = "No lookups left"),
        (status = 503, description = "Dataset could not be loaded"),
        (status = 500, description = "Ledger unavailable", body = ApiError)
    )
)]
#[instrument(skip(state, request), fields(user_id = request.user_id))]
async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, AppError> {
    state.require_membership(request.user_id).await?;

    let result = state
        .lookup
        .search(request.user_id, &request.identifier)
        .await?;

    let status = match &result.outcome {
        SearchOutcome::Found(_) | SearchOutcome::Empty => StatusCode::OK,
        SearchOutcome::Invalid(_) => StatusCode::BAD_REQUEST,
        SearchOutcome::Denied(_) => StatusCode::TOO_MANY_REQUESTS,
        SearchOutcome::Failed(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    Ok((status, Json(result)).into_response())
}

/// Account counters, created on first reference
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}",
    tag = "Accounts",
    params(("user_id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Account counters", body = UserAccount),
        (status = 500, description = "Ledger unavailable", body = ApiError)
    )
)]
async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserAccount>, AppError> {
    Ok(Json(state.ledger.get_or_create(user_id).await?))
}

/// Invite progress and invite link
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/invite",
    tag = "Accounts",
    params(("user_id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Invite progress"),
        (status = 403, description = "Required groups not joined", body = ApiError)
    )
)]
async fn get_invite_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<InviteStatus>, AppError> {
    state.require_membership(user_id).await?;
    Ok(Json(state.referrals.invite_status(user_id).await?))
}

/// Start a session, crediting the referrer named by the start token
#[utoipa::path(
    post,
    path = "/v1/start",
    tag = "Accounts",
    request_body = StartRequest,
    responses(
        (status = 200, description = "Account and referral result"),
        (status = 500, description = "Ledger unavailable", body = ApiError)
    )
)]
#[instrument(skip(state, request), fields(user_id = request.user_id))]
async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    // The referral counts even if the newcomer has not joined the groups yet
    let outcome = state
        .referrals
        .on_start(request.user_id, request.start_token.as_deref())
        .await?;
    let missing_groups = state.missing_groups(request.user_id).await;

    Ok(Json(StartResponse {
        outcome,
        missing_groups,
    }))
}

/// Credit a referrer for a referred user
#[utoipa::path(
    post,
    path = "/v1/referrals",
    tag = "Accounts",
    request_body = ReferralRequest,
    responses(
        (status = 200, description = "Whether the bonus was granted", body = ReferralResponse),
        (status = 500, description = "Ledger unavailable", body = ApiError)
    )
)]
async fn record_referral(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReferralRequest>,
) -> Result<Json<ReferralResponse>, AppError> {
    let bonus_granted = state
        .referrals
        .on_referral(request.referrer_id, request.referred_id)
        .await?;
    Ok(Json(ReferralResponse { bonus_granted }))
}

/// Refetch the dataset now
#[utoipa::path(
    post,
    path = "/v1/dataset/refresh",
    tag = "Dataset",
    responses(
        (status = 200, description = "Dataset refreshed"),
        (status = 502, description = "Refresh failed, previous snapshot kept", body = ApiError)
    )
)]
async fn refresh_dataset(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    state.cache.refresh_now().await?;
    Ok(Json(state.cache.status().await).into_response())
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    MembershipRequired(Vec<String>),
    Ledger(LedgerError),
    Fetch(FetchError),
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        AppError::Ledger(e)
    }
}

impl From<FetchError> for AppError {
    fn from(e: FetchError) -> Self {
        AppError::Fetch(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::MembershipRequired(missing) => {
                (StatusCode::FORBIDDEN, ApiError::membership_required(missing))
            }
            AppError::Ledger(e) => {
                error!("Ledger error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::storage_unavailable(e.to_string()),
                )
            }
            AppError::Fetch(e) => (
                StatusCode::BAD_GATEWAY,
                ApiError::new(e.to_string(), "dataset_unavailable"),
            ),
        };

        (status, Json(error)).into_response()
    }
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(state: Arc<AppState>, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.server_addr();
    let router = create_router(state);

    info!("Starting Sicil server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::ScriptedFetcher;
    use crate::ledger::testing::temp_ledger;
    use crate::membership::{MembershipError, OpenGate};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const DATA: &str = r#"[
        {"Veri": [{"KISI_TC_KIMLIK_NO": "11111111111", "KISI_ADI": "AYSE"}]},
        {"KISI_TC_KIMLIK_NO": "11111111111", "KISI_ADI": "FATMA"}
    ]"#;

    /// Only user 1 has joined the groups
    struct OnlyUserOne;

    #[async_trait]
    impl MembershipGate for OnlyUserOne {
        async fn is_member(&self, user_id: i64, _group: &str) -> Result<bool, MembershipError> {
            Ok(user_id == 1)
        }
    }

    async fn app(gate: Arc<dyn MembershipGate>, groups: &[&str]) -> (tempfile::TempDir, Router) {
        let (dir, ledger) = temp_ledger().await;
        let mut config = Config::default();
        config.dataset.url = "https://registry.test/data.json".to_string();
        config.membership.required_groups = groups.iter().map(|g| g.to_string()).collect();
        config.referral.link_prefix = "https://t.me/registry_bot?start=".to_string();

        let cache = Arc::new(DatasetCache::new(
            &config.dataset,
            Arc::new(ScriptedFetcher::json(DATA)),
        ));
        let state = AppState::new(config, Arc::new(ledger), cache, gate);
        (dir, create_router(Arc::new(state)))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_search_found_then_denied() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;
        let body = serde_json::json!({"user_id": 7, "identifier": "11111111111"});

        let (status, json) = send(&router, post("/v1/search", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "found");
        assert_eq!(json["detail"].as_array().unwrap().len(), 2);
        assert_eq!(json["detail"][0]["fields"]["KISI_ADI"], "AYSE");
        assert_eq!(json["remaining_searches"], 2);

        send(&router, post("/v1/search", body.clone())).await;
        send(&router, post("/v1/search", body.clone())).await;
        let (status, json) = send(&router, post("/v1/search", body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["detail"], "no_quota");
        assert_eq!(json["remaining_searches"], 0);
    }

    #[tokio::test]
    async fn test_search_invalid_identifier() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;

        let (status, json) = send(
            &router,
            post(
                "/v1/search",
                serde_json::json!({"user_id": 7, "identifier": "1234567890a"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "bad_identifier_format");
        assert!(json.get("remaining_searches").is_none());
    }

    #[tokio::test]
    async fn test_search_requires_membership() {
        let (_dir, router) = app(Arc::new(OnlyUserOne), &["@registry_news"]).await;

        let (status, json) = send(
            &router,
            post(
                "/v1/search",
                serde_json::json!({"user_id": 2, "identifier": "11111111111"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["missing_groups"][0], "@registry_news");

        // Rejected before any quota was spent
        let (_, account) = send(&router, get("/v1/users/2")).await;
        assert_eq!(account["remaining_searches"], 3);

        let (status, _) = send(
            &router,
            post(
                "/v1/search",
                serde_json::json!({"user_id": 1, "identifier": "11111111111"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_with_referral_and_invite_status() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;
        send(&router, get("/v1/users/10")).await;

        for referred in [20, 21, 22] {
            let (status, json) = send(
                &router,
                post(
                    "/v1/start",
                    serde_json::json!({"user_id": referred, "start_token": "10"}),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["referrer_id"], 10);
            assert_eq!(json["referrer_bonus_granted"], referred == 22);
            assert_eq!(json["account"]["remaining_searches"], 3);
        }

        let (status, json) = send(&router, get("/v1/users/10/invite")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["invites_needed"], 0);
        assert_eq!(json["account"]["remaining_searches"], 33);
        assert_eq!(json["invite_link"], "https://t.me/registry_bot?start=10");
    }

    #[tokio::test]
    async fn test_start_reports_missing_groups() {
        let (_dir, router) = app(Arc::new(OnlyUserOne), &["@registry_news"]).await;
        send(&router, get("/v1/users/1")).await;

        let (status, json) = send(
            &router,
            post("/v1/start", serde_json::json!({"user_id": 5, "start_token": "1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["missing_groups"][0], "@registry_news");

        // Referral was still counted
        let (_, account) = send(&router, get("/v1/users/1")).await;
        assert_eq!(account["invited_users"], 1);
    }

    #[tokio::test]
    async fn test_referral_endpoint() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;

        let (status, json) = send(
            &router,
            post(
                "/v1/referrals",
                serde_json::json!({"referrer_id": 3, "referred_id": 3}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["bonus_granted"], false);

        let (_, account) = send(&router, get("/v1/users/3")).await;
        assert_eq!(account["total_invites"], 0);
    }

    #[tokio::test]
    async fn test_health_and_refresh() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;

        let (status, json) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["dataset"]["loaded"], false);

        let (status, json) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/v1/dataset/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["records"], 2);
        assert_eq!(json["pages"], 1);

        let (_, json) = send(&router, get("/health")).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["ledger"]["users"], 0);
    }

    #[tokio::test]
    async fn test_openapi_document() {
        let (_dir, router) = app(Arc::new(OpenGate), &[]).await;

        let (status, json) = send(&router, get("/openapi.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["paths"].get("/v1/search").is_some());
        assert!(json["paths"].get("/v1/users/{user_id}").is_some());
    }
}
