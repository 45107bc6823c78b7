use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use termplan_core::agent::ModelCaller;
use termplan_core::catalog::Catalog;
use termplan_core::error::{BackendError, EngineError, ErrorKind};
use termplan_core::lesson::{LessonError, LessonPlanRequest, LessonPlanResponse, LessonPlanner};
use termplan_core::model::{CurriculumPlan, PlanRequest};
use termplan_core::retrieval::VectorIndex;
use termplan_core::{PlanEngine, Stage};

use crate::backends;
use crate::config::TermplanConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    stage: Option<Stage>,
}

/// Non-standard "client closed request" status.
fn client_closed() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::EmbeddingUnavailable | ErrorKind::RetrievalUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::GenerationTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::GenerationRefused | ErrorKind::GenerationFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::PlanInvalid => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Cancelled => client_closed(),
    }
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorKind::InvalidRequest.code(),
            message: msg.into(),
            stage: Some(Stage::Request),
        }
    }

    pub fn unavailable(err: BackendError) -> Self {
        tracing::warn!(error = %err, "vector store request failed");
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: ErrorKind::RetrievalUnavailable.code(),
            message: "The curriculum reference store is unavailable. Please try again later."
                .to_string(),
            stage: Some(Stage::Retrieval),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let kind = err.kind();
        if kind != ErrorKind::InvalidRequest {
            tracing::warn!(code = kind.code(), stage = %err.stage(), error = %err, "request failed");
        }
        Self {
            status: status_for(kind),
            code: kind.code(),
            message: err.summary(),
            stage: Some(err.stage()),
        }
    }
}

impl From<LessonError> for AppError {
    fn from(err: LessonError) -> Self {
        match err {
            LessonError::InvalidRequest(_) => Self::bad_request(err.summary()),
            LessonError::Generation(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "stage": self.stage,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    engine: PlanEngine,
    lessons: LessonPlanner,
    catalog: Arc<Catalog>,
    index: Arc<dyn VectorIndex>,
    /// Parent of every request's cancellation token.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(engine: PlanEngine, index: Arc<dyn VectorIndex>, catalog: Catalog) -> Self {
        let caller: ModelCaller = engine.caller().clone();
        Self {
            lessons: LessonPlanner::new(caller),
            engine,
            catalog: Arc::new(catalog),
            index,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Adds the handling time in seconds as `x-process-time`.
async fn process_time(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = format!("{:.6}", started.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert("x-process-time", value);
    }
    response
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/terms/plan", post(create_terms_plan))
        .route("/api/lesson-plan", post(create_lesson_plan))
        .route("/api/projects", get(list_projects))
        .route("/api/assessment-criteria", get(list_criteria))
        .route("/api/collections", get(list_collections))
        .layer(middleware::from_fn(process_time))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: &TermplanConfig) -> Result<()> {
    let (engine, index) = backends::build_engine(config)?;
    let catalog = Catalog::builtin().context("built-in catalog is invalid")?;
    let state = AppState::new(engine, index, catalog);
    let shutdown = state.shutdown_token();
    let app = build_router(state, &config.cors_origins);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
    tracing::info!("termplan serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!("termplan serve shut down");
    Ok(())
}

/// Wait for Ctrl+C, then cancel in-flight generations.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubjectQuery {
    subject: Option<String>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn create_terms_plan(
    State(state): State<AppState>,
    payload: Result<Json<PlanRequest>, JsonRejection>,
) -> Result<Json<CurriculumPlan>, AppError> {
    let Json(request) = payload?;
    // Dropping the handler (client went away) cancels the generation.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let plan = state.engine.generate_plan(request, &cancel).await?;
    Ok(Json(plan))
}

async fn create_lesson_plan(
    State(state): State<AppState>,
    payload: Result<Json<LessonPlanRequest>, JsonRejection>,
) -> Result<Json<LessonPlanResponse>, AppError> {
    let Json(request) = payload?;
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let response = state.lessons.generate(&request, &cancel).await?;
    Ok(Json(response))
}

async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<SubjectQuery>,
) -> Json<serde_json::Value> {
    let projects = state.catalog.projects(query.subject.as_deref());
    Json(json!({
        "success": true,
        "count": projects.len(),
        "projects": projects,
    }))
}

async fn list_criteria(
    State(state): State<AppState>,
    Query(query): Query<SubjectQuery>,
) -> Json<serde_json::Value> {
    let criteria = state.catalog.criteria(query.subject.as_deref());
    Json(json!({
        "success": true,
        "count": criteria.len(),
        "criteria": criteria,
    }))
}

async fn list_collections(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let collections = state
        .index
        .list_collections()
        .await
        .map_err(AppError::unavailable)?;
    Ok(Json(json!({
        "success": true,
        "count": collections.len(),
        "collections": collections,
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use termplan_core::agent::LanguageModel;
    use termplan_core::catalog::Catalog;
    use termplan_core::retrieval::VectorIndex;
    use termplan_test_utils::{
        FailingIndex, FnModel, StaticIndex, StubModel, engine_with, engine_with_config,
        fixture_fragments, test_config,
    };

    use super::{AppState, build_router};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn app_with(model: Arc<dyn LanguageModel>, index: Arc<dyn VectorIndex>) -> axum::Router {
        let engine = engine_with(model, index.clone());
        let state = AppState::new(engine, index, Catalog::builtin().unwrap());
        build_router(state, &[])
    }

    fn healthy_app() -> axum::Router {
        app_with(
            Arc::new(StubModel::new()),
            Arc::new(StaticIndex::new(fixture_fragments())),
        )
    }

    async fn get(app: axum::Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_json(app: axum::Router, uri: &str, body: Value) -> axum::response::Response {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn plan_body(term_count: i64) -> Value {
        json!({
            "curriculum": "National",
            "subject": "Math",
            "grade": "5",
            "term_count": term_count,
        })
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_healthy() {
        let resp = get(healthy_app(), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-process-time"));
        assert_eq!(body_json(resp).await, json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn plan_endpoint_returns_plan() {
        let resp = post_json(healthy_app(), "/api/terms/plan", plan_body(3)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let terms = json["terms"].as_array().unwrap();
        assert_eq!(terms.len(), 3);
        for (i, term) in terms.iter().enumerate() {
            assert_eq!(term["term_number"], json!(i + 1));
        }
        assert_eq!(json["grounded"], json!(true));
        assert_eq!(json["subject"], json!("Math"));
    }

    #[tokio::test]
    async fn invalid_term_count_is_bad_request() {
        let resp = post_json(healthy_app(), "/api/terms/plan", plan_body(0)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("invalid_request"));
        assert_eq!(json["error"]["stage"], json!("request"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let resp = post_json(healthy_app(), "/api/terms/plan", json!({ "subject": "Math" })).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("invalid_request"));
    }

    #[tokio::test]
    async fn unreachable_store_is_service_unavailable() {
        let app = app_with(Arc::new(StubModel::new()), Arc::new(FailingIndex::unreachable()));
        let resp = post_json(app, "/api/terms/plan", plan_body(3)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("retrieval_unavailable"));
        assert_eq!(json["error"]["stage"], json!("retrieval"));
    }

    #[tokio::test]
    async fn refusal_is_bad_gateway_without_model_details() {
        let app = app_with(Arc::new(FnModel::refusing()), Arc::new(StaticIndex::empty()));
        let resp = post_json(app, "/api/terms/plan", plan_body(2)).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("generation_refused"));
        let message = json["error"]["message"].as_str().unwrap();
        assert!(!message.contains("content policy"), "{message}");
    }

    #[tokio::test]
    async fn malformed_output_is_bad_gateway() {
        let app = app_with(Arc::new(FnModel::malformed()), Arc::new(StaticIndex::empty()));
        let resp = post_json(app, "/api/terms/plan", plan_body(2)).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("generation_failed"));
    }

    #[tokio::test]
    async fn exhausted_permits_are_too_many_requests() {
        let mut config = test_config();
        config.max_concurrent_generations = 1;
        config.backpressure_wait_ms = 10;
        let model = Arc::new(StubModel::new().with_latency(Duration::from_millis(300)));
        let index: Arc<dyn VectorIndex> = Arc::new(StaticIndex::empty());
        let engine = engine_with_config(config, model, index.clone());
        let app = build_router(AppState::new(engine, index, Catalog::builtin().unwrap()), &[]);

        let (first, second) = tokio::join!(
            post_json(app.clone(), "/api/terms/plan", plan_body(1)),
            post_json(app, "/api/terms/plan", plan_body(1)),
        );
        let mut statuses = [first.status().as_u16(), second.status().as_u16()];
        statuses.sort_unstable();
        assert_eq!(statuses, [200, 429]);
    }

    #[tokio::test]
    async fn lesson_plan_endpoint_returns_lessons() {
        let body = json!({
            "syllabus_data": "Fractions: equivalence and comparison",
            "num_classes": 2,
            "class_duration": "45 minutes",
            "teaching_style": "lecture",
        });
        let resp = post_json(healthy_app(), "/api/lesson-plan", body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], json!(true));
        assert_eq!(json["lesson_plans"].as_array().unwrap().len(), 2);
        assert_eq!(json["total_duration"], json!("1 hours 30 minutes"));
        assert_eq!(json["teaching_style"], json!("lecture"));
    }

    #[tokio::test]
    async fn lesson_plan_rejects_too_many_classes() {
        let body = json!({
            "syllabus": "Fractions",
            "num_classes": 80,
            "class_duration": "45 minutes",
        });
        let resp = post_json(healthy_app(), "/api/lesson-plan", body).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], json!("invalid_request"));
    }

    #[tokio::test]
    async fn projects_filter_by_subject() {
        let resp = get(healthy_app(), "/api/projects?subject=Math").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let projects = json["projects"].as_array().unwrap();
        assert_eq!(json["count"], json!(projects.len()));
        assert!(!projects.is_empty());
        for p in projects {
            let subject = p.get("subject").and_then(Value::as_str);
            assert!(matches!(subject, None | Some("Math")), "{p}");
        }
    }

    #[tokio::test]
    async fn criteria_without_filter_list_everything() {
        let all = Catalog::builtin().unwrap().criteria.len();
        let resp = get(healthy_app(), "/api/assessment-criteria").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["criteria"].as_array().unwrap().len(), all);
    }

    #[tokio::test]
    async fn collections_lists_index_collections() {
        let resp = get(healthy_app(), "/api/collections").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({ "success": true, "count": 1, "collections": ["static"] })
        );
    }

    #[tokio::test]
    async fn collections_failure_is_service_unavailable() {
        let app = app_with(Arc::new(StubModel::new()), Arc::new(FailingIndex::unreachable()));
        let resp = get(app, "/api/collections").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn configured_origins_are_echoed() {
        let engine = engine_with(Arc::new(StubModel::new()), Arc::new(StaticIndex::empty()));
        let index: Arc<dyn VectorIndex> = Arc::new(StaticIndex::empty());
        let app = build_router(
            AppState::new(engine, index, Catalog::builtin().unwrap()),
            &["http://localhost:3000".to_string()],
        );
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }
}
