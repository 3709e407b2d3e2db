//! Axum JSON API for FCAP: accounts, per-user sessions, API search, uploads,
//! charts and CSV export.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection, QueryRejection},
        DefaultBodyLimit, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fcap_adapters::{
    open_upload_bytes, ApiPage, OpportunitySource, SearchFilters, SourceError, SAM_GOV_SOURCE_ID,
};
use fcap_core::CanonicalOpportunity;
use fcap_pipeline::{
    choices_from_pairs, filter_active, inspect_upload, locations, project_source, run_search,
    sort_records, summarize, timeline, to_csv_bytes, top_agencies, count_by_type, ColumnMapping,
    FallbackRules, PipelineConfig, ProjectionContext, SortKey, DEFAULT_CHUNK_SIZE,
    DEFAULT_SESSION_TTL_SECS, EXPORT_FILE_NAME,
};
use fcap_storage::{
    register, reset_password, verify_login, AuthError, CredentialError, CredentialStore,
    FileCredentialStore,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcap-web";

pub const SESSION_HEADER: &str = "x-session-id";
const PREVIEW_ROWS: usize = 5;
const CHART_TOP_AGENCIES: usize = 10;

/// Per-login state. Records are replaced by each search or upload.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub saved_filters: Option<SearchFilters>,
    pub records: Vec<CanonicalOpportunity>,
}

impl Session {
    fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_used)
            .to_std()
            .is_ok_and(|idle| idle > ttl)
    }
}

/// Live sessions. Sessions idle for longer than the TTL are dropped on the
/// next create or lookup.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Session>>,
    ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SESSION_TTL_SECS))
    }
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn create(&self, username: &str) -> Uuid {
        self.create_at(username, Utc::now()).await
    }

    pub async fn create_at(&self, username: &str, now: DateTime<Utc>) -> Uuid {
        let session = Session {
            id: Uuid::new_v4(),
            username: username.to_string(),
            created_at: now,
            last_used: now,
            saved_filters: None,
            records: Vec::new(),
        };
        let id = session.id;
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions, now);
        sessions.insert(id, session);
        id
    }

    pub async fn with_session<R>(&self, id: Uuid, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.with_session_at(id, Utc::now(), f).await
    }

    /// Run `f` against a live session and mark it used at `now`.
    pub async fn with_session_at<R>(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions, now);
        sessions.get_mut(&id).map(|session| {
            session.last_used = now;
            f(session)
        })
    }

    pub async fn remove(&self, id: Uuid) -> Option<Session> {
        self.sessions.lock().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn prune(&self, sessions: &mut HashMap<Uuid, Session>, now: DateTime<Utc>) {
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_idle(now, self.ttl));
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, live = sessions.len(), "idle sessions dropped");
        }
    }
}

pub struct AppState {
    pub credentials: Arc<dyn CredentialStore>,
    pub source: Arc<dyn OpportunitySource>,
    pub sessions: SessionRegistry,
    pub rules: FallbackRules,
    pub chunk_size: usize,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(credentials: Arc<dyn CredentialStore>, source: Arc<dyn OpportunitySource>) -> Self {
        Self {
            credentials,
            source,
            sessions: SessionRegistry::default(),
            rules: FallbackRules::builtin(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_bytes: 250 * 1024 * 1024,
        }
    }

    pub fn with_rules(mut self, rules: FallbackRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.sessions = SessionRegistry::new(ttl);
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or expired session")]
    Unauthenticated,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{detail}")]
    Rejected { status: StatusCode, detail: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Self::Auth(AuthError::InvalidCredentials) => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            Self::Auth(AuthError::IdentityMismatch) => (StatusCode::UNAUTHORIZED, "identity_mismatch"),
            Self::Auth(AuthError::Store(CredentialError::AlreadyExists(_))) => (StatusCode::CONFLICT, "conflict"),
            Self::Auth(AuthError::Store(CredentialError::NotFound(_))) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Auth(AuthError::Store(CredentialError::Invalid(_))) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Auth(AuthError::Store(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            Self::Source(SourceError::SourceUnavailable { .. }) => (StatusCode::BAD_GATEWAY, "source_unavailable"),
            Self::Source(SourceError::UnsupportedFormat { .. }) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
            }
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Rejected { status, .. } if *status == StatusCode::PAYLOAD_TOO_LARGE => {
                (*status, "payload_too_large")
            }
            Self::Rejected { status, .. } => (*status, "invalid_request"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

macro_rules! rejection_into_api_error {
    ($($rejection:ty),*) => {$(
        impl From<$rejection> for ApiError {
            fn from(rejection: $rejection) -> Self {
                Self::Rejected {
                    status: rejection.status(),
                    detail: rejection.body_text(),
                }
            }
        }
    )*};
}

rejection_into_api_error!(JsonRejection, QueryRejection, BytesRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": code, "detail": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/reset", post(reset_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/filters", put(save_filters_handler))
        .route("/opportunities/search", get(search_handler))
        .route("/opportunities", get(list_handler))
        .route("/uploads/inspect", post(inspect_upload_handler))
        .route("/uploads/project", post(project_upload_handler))
        .route("/charts", get(charts_handler))
        .route("/export.csv", get(export_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

/// Stands in for the API source when no key is configured, so the rest of the
/// service stays usable.
struct UnconfiguredSource;

#[async_trait]
impl OpportunitySource for UnconfiguredSource {
    fn source_id(&self) -> &'static str {
        SAM_GOV_SOURCE_ID
    }

    async fn fetch(&self, _filters: &SearchFilters) -> Result<ApiPage, SourceError> {
        Err(SourceError::SourceUnavailable {
            source_id: SAM_GOV_SOURCE_ID.to_string(),
            target: "api.sam.gov".to_string(),
            detail: "SAM_API_KEY is not set".to_string(),
        })
    }
}

pub async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let credentials = FileCredentialStore::open(config.credentials_path.clone()).await?;
    let source: Arc<dyn OpportunitySource> = match config.sam_gov_source() {
        Ok(source) => Arc::new(source),
        Err(err) => {
            warn!(error = %err, "API search disabled");
            Arc::new(UnconfiguredSource)
        }
    };
    let state = AppState::new(Arc::new(credentials), source)
        .with_rules(config.load_fallback_rules()?)
        .with_chunk_size(config.chunk_size)
        .with_max_upload_bytes(config.max_upload_bytes())
        .with_session_ttl(config.session_ttl());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "fcap web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(PipelineConfig::from_env()).await
}

fn session_id(headers: &HeaderMap) -> ApiResult<Uuid> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(ApiError::Unauthenticated)
}

async fn with_session<R>(
    state: &AppState,
    headers: &HeaderMap,
    f: impl FnOnce(&mut Session) -> R,
) -> ApiResult<R> {
    let id = session_id(headers)?;
    state
        .sessions
        .with_session(id, f)
        .await
        .ok_or(ApiError::Unauthenticated)
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    username: String,
    email: String,
    new_password: String,
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    req: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = req?;
    register(state.credentials.as_ref(), &req.username, &req.password, &req.email).await?;
    info!(username = %req.username.trim(), "account registered");
    Ok((StatusCode::CREATED, Json(json!({ "username": req.username.trim() }))).into_response())
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    req: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = req?;
    let username = req.username.trim();
    verify_login(state.credentials.as_ref(), username, &req.password).await?;
    let session_id = state.sessions.create(username).await;
    info!(username = %username, %session_id, "session opened");
    Ok(Json(json!({ "session_id": session_id, "username": username })).into_response())
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    req: Result<Json<ResetRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = req?;
    reset_password(
        state.credentials.as_ref(),
        &req.username,
        &req.email,
        &req.new_password,
    )
    .await?;
    info!(username = %req.username.trim(), "password reset");
    Ok(Json(json!({ "status": "password_updated" })).into_response())
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let id = session_id(&headers)?;
    let session = state.sessions.remove(id).await.ok_or(ApiError::Unauthenticated)?;
    info!(username = %session.username, session_id = %id, "session closed");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn save_filters_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    filters: Result<Json<SearchFilters>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(filters) = filters?;
    let saved = filters.clone();
    with_session(&state, &headers, move |s| s.saved_filters = Some(saved)).await?;
    Ok(Json(filters).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    naics: Option<String>,
    agency: Option<String>,
    days: Option<u32>,
    #[serde(rename = "type")]
    opportunity_type: Option<String>,
    set_aside: Option<String>,
}

impl SearchQuery {
    /// Query values override the saved filters field by field.
    fn resolve(self, saved: Option<SearchFilters>) -> SearchFilters {
        let mut filters = saved.unwrap_or_default();
        if self.naics.is_some() {
            filters.naics = self.naics;
        }
        if self.agency.is_some() {
            filters.agency = self.agency;
        }
        if let Some(days) = self.days {
            filters.date_range_days = days;
        }
        if self.opportunity_type.is_some() {
            filters.opportunity_type = self.opportunity_type;
        }
        if self.set_aside.is_some() {
            filters.set_aside = self.set_aside;
        }
        filters
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let saved = with_session(&state, &headers, |s| s.saved_filters.clone()).await?;
    let Query(query) = query?;
    let filters = query.resolve(saved);
    let ctx = ProjectionContext::new();
    let outcome = run_search(state.source.as_ref(), &filters, &ctx).await?;

    let records = outcome.projection.records;
    let summary = summarize(&records, CHART_TOP_AGENCIES);
    let body = json!({
        "total_records": outcome.total_records,
        "filters": filters,
        "summary": summary,
        "issues": outcome.projection.issues,
        "records": records,
    });
    with_session(&state, &headers, move |s| s.records = records).await?;
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
struct InspectQuery {
    file_name: String,
}

fn declared_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Decoding and projection are CPU bound; keep them off the async workers.
async fn run_blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(work)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(result?)
}

async fn inspect_upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<InspectQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Response> {
    with_session(&state, &headers, |_| ()).await?;
    let Query(query) = query?;
    let body = body?;
    let declared = declared_type(&headers).map(str::to_owned);
    let today = Utc::now().date_naive();
    let worker_state = Arc::clone(&state);
    let inspection = run_blocking(move || {
        let mut source = open_upload_bytes(body, declared.as_deref(), &query.file_name)?;
        inspect_upload(source.as_mut(), PREVIEW_ROWS, &worker_state.rules, today)
    })
    .await?;
    Ok(Json(inspection).into_response())
}

async fn project_upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Response> {
    with_session(&state, &headers, |_| ()).await?;
    let Query(params) = params?;
    let body = body?;
    let file_name = params
        .iter()
        .find(|(k, _)| k == "file_name")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| ApiError::BadRequest("file_name query parameter is required".into()))?;
    let choices = choices_from_pairs(
        params
            .iter()
            .filter(|(k, _)| k != "file_name")
            .map(|(k, v)| (k.as_str(), v.as_str())),
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let declared = declared_type(&headers).map(str::to_owned);
    let ctx = ProjectionContext::new();
    let worker_state = Arc::clone(&state);
    let worker_file = file_name.clone();
    let (mapping, projection) = run_blocking(move || {
        let mut source = open_upload_bytes(body, declared.as_deref(), &worker_file)?;
        let mapping = ColumnMapping::build(source.columns(), &choices, &worker_state.rules, ctx.today());
        let projection = project_source(source.as_mut(), &mapping, worker_state.chunk_size, &ctx)?;
        Ok((mapping, projection))
    })
    .await?;
    info!(file = %file_name, rows = projection.rows, chunks = projection.chunks, "upload projected");

    let records = projection.records;
    let body = json!({
        "file_name": file_name,
        "mapping": mapping,
        "rows": projection.rows,
        "chunks": projection.chunks,
        "summary": summarize(&records, CHART_TOP_AGENCIES),
        "issues": projection.issues,
        "records": records,
    });
    with_session(&state, &headers, move |s| s.records = records).await?;
    Ok(Json(body).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    active_only: bool,
    sort: Option<String>,
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let sort = query
        .sort
        .as_deref()
        .map(str::parse::<SortKey>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let mut records = with_session(&state, &headers, |s| {
        if query.active_only {
            filter_active(&s.records)
        } else {
            s.records.clone()
        }
    })
    .await?;
    if let Some(key) = sort {
        sort_records(&mut records, key);
    }
    Ok(Json(json!({ "total": records.len(), "records": records })).into_response())
}

async fn charts_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let body = with_session(&state, &headers, |s| {
        json!({
            "by_type": count_by_type(&s.records),
            "top_agencies": top_agencies(&s.records, CHART_TOP_AGENCIES),
            "timeline": timeline(&s.records),
            "locations": locations(&s.records),
        })
    })
    .await?;
    Ok(Json(body).into_response())
}

async fn export_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let records = with_session(&state, &headers, |s| s.records.clone()).await?;
    let bytes = to_csv_bytes(&records)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{EXPORT_FILE_NAME}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fcap_core::RawRow;
    use fcap_storage::MemoryCredentialStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubSource {
        fail: bool,
        seen: Mutex<Vec<SearchFilters>>,
    }

    #[async_trait]
    impl OpportunitySource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        async fn fetch(&self, filters: &SearchFilters) -> Result<ApiPage, SourceError> {
            self.seen.lock().await.push(filters.clone());
            if self.fail {
                return Err(SourceError::SourceUnavailable {
                    source_id: "stub".into(),
                    target: "https://api.example.test/opportunities/v2/search".into(),
                    detail: "HTTP 503".into(),
                });
            }
            Ok(ApiPage {
                rows: vec![
                    RawRow::new(0)
                        .with("title", "Widget Repair")
                        .with("type", "Solicitation")
                        .with("responseDeadLine", "2099-01-01")
                        .with("postedDate", "2026-03-01")
                        .with("fullParentPathName", "DHS")
                        .with("placeOfPerformance", "VA, USA"),
                    RawRow::new(1)
                        .with("title", "Old Notice")
                        .with("responseDeadLine", "2020-01-01"),
                ],
                total_records: 2,
            })
        }
    }

    fn test_app(source: Arc<StubSource>) -> Router {
        app(AppState::new(Arc::new(MemoryCredentialStore::new()), source))
    }

    fn json_request(method: &str, uri: &str, session: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = session {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(id) = session {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router) -> String {
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/register",
                None,
                json!({"username": "analyst", "password": "s3cret!", "email": "analyst@example.gov"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                None,
                json!({"username": "analyst", "password": "s3cret!"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app(Arc::default());
        let resp = app.oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn session_routes_require_login() {
        let app = test_app(Arc::default());
        for uri in ["/opportunities", "/charts", "/export.csv", "/opportunities/search"] {
            let resp = app.clone().oneshot(get_request(uri, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        let resp = app
            .oneshot(get_request("/opportunities", Some(&Uuid::new_v4().to_string())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "unauthenticated");
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn account_conflicts_and_password_reset() {
        let app = test_app(Arc::default());
        let _session = login(&app).await;

        let dup = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/register",
                None,
                json!({"username": "analyst", "password": "x", "email": "x@example.gov"}),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let bad = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                None,
                json!({"username": "analyst", "password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

        let wrong_email = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/reset",
                None,
                json!({"username": "analyst", "email": "other@example.gov", "new_password": "n3w"}),
            ))
            .await
            .unwrap();
        assert_eq!(wrong_email.status(), StatusCode::UNAUTHORIZED);

        let reset = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/reset",
                None,
                json!({"username": "analyst", "email": "ANALYST@example.gov", "new_password": "n3w"}),
            ))
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);

        let relogin = app
            .oneshot(json_request(
                "POST",
                "/auth/login",
                None,
                json!({"username": "analyst", "password": "n3w"}),
            ))
            .await
            .unwrap();
        assert_eq!(relogin.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_stores_records_for_listing_charts_and_export() {
        let source = Arc::new(StubSource::default());
        let app = test_app(source.clone());
        let session = login(&app).await;

        let resp = app
            .clone()
            .oneshot(get_request("/opportunities/search?naics=541512", Some(&session)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total_records"], 2);
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["active"], 1);
        assert_eq!(body["records"][1]["type"], "unknown");
        assert_eq!(body["records"][1]["uiLink"], "#");
        assert_eq!(body["records"][1]["daysRemaining"], 0);

        let active = app
            .clone()
            .oneshot(get_request("/opportunities?active_only=true&sort=deadline", Some(&session)))
            .await
            .unwrap();
        let active = body_json(active).await;
        assert_eq!(active["total"], 1);
        assert_eq!(active["records"][0]["title"], "Widget Repair");

        let charts = body_json(
            app.clone()
                .oneshot(get_request("/charts", Some(&session)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(charts["top_agencies"][0]["name"], "DHS");
        assert_eq!(charts["locations"][0], "VA, USA");
        assert_eq!(charts["timeline"].as_array().unwrap().len(), 1);

        let export = app
            .oneshot(get_request("/export.csv", Some(&session)))
            .await
            .unwrap();
        assert_eq!(export.status(), StatusCode::OK);
        assert!(export.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("processed_opportunities.csv"));
        let bytes = export.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.lines().next().unwrap(), fcap_pipeline::export_header().join(","));
        assert_eq!(text.lines().count(), 3);
        assert_eq!(source.seen.lock().await[0].naics.as_deref(), Some("541512"));
    }

    #[tokio::test]
    async fn saved_filters_apply_to_later_searches() {
        let source = Arc::new(StubSource::default());
        let app = test_app(source.clone());
        let session = login(&app).await;

        let saved = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/filters",
                Some(&session),
                json!({"agency": "Homeland Security", "date_range_days": 60}),
            ))
            .await
            .unwrap();
        assert_eq!(saved.status(), StatusCode::OK);

        let resp = app
            .oneshot(get_request("/opportunities/search?type=Solicitation", Some(&session)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let seen = source.seen.lock().await;
        assert_eq!(seen[0].agency.as_deref(), Some("Homeland Security"));
        assert_eq!(seen[0].date_range_days, 60);
        assert_eq!(seen[0].opportunity_type.as_deref(), Some("Solicitation"));
    }

    #[tokio::test]
    async fn source_failure_is_bad_gateway() {
        let source = Arc::new(StubSource {
            fail: true,
            ..StubSource::default()
        });
        let app = test_app(source);
        let session = login(&app).await;
        let resp = app
            .oneshot(get_request("/opportunities/search", Some(&session)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"], "source_unavailable");
    }

    fn upload_request(uri: &str, session: &str, content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(SESSION_HEADER, session)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    const FORECAST_CSV: &str = "APFS Number,Name,NAICS,Component,Due\n\
        F-1,Cloud Services,541512,DHS / CISA,2099-05-01\n\
        F-2,Help Desk,541513,DHS / FEMA,bad date\n";

    #[tokio::test]
    async fn upload_inspect_and_project() {
        let app = test_app(Arc::default());
        let session = login(&app).await;

        let inspect = app
            .clone()
            .oneshot(upload_request(
                "/uploads/inspect?file_name=forecast.csv",
                &session,
                "text/csv",
                FORECAST_CSV,
            ))
            .await
            .unwrap();
        assert_eq!(inspect.status(), StatusCode::OK);
        let inspect = body_json(inspect).await;
        assert_eq!(inspect["columns"].as_array().unwrap().len(), 5);
        assert_eq!(inspect["preview"].as_array().unwrap().len(), 2);
        assert_eq!(inspect["suggestions"]["naicsCode"], "NAICS");
        assert_eq!(inspect["fallbacks"]["bindings"]["title"]["kind"], "fallback");

        let project = app
            .clone()
            .oneshot(upload_request(
                "/uploads/project?file_name=forecast.csv&title=Name&responseDeadLine=Due",
                &session,
                "text/csv",
                FORECAST_CSV,
            ))
            .await
            .unwrap();
        assert_eq!(project.status(), StatusCode::OK);
        let project = body_json(project).await;
        assert_eq!(project["rows"], 2);
        assert_eq!(project["records"][0]["title"], "Cloud Services");
        assert_eq!(project["records"][0]["naicsCode"], "541512");
        assert_eq!(project["records"][0]["uiLink"], "#");
        assert_eq!(project["records"][1]["daysRemaining"], "unavailable");
        assert_eq!(project["issues"].as_array().unwrap().len(), 1);
        assert_eq!(project["summary"]["unique_agencies"], 2);

        let listed = body_json(
            app.oneshot(get_request("/opportunities", Some(&session)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed["total"], 2);
    }

    #[tokio::test]
    async fn upload_errors_map_to_status_codes() {
        let app = test_app(Arc::default());
        let session = login(&app).await;

        let pdf = app
            .clone()
            .oneshot(upload_request(
                "/uploads/inspect?file_name=scan.pdf",
                &session,
                "application/pdf",
                "%PDF-1.7",
            ))
            .await
            .unwrap();
        assert_eq!(pdf.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let bad_field = app
            .oneshot(upload_request(
                "/uploads/project?file_name=f.csv&budget=Amount",
                &session,
                "text/csv",
                FORECAST_CSV,
            ))
            .await
            .unwrap();
        assert_eq!(bad_field.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_ends_session() {
        let app = test_app(Arc::default());
        let session = login(&app).await;
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/auth/logout", Some(&session), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let after = app
            .oneshot(get_request("/opportunities", Some(&session)))
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let registry = SessionRegistry::default();
        let a = registry.create("a").await;
        let b = registry.create("b").await;
        registry
            .with_session(a, |s| s.records.push(CanonicalOpportunity::default()))
            .await
            .unwrap();
        assert_eq!(registry.with_session(b, |s| s.records.len()).await, Some(0));
        assert_eq!(registry.len().await, 2);
        assert!(registry.remove(a).await.is_some());
        assert!(registry.with_session(a, |_| ()).await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_are_dropped_after_ttl() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let start = Utc::now();
        let minute = chrono::Duration::seconds(60);
        let kept = registry.create_at("kept", start).await;
        let idle = registry.create_at("idle", start).await;
        registry
            .with_session_at(idle, start, |s| s.records = vec![CanonicalOpportunity::default(); 100])
            .await
            .unwrap();

        // Touching a session inside the window keeps it alive.
        let touch = start + chrono::Duration::seconds(50);
        assert!(registry.with_session_at(kept, touch, |_| ()).await.is_some());

        let later = start + minute + chrono::Duration::seconds(10);
        assert!(registry.with_session_at(kept, later, |_| ()).await.is_some());
        assert!(registry.with_session_at(idle, later, |_| ()).await.is_none());
        assert_eq!(registry.len().await, 1);

        for i in 0..1000 {
            let at = later + minute * (2 * i + 2);
            registry.create_at("burst", at).await;
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn extractor_rejections_use_the_error_envelope() {
        let app = test_app(Arc::default());
        let session = login(&app).await;

        let malformed = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        let body = body_json(malformed).await;
        assert_eq!(body["error"], "invalid_request");
        assert!(body["detail"].is_string());

        let missing_field = app
            .clone()
            .oneshot(json_request("POST", "/auth/register", None, json!({"username": "x"})))
            .await
            .unwrap();
        assert_eq!(missing_field.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(missing_field).await["error"], "invalid_request");

        let no_file_name = app
            .clone()
            .oneshot(upload_request("/uploads/inspect", &session, "text/csv", FORECAST_CSV))
            .await
            .unwrap();
        assert_eq!(no_file_name.status(), StatusCode::BAD_REQUEST);
        let body = body_json(no_file_name).await;
        assert_eq!(body["error"], "invalid_request");
        assert!(body["detail"].as_str().unwrap().contains("file_name"));

        let bad_flag = app
            .oneshot(get_request("/opportunities?active_only=maybe", Some(&session)))
            .await
            .unwrap();
        assert_eq!(bad_flag.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(bad_flag).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn oversized_upload_is_payload_too_large() {
        let app = app(
            AppState::new(Arc::new(MemoryCredentialStore::new()), Arc::new(StubSource::default()))
                .with_max_upload_bytes(200),
        );
        let session = login(&app).await;
        let big = "Title\n".to_string() + &"x,".repeat(200);
        let resp = app
            .oneshot(upload_request("/uploads/inspect?file_name=big.csv", &session, "text/csv", &big))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(resp).await["error"], "payload_too_large");
    }
}
