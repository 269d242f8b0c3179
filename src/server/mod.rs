//! HTTP server implementation using Axum.
//!
//! Thin layer over the core: authenticates the caller, applies the
//! per-user rate limit, and maps [`ServiceError`] kinds to status codes.
//! Execution timeouts are not errors here; they come back as a normal
//! response with `exit_code=124, timed_out=true`.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::driver::ContainerDriver;
use crate::error::ServiceError;
use crate::executor::Executor;
use crate::kv::KvDirectory;
use crate::registry::SessionRegistry;
use crate::workspace::{sanitize_upload_filename, WorkspaceEntry, WorkspaceGateway};

/// Header carrying static API keys.
const API_KEY_HEADER: &str = "x-api-key";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    executor: Arc<Executor>,
    registry: Arc<SessionRegistry>,
    workspace: Arc<WorkspaceGateway>,
    kv: Arc<dyn KvDirectory>,
    driver: Arc<dyn ContainerDriver>,
    auth: Arc<Authenticator>,
    rate_limit_requests: u64,
    rate_limit_window: Duration,
}

impl AppState {
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<SessionRegistry>,
        workspace: Arc<WorkspaceGateway>,
        kv: Arc<dyn KvDirectory>,
        driver: Arc<dyn ContainerDriver>,
        config: &Config,
    ) -> Self {
        Self {
            executor,
            registry,
            workspace,
            kv,
            driver,
            auth: Arc::new(Authenticator::new(
                config.auth.api_key_set(),
                &config.auth.jwt_secret,
            )),
            rate_limit_requests: config.rate_limit.requests,
            rate_limit_window: Duration::from_secs(config.rate_limit.window_seconds),
        }
    }

    /// Authenticates the request and charges the caller's rate budget.
    async fn admit(&self, headers: &HeaderMap) -> Result<String, ServiceError> {
        let user_id = self.auth.authenticate(headers)?;
        let count = self
            .kv
            .incr_rate_counter(&user_id, self.rate_limit_window)
            .await
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        if count > self.rate_limit_requests {
            return Err(ServiceError::RateLimited);
        }
        Ok(user_id)
    }
}

/// Resolves the caller identity from an API key or a bearer JWT.
pub struct Authenticator {
    api_keys: HashSet<String>,
    decoding_key: DecodingKey,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    user_id: Option<String>,
    uid: Option<String>,
}

impl Authenticator {
    pub fn new(api_keys: HashSet<String>, jwt_secret: &str) -> Self {
        Self {
            api_keys,
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    /// API key first, bearer token second; 401 when neither verifies.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, ServiceError> {
        if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            if !self.api_keys.is_empty() && self.api_keys.contains(key) {
                let prefix: String = key.chars().take(8).collect();
                return Ok(format!("api:{prefix}"));
            }
        }

        if let Some(token) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            let validation = Validation::new(Algorithm::HS256);
            if let Ok(data) = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            {
                let claims = data.claims;
                if let Some(user) = claims.sub.or(claims.user_id).or(claims.uid) {
                    if !user.is_empty() {
                        return Ok(user);
                    }
                }
            }
        }

        Err(ServiceError::AuthRequired)
    }
}

/// Error wrapper turning [`ServiceError`] into an HTTP response.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(serde_json::json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}

// Request/Response types

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    session_id: String,
    timeout: Option<u64>,
    working_dir: Option<String>,
}

#[derive(Serialize)]
struct ExecuteResponse {
    stdout: String,
    stderr: String,
    exit_code: i64,
    duration_ms: u64,
    timed_out: bool,
    truncated: bool,
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    session_id: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    container_id: String,
}

#[derive(Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
struct ListResponse {
    entries: Vec<WorkspaceEntry>,
}

#[derive(Deserialize)]
struct WriteBody {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct UploadResponse {
    path: String,
    session_id: String,
    size: usize,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute_command))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", delete(delete_session))
        .route(
            "/sessions/:session_id/workspace",
            get(list_workspace).delete(delete_workspace_path),
        )
        .route(
            "/sessions/:session_id/workspace/content",
            get(read_workspace_content).put(write_workspace_content),
        )
        .route(
            "/sessions/:session_id/workspace/upload",
            post(upload_workspace_file),
        )
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Binds the listener and serves requests until shutdown.
pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .driver
        .ping()
        .await
        .map_err(|e| ServiceError::engine_unavailable(e.to_string()))?;
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

async fn execute_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let user_id = state.admit(&headers).await?;
    let result = state
        .executor
        .execute(
            &user_id,
            &req.session_id,
            &req.command,
            req.timeout,
            req.working_dir.as_deref(),
        )
        .await?;

    Ok(Json(ExecuteResponse {
        stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
        timed_out: result.timed_out,
        truncated: result.truncated,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let user_id = state.admit(&headers).await?;
    let container_id = state.registry.open_session(&user_id, &req.session_id).await?;
    Ok(Json(CreateSessionResponse {
        session_id: req.session_id,
        container_id: container_id.chars().take(12).collect(),
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user_id = state.admit(&headers).await?;
    state.registry.destroy(&user_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let user_id = state.admit(&headers).await?;
    let entries = state
        .workspace
        .list(&user_id, &session_id, &query.path)
        .await?;
    Ok(Json(ListResponse { entries }))
}

async fn read_workspace_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let user_id = state.admit(&headers).await?;
    let content = state
        .workspace
        .read(&user_id, &session_id, &query.path)
        .await?;
    Ok(Json(content).into_response())
}

async fn write_workspace_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let user_id = state.admit(&headers).await?;

    // Raw bytes by default; JSON bodies carry the content field.
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let data: Vec<u8> = if content_type.contains("application/json") {
        let parsed: WriteBody = serde_json::from_slice(&body)
            .map_err(|e| ServiceError::path_invalid(format!("invalid JSON body: {e}")))?;
        parsed.content.into_bytes()
    } else {
        body.to_vec()
    };

    state
        .workspace
        .write(&user_id, &session_id, &query.path, &data)
        .await?;
    Ok(StatusCode::OK)
}

async fn upload_workspace_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let user_id = state.admit(&headers).await?;

    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::path_invalid(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ServiceError::path_invalid(format!("invalid multipart body: {e}")))?;
            upload = Some((filename, data));
            break;
        }
    }

    let (filename, data) =
        upload.ok_or_else(|| ServiceError::path_invalid("multipart field 'file' is required"))?;
    let target = if query.path.trim().is_empty() {
        sanitize_upload_filename(&filename)
    } else {
        query.path.clone()
    };

    state
        .workspace
        .write(&user_id, &session_id, &target, &data)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            path: target,
            session_id,
            size: data.len(),
        }),
    ))
}

async fn delete_workspace_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<StatusCode, ApiError> {
    let user_id = state.admit(&headers).await?;
    state
        .workspace
        .delete(&user_id, &session_id, &query.path)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::kv::MemoryKv;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn authenticator() -> Authenticator {
        Authenticator::new(
            HashSet::from(["secret-key-123".to_string()]),
            "test-jwt-secret",
        )
    }

    fn bearer_token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_authenticate_with_api_key() {
        let auth = authenticator();
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "secret-key-123".parse().unwrap());

        let user = auth.authenticate(&headers).unwrap();
        assert_eq!(user, "api:secret-k");
    }

    #[test]
    fn test_authenticate_rejects_unknown_api_key() {
        let auth = authenticator();
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "wrong".parse().unwrap());

        let err = auth.authenticate(&headers).unwrap_err();
        assert!(matches!(err, ServiceError::AuthRequired));
    }

    #[test]
    fn test_authenticate_with_jwt_sub() {
        let auth = authenticator();
        let token = bearer_token(
            "test-jwt-secret",
            serde_json::json!({ "sub": "alice", "exp": future_exp() }),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        assert_eq!(auth.authenticate(&headers).unwrap(), "alice");
    }

    #[test]
    fn test_authenticate_with_jwt_user_id_fallback() {
        let auth = authenticator();
        let token = bearer_token(
            "test-jwt-secret",
            serde_json::json!({ "user_id": "bob", "exp": future_exp() }),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        assert_eq!(auth.authenticate(&headers).unwrap(), "bob");
    }

    #[test]
    fn test_authenticate_rejects_wrong_jwt_secret() {
        let auth = authenticator();
        let token = bearer_token(
            "some-other-secret",
            serde_json::json!({ "sub": "alice", "exp": future_exp() }),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        let err = auth.authenticate(&headers).unwrap_err();
        assert!(matches!(err, ServiceError::AuthRequired));
    }

    #[test]
    fn test_authenticate_rejects_expired_jwt() {
        let auth = authenticator();
        let token = bearer_token(
            "test-jwt-secret",
            serde_json::json!({ "sub": "alice", "exp": chrono::Utc::now().timestamp() - 3600 }),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        let err = auth.authenticate(&headers).unwrap_err();
        assert!(matches!(err, ServiceError::AuthRequired));
    }

    #[test]
    fn test_authenticate_without_credentials() {
        let auth = authenticator();
        let err = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::AuthRequired));
    }

    fn test_state(rate_limit: u64) -> AppState {
        let driver = Arc::new(MockDriver::new());
        let kv = Arc::new(MemoryKv::new());
        let mut config = Config::default();
        config.auth.api_keys = "secret-key-123".to_string();
        config.rate_limit.requests = rate_limit;
        let registry = Arc::new(
            SessionRegistry::new(
                Arc::clone(&driver) as Arc<dyn ContainerDriver>,
                Arc::clone(&kv) as Arc<dyn KvDirectory>,
                config.clone(),
            )
            .unwrap(),
        );
        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&driver) as _,
            &config,
        ));
        let workspace = Arc::new(WorkspaceGateway::new(
            Arc::clone(&registry),
            Arc::clone(&driver) as _,
            &config,
        ));
        AppState::new(executor, registry, workspace, kv, driver, &config)
    }

    #[tokio::test]
    async fn test_admit_enforces_rate_limit() {
        let state = test_state(2);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "secret-key-123".parse().unwrap());

        assert!(state.admit(&headers).await.is_ok());
        assert!(state.admit(&headers).await.is_ok());
        let err = state.admit(&headers).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited));
    }

    #[tokio::test]
    async fn test_admit_rejects_unauthenticated() {
        let state = test_state(10);
        let err = state.admit(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthRequired));
    }

    #[test]
    fn test_api_error_status_and_body() {
        let response =
            ApiError(ServiceError::command_not_allowed("nmap")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(ServiceError::RateLimited).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = ApiError(ServiceError::session_not_found("s1")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_workspace_entry_serialization() {
        let entry = WorkspaceEntry {
            name: "b.txt".to_string(),
            kind: crate::workspace::EntryKind::File,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "b.txt", "type": "file" }));
    }

    #[test]
    fn test_execute_request_deserialization() {
        let req: ExecuteRequest = serde_json::from_str(
            r#"{"command": "echo hello", "session_id": "s1", "timeout": 5}"#,
        )
        .unwrap();
        assert_eq!(req.command, "echo hello");
        assert_eq!(req.timeout, Some(5));
        assert!(req.working_dir.is_none());
    }
}
