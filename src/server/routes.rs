//! API routes

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::inference::{EngineError, EngineState};
use crate::server::{sse, ServerState};
use crate::storage::StorageError;

/// Create the `/api` router
pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/prompt", post(prompt))
        .route("/stream", post(stream))
        .route("/models", get(list_models))
        .route("/current-model", get(current_model))
        .route("/select-model", post(select_model))
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct PromptResponse {
    pub prompt: String,
    pub reply: String,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Deserialize)]
pub struct SelectModelRequest {
    #[serde(default)]
    pub name: String,
}

/// Loaded model; `name` and `path` are empty when nothing is loaded
#[derive(Debug, Serialize)]
pub struct CurrentModel {
    pub name: String,
    pub path: String,
    pub root: String,
    pub state: EngineState,
}

/// Error returned by a handler, rendered as `{"error": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(StorageError::ModelNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(e) => match e {
                EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                EngineError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::ModelLoad(_) => StatusCode::UNPROCESSABLE_ENTITY,
                // Client closed request
                EngineError::Cancelled => {
                    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
                }
                EngineError::Inference(_) | EngineError::Worker(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Engine(e) if e.is_cancelled() => debug!("Request cancelled"),
            _ if status.is_server_error() => error!("Request failed: {}", self),
            _ => warn!("Request rejected: {}", self),
        }

        let body = match &self {
            ApiError::Storage(StorageError::ModelNotFound(name)) => serde_json::json!({
                "error": "Model file not found.",
                "name": name,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Buffered generation. A blank prompt gets an empty reply.
async fn prompt(
    State(state): State<ServerState>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<PromptResponse>, ApiError> {
    let prompt = request.prompt.trim().to_string();
    info!("Prompt request ({} chars)", prompt.len());

    let reply = state
        .engine
        .generate_full(&prompt, CancellationToken::new())
        .await?;

    Ok(Json(PromptResponse {
        prompt,
        reply,
        timestamp: Local::now(),
    }))
}

/// Streamed generation as server-sent events.
///
/// Dropping the response body (client disconnect) drops the fragment stream,
/// which cancels the generation and releases the engine.
async fn stream(
    State(state): State<ServerState>,
    Json(request): Json<PromptRequest>,
) -> Result<Response, ApiError> {
    info!("Stream request ({} chars)", request.prompt.len());

    let fragments = state
        .engine
        .generate_stream(&request.prompt, CancellationToken::new())
        .await?;

    // Sse sets the event-stream content type and no-cache
    let mut response = Sse::new(sse::events(fragments))
        .keep_alive(KeepAlive::new())
        .into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

async fn list_models(State(state): State<ServerState>) -> Result<impl IntoResponse, ApiError> {
    let models = state.catalog.list_models()?;
    Ok(Json(serde_json::json!({ "models": models })))
}

async fn current_model(State(state): State<ServerState>) -> Json<CurrentModel> {
    let path = state.engine.current_model_path();
    let name = path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Json(CurrentModel {
        name,
        path: path.map(|p| p.display().to_string()).unwrap_or_default(),
        root: state.catalog.models_root().display().to_string(),
        state: state.engine.state(),
    })
}

/// Swap to another model from the catalog.
///
/// Unknown names are rejected before the engine is involved, so the loaded
/// model stays untouched.
async fn select_model(
    State(state): State<ServerState>,
    Json(request): Json<SelectModelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Model name required.".to_string()));
    }

    let path = state.catalog.resolve(name)?;
    info!("Switching model to {}", name);
    state.engine.swap_model(&path).await?;

    Ok(Json(serde_json::json!({
        "selected": name,
        "path": path.display().to_string(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockLoader, Script};
    use crate::inference::{ChatEngine, EngineConfig};
    use crate::server::create_app;
    use crate::server::sse::SseDecoder;
    use axum::body::Body;
    use crate::storage::catalog::ModelCatalog;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::fs::File;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _dir: TempDir,
        state: ServerState,
        loader: MockLoader,
        alpha: PathBuf,
        beta: PathBuf,
    }

    async fn fixture(alpha_script: Script) -> Fixture {
        let dir = TempDir::new().unwrap();
        for name in ["alpha.gguf", "beta.gguf"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let catalog = ModelCatalog::new(dir.path()).unwrap();
        let alpha = catalog.models_root().join("alpha.gguf");
        let beta = catalog.models_root().join("beta.gguf");

        let loader = MockLoader::new()
            .with_model(&alpha, alpha_script)
            .with_model(&beta, Script::pieces(&["beta"]));

        let mut config = EngineConfig::new(&alpha);
        config.sampling.stop_strings = vec!["User:".to_string()];
        let engine = ChatEngine::new(config, Arc::new(loader.clone())).unwrap();
        engine.initialize().await.unwrap();

        Fixture {
            _dir: dir,
            state: ServerState::new(engine, catalog),
            loader,
            alpha,
            beta,
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(state: &ServerState, request: Request<Body>) -> Response {
        create_app(state.clone()).oneshot(request).await.unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_has_security_headers() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(&fx.state, get_request("/health")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert!(headers.contains_key(crate::server::middleware::REQUEST_ID_HEADER));

        let json = body_json(response).await;
        assert_eq!(json["status"], "OK");
    }

    #[tokio::test]
    async fn test_prompt_strips_stop_string() {
        let fx = fixture(Script::pieces(&["Hello! ", "How can I help?\n", "User:", " more"])).await;
        let response = send(&fx.state, post_json("/api/prompt", serde_json::json!({ "prompt": "hi" }))).await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["prompt"], "hi");
        assert_eq!(json["reply"], "Hello! How can I help?\n");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_prompt_is_trimmed() {
        let fx = fixture(Script::echo_repeated(1)).await;
        let response = send(
            &fx.state,
            post_json("/api/prompt", serde_json::json!({ "prompt": "  ping \n" })),
        )
        .await;

        let json = body_json(response).await;
        assert_eq!(json["prompt"], "ping");
        assert_eq!(json["reply"], "ping");
    }

    #[tokio::test]
    async fn test_blank_prompt_returns_empty_reply() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(&fx.state, post_json("/api/prompt", serde_json::json!({ "prompt": "  " }))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["reply"], "");
        assert_eq!(fx.loader.generation_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_prompt_is_rejected() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/prompt")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = send(&fx.state, request).await;
        assert!(response.status().is_client_error());
        assert_eq!(fx.loader.generation_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_without_model_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let catalog = ModelCatalog::new(dir.path()).unwrap();
        let engine = ChatEngine::new(
            EngineConfig::new(catalog.models_root().join("none.gguf")),
            Arc::new(MockLoader::new()),
        )
        .unwrap();
        let state = ServerState::new(engine, catalog);

        let response = send(&state, post_json("/api/prompt", serde_json::json!({ "prompt": "hi" }))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stream_frames_and_done() {
        let fx = fixture(Script::pieces(&["line1\nline2", " tail"])).await;
        let response = send(&fx.state, post_json("/api/stream", serde_json::json!({ "prompt": "hi" }))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[header::CONNECTION], "keep-alive");

        let text = body_text(response).await;
        assert!(text.starts_with("data: line1\ndata: line2\n\n"));
        assert!(text.ends_with("event: done\ndata: [DONE]\n\n"));
        assert_eq!(text.matches("[DONE]").count(), 1);

        let events = SseDecoder::new().feed(&text);
        let fragments: Vec<_> = events
            .iter()
            .filter(|e| !e.is_done())
            .map(|e| e.data.as_str())
            .collect();
        assert_eq!(fragments.concat(), "line1\nline2 tail");
        assert!(events.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_stream_failure_sends_error_without_done() {
        let fx = fixture(Script::pieces(&["a", "b", "c"]).failing_after(1)).await;
        let response = send(&fx.state, post_json("/api/stream", serde_json::json!({ "prompt": "hi" }))).await;

        let events = SseDecoder::new().feed(&body_text(response).await);
        assert_eq!(events.first().unwrap().data, "a");
        assert_eq!(events.last().unwrap().event.as_deref(), Some("error"));
        assert!(!events.iter().any(|e| e.is_done()));
    }

    #[tokio::test]
    async fn test_stream_blank_prompt_is_bad_request() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(&fx.state, post_json("/api/stream", serde_json::json!({ "prompt": "" }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dropped_stream_body_frees_engine() {
        let fx = fixture(Script::repeat("x", 1000).with_delay(Duration::from_millis(5))).await;
        let response = send(&fx.state, post_json("/api/stream", serde_json::json!({ "prompt": "hi" }))).await;
        drop(response);

        let next = tokio::time::timeout(
            Duration::from_secs(2),
            fx.state.engine.swap_model(&fx.beta),
        )
        .await;
        assert!(next.is_ok(), "engine still locked after client went away");
        assert_eq!(fx.state.engine.current_model_path(), Some(fx.beta.clone()));
    }

    #[tokio::test]
    async fn test_list_models() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let json = body_json(send(&fx.state, get_request("/api/models")).await).await;
        assert_eq!(json["models"], serde_json::json!(["alpha.gguf", "beta.gguf"]));
    }

    #[tokio::test]
    async fn test_current_model() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let json = body_json(send(&fx.state, get_request("/api/current-model")).await).await;

        assert_eq!(json["name"], "alpha.gguf");
        assert_eq!(json["path"], fx.alpha.display().to_string());
        assert_eq!(
            json["root"],
            fx.state.catalog.models_root().display().to_string()
        );
        assert_eq!(json["state"], "ready");
    }

    #[tokio::test]
    async fn test_current_model_when_unloaded() {
        let dir = TempDir::new().unwrap();
        let catalog = ModelCatalog::new(dir.path()).unwrap();
        let engine = ChatEngine::new(
            EngineConfig::new(catalog.models_root().join("none.gguf")),
            Arc::new(MockLoader::new()),
        )
        .unwrap();
        let state = ServerState::new(engine, catalog);

        let json = body_json(send(&state, get_request("/api/current-model")).await).await;
        assert_eq!(json["name"], "");
        assert_eq!(json["path"], "");
        assert_eq!(json["root"], state.catalog.models_root().display().to_string());
        assert_eq!(json["state"], "unloaded");
    }

    #[tokio::test]
    async fn test_select_model_swaps() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(
            &fx.state,
            post_json("/api/select-model", serde_json::json!({ "name": "beta.gguf" })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["selected"], "beta.gguf");
        assert_eq!(fx.state.engine.current_model_path(), Some(fx.beta.clone()));

        let json = body_json(send(&fx.state, post_json("/api/prompt", serde_json::json!({ "prompt": "hi" }))).await).await;
        assert_eq!(json["reply"], "beta");
    }

    #[tokio::test]
    async fn test_select_missing_model_is_not_found() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let loads_before = fx.loader.load_count();

        let response = send(
            &fx.state,
            post_json("/api/select-model", serde_json::json!({ "name": "ghost.gguf" })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Model file not found.");
        assert_eq!(json["name"], "ghost.gguf");
        assert_eq!(fx.state.engine.current_model_path(), Some(fx.alpha.clone()));
        assert_eq!(fx.loader.load_count(), loads_before);
    }

    #[tokio::test]
    async fn test_select_outside_catalog_is_not_found() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(
            &fx.state,
            post_json("/api/select-model", serde_json::json!({ "name": "../alpha.gguf" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(fx.state.engine.current_model_path(), Some(fx.alpha.clone()));
    }

    #[tokio::test]
    async fn test_select_blank_name_is_bad_request() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        let response = send(
            &fx.state,
            post_json("/api/select-model", serde_json::json!({ "name": " " })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_select_unloadable_model_keeps_current() {
        let fx = fixture(Script::pieces(&["hi"])).await;
        // Present on disk but unknown to the loader
        File::create(fx.state.catalog.models_root().join("broken.gguf")).unwrap();

        let response = send(
            &fx.state,
            post_json("/api/select-model", serde_json::json!({ "name": "broken.gguf" })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(fx.state.engine.current_model_path(), Some(fx.alpha.clone()));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ApiError::from(EngineError::NotInitialized), 503),
            (ApiError::from(EngineError::InvalidRequest("x".into())), 400),
            (ApiError::from(EngineError::ModelLoad("x".into())), 422),
            (ApiError::from(EngineError::Cancelled), 499),
            (ApiError::from(EngineError::Inference("x".into())), 500),
            (ApiError::from(EngineError::Worker("x".into())), 500),
            (ApiError::from(StorageError::ModelNotFound("x".into())), 404),
            (ApiError::BadRequest("x".into()), 400),
        ];
        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
        }
    }
}
