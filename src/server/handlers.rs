use crate::config::types::{ErrorKind, ExecutionRequest, ExecutionResult, ExitStatus};
use crate::server::AppState;
use crate::service::{Executor, Rejection, ServiceHealth};
use crate::verdict::SANDBOX_FAULT_MESSAGE;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";
pub const ANONYMOUS_CALLER: &str = "anonymous";
pub const MISSING_FIELDS_MESSAGE: &str = "Language and code are required.";
pub const BODY_TOO_LARGE_MESSAGE: &str = "The request body exceeds the size limit.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteBody {
    pub language: Option<String>,
    pub code: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error_type: Option<String>,
    pub execution_time: f64,
    pub truncated: bool,
    pub exit_status: Option<ExitStatus>,
    pub run_id: Option<String>,
}

impl ExecuteResponse {
    fn from_result(result: ExecutionResult) -> Self {
        Self {
            success: result.success,
            error_type: result
                .error_kind
                .and_then(|k| k.error_type())
                .map(str::to_string),
            execution_time: result.duration.as_secs_f64(),
            truncated: result.truncated,
            exit_status: result.exit_status,
            run_id: Some(result.run_id),
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            error_type: None,
            execution_time: 0.0,
            truncated: false,
            exit_status: None,
            run_id: None,
        }
    }
}

/// Sets the cancel flag if the request future is dropped before the
/// execution finishes, which is how a client disconnect shows up.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Client went away; cancelling execution");
            self.flag.store(true, Ordering::Release);
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn execute<E: Executor>(
    State(state): State<AppState<E>>,
    headers: HeaderMap,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            log::debug!("Rejecting oversized execute body: {}", e);
            return (StatusCode::BAD_REQUEST, Json(ExecuteResponse::failure(BODY_TOO_LARGE_MESSAGE)))
                .into_response();
        }
        Err(e) => {
            log::debug!("Rejecting malformed execute body: {}", e);
            return (StatusCode::BAD_REQUEST, Json(ExecuteResponse::failure(MISSING_FIELDS_MESSAGE)))
                .into_response();
        }
    };

    // An empty program is still a program; only a missing field is refused.
    let (language, code) = match (body.language, body.code) {
        (Some(language), Some(code)) if !language.trim().is_empty() => {
            (language.trim().to_string(), code)
        }
        _ => {
            return (StatusCode::BAD_REQUEST, Json(ExecuteResponse::failure(MISSING_FIELDS_MESSAGE)))
                .into_response()
        }
    };

    let caller = header_value(&headers, CALLER_ID_HEADER).unwrap_or_else(|| ANONYMOUS_CALLER.to_string());
    let role = header_value(&headers, CALLER_ROLE_HEADER);
    let request = ExecutionRequest::new(language, code, body.input.unwrap_or_default(), caller);

    let flag = Arc::new(AtomicBool::new(false));
    let guard = CancelOnDrop {
        flag: Arc::clone(&flag),
        armed: true,
    };
    let executor = Arc::clone(&state.executor);
    let joined = tokio::task::spawn_blocking(move || executor.execute(request, role, &flag)).await;
    guard.disarm();

    match joined {
        Ok(Ok(result)) if result.error_kind == Some(ErrorKind::SandboxFault) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecuteResponse::from_result(result)),
        )
            .into_response(),
        Ok(Ok(result)) => (StatusCode::OK, Json(ExecuteResponse::from_result(result))).into_response(),
        Ok(Err(rejection)) => rejection_response(&rejection),
        Err(e) => {
            log::error!("Execution task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ExecuteResponse::failure(SANDBOX_FAULT_MESSAGE)),
            )
                .into_response()
        }
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    match rejection {
        Rejection::Overloaded => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ExecuteResponse::failure("Too many concurrent executions; retry later.")),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            response
        }
        Rejection::UnsupportedLanguage(language) => (
            StatusCode::BAD_REQUEST,
            Json(ExecuteResponse::failure(format!("Unsupported language: {}", language))),
        )
            .into_response(),
        Rejection::InputTooLarge { what, limit } => (
            StatusCode::BAD_REQUEST,
            Json(ExecuteResponse::failure(format!("The {} exceeds the {} byte limit.", what, limit))),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub service: ServiceHealth,
}

pub async fn healthz<E: Executor>(State(state): State<AppState<E>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
        service: state.executor.health(),
    })
}

pub async fn metrics<E: Executor>(State(state): State<AppState<E>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.executor.metrics_text(),
    )
}
