//! HTTP contract, driven through the router without a socket.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use execbox::safety::IsolationMode;
use execbox::server::{router, ExecuteResponse};
use execbox::service::{Executor, Rejection, ServiceHealth};
use execbox::{ErrorKind, ExecutionRequest, ExecutionResult, ExitStatus};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

/// Answers by language id and records what it was asked
#[derive(Default)]
struct FakeExecutor {
    seen: Mutex<Vec<(ExecutionRequest, Option<String>)>>,
}

impl Executor for FakeExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
        role: Option<String>,
        _cancel: &AtomicBool,
    ) -> Result<ExecutionResult, Rejection> {
        self.seen.lock().unwrap().push((request.clone(), role));
        let result = |kind: Option<ErrorKind>, success: bool| ExecutionResult {
            run_id: "run-1".into(),
            success,
            stdout: String::from_utf8_lossy(&request.stdin).into_owned(),
            stderr: String::new(),
            exit_status: Some(ExitStatus::Code(0)),
            error_kind: kind,
            duration: Duration::from_millis(250),
            truncated: false,
        };
        match request.language.as_str() {
            "python" => Ok(result(None, true)),
            "loop" => Ok(result(Some(ErrorKind::Timeout), true)),
            "broken" => Ok(result(Some(ErrorKind::SandboxFault), false)),
            "busy" => Err(Rejection::Overloaded),
            "huge" => Err(Rejection::InputTooLarge {
                what: "source",
                limit: 10,
            }),
            other => Err(Rejection::UnsupportedLanguage(other.to_string())),
        }
    }

    fn health(&self) -> ServiceHealth {
        ServiceHealth {
            mode: IsolationMode::Degraded,
            in_flight: 0,
            queued: 0,
            live_sandboxes: 0,
            sandboxes_created: 4,
            sandboxes_destroyed: 4,
            tickets_issued: 4,
            tickets_released: 4,
        }
    }

    fn metrics_text(&self) -> String {
        "execbox_requests_total 4\n".to_string()
    }

    fn request_body_limit(&self) -> usize {
        512
    }
}

async fn post(
    executor: Arc<FakeExecutor>,
    path: &str,
    body: &str,
    caller: Option<&str>,
) -> (StatusCode, axum::http::HeaderMap, ExecuteResponse) {
    let mut builder = Request::post(path).header(header::CONTENT_TYPE, "application/json");
    if let Some(caller) = caller {
        builder = builder.header("X-Caller-Id", caller).header("X-Caller-Role", "student");
    }
    let response = router(executor)
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn successful_execution() {
    let executor = Arc::new(FakeExecutor::default());
    let (status, _, body) = post(
        executor.clone(),
        "/execute",
        r#"{"language":"python","code":"print(input())","input":"hi"}"#,
        Some("alice"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(body.stdout, "hi");
    assert_eq!(body.error_type, None);
    assert_eq!(body.execution_time, 0.25);

    let seen = executor.seen.lock().unwrap();
    assert_eq!(seen[0].0.caller_id, "alice");
    assert_eq!(seen[0].1.as_deref(), Some("student"));
}

#[tokio::test]
async fn api_alias_and_anonymous_caller() {
    let executor = Arc::new(FakeExecutor::default());
    let (status, _, _) = post(executor.clone(), "/api/execute", r#"{"language":"python","code":"x"}"#, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(executor.seen.lock().unwrap()[0].0.caller_id, "anonymous");
}

#[tokio::test]
async fn timeout_is_a_normal_result() {
    let (status, _, body) = post(
        Arc::new(FakeExecutor::default()),
        "/execute",
        r#"{"language":"loop","code":"while True: pass"}"#,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(body.error_type.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let executor = Arc::new(FakeExecutor::default());
    for payload in [r#"{"code":"x"}"#, r#"{"language":"python"}"#, r#"{"language":"","code":"x"}"#, "not json"] {
        let (status, _, body) = post(executor.clone(), "/execute", payload, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", payload);
        assert!(!body.success);
        assert_eq!(body.stderr, "Language and code are required.");
    }
    assert!(executor.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_code_still_runs() {
    let executor = Arc::new(FakeExecutor::default());
    let (status, _, body) = post(executor.clone(), "/execute", r#"{"language":"python","code":""}"#, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(executor.seen.lock().unwrap()[0].0.source, Vec::<u8>::new());
}

#[tokio::test]
async fn body_over_limit_is_input_too_large() {
    let executor = Arc::new(FakeExecutor::default());
    let payload = format!(r#"{{"language":"python","code":"{}"}}"#, "x".repeat(4096));
    let (status, _, body) = post(executor.clone(), "/execute", &payload, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.success);
    assert_eq!(body.stderr, execbox::server::handlers::BODY_TOO_LARGE_MESSAGE);
    assert!(executor.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_and_oversize_are_bad_requests() {
    let executor = Arc::new(FakeExecutor::default());
    let (status, _, body) = post(executor.clone(), "/execute", r#"{"language":"cobol","code":"x"}"#, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.stderr.contains("cobol"));

    let (status, _, _) = post(executor, "/execute", r#"{"language":"huge","code":"x"}"#, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn overload_returns_429_with_retry_after() {
    let (status, headers, body) = post(
        Arc::new(FakeExecutor::default()),
        "/execute",
        r#"{"language":"busy","code":"x"}"#,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "1");
    assert!(!body.success);
}

#[tokio::test]
async fn sandbox_fault_is_500() {
    let (status, _, body) = post(
        Arc::new(FakeExecutor::default()),
        "/execute",
        r#"{"language":"broken","code":"x"}"#,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.success);
    assert_eq!(body.error_type, None);
}

#[tokio::test]
async fn health_and_metrics() {
    let app = router(Arc::new(FakeExecutor::default()));
    let response = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["live_sandboxes"], 0);
    assert!(value["version"].is_string());

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("execbox_requests_total"));
}
