//! Submission client against a mock analysis engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use artifact_forwarder::config::EngineConfig;
use artifact_forwarder::model::TaskRef;
use artifact_forwarder::submit::{AnalysisClient, SubmitError, Submitter};
use axum::Router;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use secrecy::SecretString;

const CREATE: &str = "/apiv2/tasks/create/file/";

#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
struct Seen {
    fields: Arc<Mutex<Vec<Field>>>,
    authorization: Arc<Mutex<Option<String>>>,
}

async fn capture(
    State(seen): State<Seen>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> &'static str {
    *seen.authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.unwrap().to_vec();
        seen.fields.lock().unwrap().push(Field {
            name,
            file_name,
            content_type,
            data,
        });
    }
    r#"{"data": {"task_ids": [41]}}"#
}

/// Serve `router` on an ephemeral port; returns the engine base URL.
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/apiv2")
}

fn engine(url: String) -> EngineConfig {
    EngineConfig {
        url,
        timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

fn artifact(data: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), data).unwrap();
    file
}

#[tokio::test]
async fn posts_multipart_and_parses_task_id() {
    let seen = Seen::default();
    let url = serve(
        Router::new()
            .route(CREATE, post(capture))
            .with_state(seen.clone()),
    )
    .await;

    let config = EngineConfig {
        tags: "win10,x64".into(),
        options: "procmemdump=1".into(),
        api_token: Some(SecretString::from("s3cret".to_string())),
        ..engine(url)
    };
    let client = AnalysisClient::new(&config).unwrap();
    let file = artifact(b"MZ payload bytes");

    let ack = client.submit(file.path(), "invoice.exe").await.unwrap();
    assert_eq!(ack.task_ref, Some(TaskRef(41)));
    assert_eq!(ack.raw, r#"{"data": {"task_ids": [41]}}"#);

    let fields = seen.fields.lock().unwrap().clone();
    let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["file", "tags", "options"]);

    let upload = &fields[0];
    assert_eq!(upload.file_name.as_deref(), Some("invoice.exe"));
    assert_eq!(
        upload.content_type.as_deref(),
        Some("application/octet-stream")
    );
    assert_eq!(upload.data, b"MZ payload bytes");
    assert_eq!(fields[1].data, b"win10,x64");
    assert_eq!(fields[2].data, b"procmemdump=1");

    assert_eq!(
        seen.authorization.lock().unwrap().as_deref(),
        Some("Token s3cret")
    );
}

#[tokio::test]
async fn no_token_no_authorization_header() {
    let seen = Seen::default();
    let url = serve(
        Router::new()
            .route(CREATE, post(capture))
            .with_state(seen.clone()),
    )
    .await;

    let client = AnalysisClient::new(&engine(url)).unwrap();
    let file = artifact(b"x");
    client.submit(file.path(), "x.bin").await.unwrap();

    assert!(seen.authorization.lock().unwrap().is_none());
    assert_eq!(seen.fields.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn error_flag_on_200_is_rejected() {
    let url = serve(Router::new().route(
        CREATE,
        post(|| async { r#"{"error": true, "error_value": "bad format"}"# }),
    ))
    .await;

    let client = AnalysisClient::new(&engine(url)).unwrap();
    let file = artifact(b"x");
    let err = client.submit(file.path(), "x.bin").await.unwrap_err();
    assert!(matches!(err, SubmitError::Rejected(ref d) if d == "bad format"));
}

#[tokio::test]
async fn non_json_body_is_accepted_without_task_ref() {
    let url = serve(Router::new().route(CREATE, post(|| async { "Task added" }))).await;

    let client = AnalysisClient::new(&engine(url)).unwrap();
    let file = artifact(b"x");
    let ack = client.submit(file.path(), "x.bin").await.unwrap();
    assert_eq!(ack.task_ref, None);
    assert_eq!(ack.raw, "Task added");
}

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let url = serve(Router::new().route(
        CREATE,
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "machine pool exhausted") }),
    ))
    .await;

    let client = AnalysisClient::new(&engine(url)).unwrap();
    let file = artifact(b"x");
    match client.submit(file.path(), "x.bin").await.unwrap_err() {
        SubmitError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "machine pool exhausted");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_engine_times_out() {
    let url = serve(Router::new().route(
        CREATE,
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }),
    ))
    .await;

    let config = EngineConfig {
        timeout: Duration::from_millis(200),
        ..engine(url)
    };
    let client = AnalysisClient::new(&config).unwrap();
    let file = artifact(b"x");
    let err = client.submit(file.path(), "x.bin").await.unwrap_err();
    assert!(matches!(err, SubmitError::Timeout), "got {err:?}");
}

#[tokio::test]
async fn unreachable_engine_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = AnalysisClient::new(&engine(format!("http://{addr}/apiv2"))).unwrap();
    let file = artifact(b"x");
    let err = client.submit(file.path(), "x.bin").await.unwrap_err();
    assert!(matches!(err, SubmitError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_artifact_is_an_io_error() {
    let client = AnalysisClient::new(&engine("http://127.0.0.1:9/apiv2".into())).unwrap();
    let err = client
        .submit(std::path::Path::new("/nonexistent/artifact"), "x.bin")
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Io(_)));
}
