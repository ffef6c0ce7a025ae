//! Pruebas del cliente HTTP contra un backend simulado con axum.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream;
use miras_client::{
    upload::{IngestBatch, UploadFile},
    Backend, ClientConfig, ClientError, HttpBackend, QueryPhase, SearchRequest, SessionChoice,
    Workspace,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Recorded {
    searches: Arc<Mutex<Vec<Value>>>,
    uploads: Arc<Mutex<Vec<String>>>,
    session_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

/// Respuesta SSE troceada en pedazos de `size` bytes, sin respetar
/// fronteras de línea ni de carácter.
fn sse(frames: &[Value], size: usize) -> Response {
    let body: Vec<u8> = frames
        .iter()
        .map(|f| format!("data: {f}\n\n"))
        .collect::<String>()
        .into_bytes();
    let chunks: Vec<Result<Vec<u8>, Infallible>> =
        body.chunks(size).map(|c| Ok(c.to_vec())).collect();
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream::iter(chunks)))
        .unwrap()
}

async fn search(State(rec): State<Recorded>, Json(body): Json<Value>) -> Response {
    rec.searches.lock().unwrap().push(body);
    sse(
        &[
            json!({"phase": "routing"}),
            json!({"phase": "session_created", "session_id": "s-42"}),
            json!({"phase": "answer", "content": "¿Ingresos? "}),
            json!({"phase": "answer", "content": "5 millones €."}),
            json!({"phase": "citations", "citations": [{"number": "1", "doc_name": "q3.pdf", "page": 7}]}),
            json!({"phase": "complete"}),
        ],
        5,
    )
}

async fn ingest(State(rec): State<Recorded>, body: Bytes) -> Response {
    rec.uploads
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&body).to_string());
    sse(
        &[
            json!({"type": "progress", "message": "📄 Processing q3.pdf", "filename": "q3.pdf"}),
            json!({"type": "file_complete", "message": "✅ q3.pdf indexed", "filename": "q3.pdf"}),
            json!({"type": "batch_complete"}),
        ],
        11,
    )
}

async fn sessions(
    State(rec): State<Recorded>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    rec.session_queries.lock().unwrap().push(params);
    Json(json!({"sessions": [{
        "id": "s-42",
        "title": "Revenue",
        "started_at": "2024-05-01T10:00:00",
        "last_message_at": "2024-05-01T10:05:00",
        "message_count": 4,
        "is_active": true
    }]}))
}

async fn session_messages(Path(id): Path<String>) -> Json<Value> {
    Json(json!([{
        "id": format!("{id}-1"),
        "query": "revenue?",
        "enhanced_query": "quarterly revenue",
        "response": "5M",
        "created_at": "2024-05-01T10:00:00"
    }]))
}

async fn delete_session(State(rec): State<Recorded>, Path(id): Path<String>) -> StatusCode {
    rec.deleted.lock().unwrap().push(id);
    StatusCode::OK
}

async fn documents() -> Json<Value> {
    Json(json!({
        "success": true,
        "documents": [{
            "id": "d1",
            "name": "q3.pdf",
            "type": "pdf",
            "size": 2048,
            "size_formatted": "2.0 KB",
            "status": "processing",
            "created_at": "2024-05-01T10:00:00",
            "updated_at": "2024-05-01T10:00:00"
        }],
        "total": 1
    }))
}

async fn missing_document() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn healthy_backend() -> (String, Recorded) {
    let recorded = Recorded::default();
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/search", post(search))
        .route("/api/ingest/contextual/batch", post(ingest))
        .route("/api/conversation/sessions", get(sessions))
        .route("/api/conversation/sessions/:id", delete(delete_session))
        .route("/api/conversation/sessions/:id/messages", get(session_messages))
        .route("/api/documents", get(documents))
        .route("/api/documents/:id", delete(missing_document))
        .with_state(recorded.clone());
    (serve(router).await, recorded)
}

fn config(api_url: String) -> ClientConfig {
    ClientConfig {
        api_url,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn query_streams_through_http() {
    let (url, recorded) = healthy_backend().await;
    let mut ws = Workspace::connect(&config(url)).unwrap();
    ws.health().await.unwrap();

    let state = ws.ask("¿Cuánto facturamos?", SessionChoice::Remembered).await;

    assert_eq!(state.phase, QueryPhase::Complete);
    assert_eq!(state.answer, "¿Ingresos? 5 millones €.");
    assert_eq!(ws.current_session().as_deref(), Some("s-42"));
    assert_eq!(
        recorded.searches.lock().unwrap()[0],
        json!({"query": "¿Cuánto facturamos?", "mode": "hybrid", "stream": true, "session_id": null})
    );

    let messages = ws.conversation().snapshot();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "Sources:\n[1] q3.pdf (page 7)");

    // `ask` refresca la lista de sesiones al terminar.
    assert_eq!(ws.directory().sessions()[0].id, "s-42");
}

#[tokio::test]
async fn ingest_posts_multipart_and_streams_progress() {
    let (url, recorded) = healthy_backend().await;
    let ws = Workspace::connect(&config(url)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q3.pdf");
    std::fs::write(&path, b"%PDF-1.4 fake").unwrap();

    let report = ws
        .ingest(&[path], Some("extract revenue tables".to_string()), None)
        .await
        .unwrap();

    assert!(report.completed);
    assert_eq!(report.processed, vec!["q3.pdf"]);

    let body = recorded.uploads.lock().unwrap()[0].clone();
    assert!(body.contains("name=\"files\"; filename=\"q3.pdf\""));
    assert!(body.contains("application/pdf"));
    assert!(body.contains("name=\"user_instructions\""));
    assert!(body.contains("extract revenue tables"));

    let messages = ws.conversation().snapshot();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "q3.pdf indexed");
    assert_eq!(ws.directory().pending_documents(), 1);
}

#[tokio::test]
async fn crud_endpoints_map_to_typed_results() {
    let (url, recorded) = healthy_backend().await;
    let backend = HttpBackend::new(&url, Duration::from_secs(5)).unwrap();

    let sessions = backend.list_sessions(20, true).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].message_count, 4);
    let params = recorded.session_queries.lock().unwrap()[0].clone();
    assert_eq!(params.get("limit").map(String::as_str), Some("20"));
    assert_eq!(params.get("active_only").map(String::as_str), Some("true"));

    let history = backend.session_messages("s-42").await.unwrap();
    assert_eq!(history[0].id, "s-42-1");
    assert_eq!(history[0].enhanced_query.as_deref(), Some("quarterly revenue"));

    backend.delete_session("s-42").await.unwrap();
    assert_eq!(*recorded.deleted.lock().unwrap(), vec!["s-42"]);

    let documents = backend.list_documents().await.unwrap();
    assert!(documents.success);
    assert_eq!(documents.documents[0].size_bytes, 2048);
    assert!(documents.documents[0].is_pending());

    let err = backend.delete_document("nope").await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 404, .. }));
}

#[tokio::test]
async fn failures_surface_as_client_errors() {
    let router = Router::new()
        .route(
            "/api/search",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response() }),
        )
        .route("/api/documents", get(|| async { "not json" }));
    let url = serve(router).await;
    let backend = HttpBackend::new(&url, Duration::from_secs(5)).unwrap();

    let err = match backend.open_search(&SearchRequest::new("q", None)).await {
        Ok(_) => panic!("search should have been refused"),
        Err(e) => e,
    };
    assert!(matches!(err, ClientError::Status { status: 500, .. }));
    assert!(err.to_string().contains("/api/search"));
    assert!(err.is_transport());

    let err = backend.list_documents().await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidResponse { .. }));
    assert!(!err.is_transport());

    let batch = IngestBatch::new(vec![UploadFile::from_bytes("a.pdf", vec![1])], None);
    let err = match backend.open_ingest(batch).await {
        Ok(_) => panic!("ingest route does not exist"),
        Err(e) => e,
    };
    assert!(matches!(err, ClientError::Status { status: 404, .. }));
}

#[tokio::test]
async fn unreachable_backend_fails_the_query_with_one_error_entry() {
    // Puerto reservado y liberado: nadie escucha ahí.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let mut ws = Workspace::connect(&config(url)).unwrap();

    let state = ws.ask("q", SessionChoice::Remembered).await;

    assert_eq!(state.phase, QueryPhase::Error);
    let messages = ws.conversation().snapshot();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_error);
}
