#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use miras_client::{
    models::{DocumentList, DocumentRecord, Session, StoredExchange},
    upload::IngestBatch,
    Backend, ByteStream, ClientError, SearchRequest,
};
use serde_json::Value;

/// Respuesta enlatada para un stream SSE.
pub enum Script {
    /// Entrega los trozos y cierra.
    Chunks(Vec<String>),
    /// Entrega los trozos y se queda abierto sin más datos.
    Hang(Vec<String>),
    /// Entrega los trozos y corta con un error de transporte.
    Broken(Vec<String>),
    /// Repite el mismo trozo cada milisegundo, sin final.
    Trickle(String),
    /// El backend rechaza la petición con este código HTTP.
    Refuse(u16),
}

pub fn frame(value: Value) -> String {
    format!("data: {value}\n\n")
}

pub fn frames(values: Vec<Value>) -> Vec<String> {
    values.into_iter().map(frame).collect()
}

pub fn session(id: &str, title: &str) -> Session {
    Session {
        id: id.to_string(),
        title: title.to_string(),
        started_at: "2024-05-01T10:00:00".to_string(),
        last_message_at: "2024-05-01T10:05:00".to_string(),
        message_count: 2,
        is_active: true,
    }
}

pub fn document(id: &str, name: &str, status: &str) -> DocumentRecord {
    DocumentRecord {
        id: id.to_string(),
        name: name.to_string(),
        doc_type: "pdf".to_string(),
        size_bytes: 2048,
        size_formatted: "2.0 KB".to_string(),
        status: status.to_string(),
        created_at: "2024-05-01T10:00:00".to_string(),
        updated_at: "2024-05-01T10:00:00".to_string(),
    }
}

pub fn exchange(id: &str, query: &str, response: &str) -> StoredExchange {
    StoredExchange {
        id: id.to_string(),
        query: query.to_string(),
        enhanced_query: None,
        response: response.to_string(),
        created_at: "2024-05-01T10:00:00".to_string(),
    }
}

/// Backend en memoria que registra lo que recibe.
#[derive(Default)]
pub struct FakeBackend {
    search_scripts: Mutex<VecDeque<Script>>,
    ingest_scripts: Mutex<VecDeque<Script>>,
    pub searches: Mutex<Vec<SearchRequest>>,
    pub uploads: Mutex<Vec<IngestBatch>>,
    pub sessions: Mutex<Vec<Session>>,
    pub documents: Mutex<Vec<DocumentRecord>>,
    pub history: Mutex<Vec<StoredExchange>>,
    pub deleted: Mutex<Vec<String>>,
    pub document_listings: AtomicUsize,
    pub failing_listings: Mutex<bool>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_search(self, script: Script) -> Self {
        self.search_scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn script_ingest(self, script: Script) -> Self {
        self.ingest_scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn with_sessions(self, sessions: Vec<Session>) -> Self {
        *self.sessions.lock().unwrap() = sessions;
        self
    }

    pub fn with_documents(self, documents: Vec<DocumentRecord>) -> Self {
        *self.documents.lock().unwrap() = documents;
        self
    }

    pub fn with_history(self, history: Vec<StoredExchange>) -> Self {
        *self.history.lock().unwrap() = history;
        self
    }

    pub fn fail_listings(&self) {
        *self.failing_listings.lock().unwrap() = true;
    }

    pub fn recorded_searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().unwrap().clone()
    }

    fn listing_fails(&self) -> bool {
        *self.failing_listings.lock().unwrap()
    }

    fn play(script: Option<Script>, endpoint: &str) -> Result<ByteStream, ClientError> {
        let ok = |chunks: Vec<String>| {
            stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok::<_, ClientError>(c.into_bytes())),
            )
        };
        match script.unwrap_or(Script::Chunks(Vec::new())) {
            Script::Chunks(chunks) => Ok(Box::pin(ok(chunks))),
            Script::Hang(chunks) => Ok(Box::pin(ok(chunks).chain(stream::pending()))),
            Script::Broken(chunks) => Ok(Box::pin(ok(chunks).chain(stream::once(async {
                Err(ClientError::Backend("connection reset".to_string()))
            })))),
            Script::Trickle(chunk) => Ok(Box::pin(stream::unfold(chunk, |chunk| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some((Ok::<_, ClientError>(chunk.clone().into_bytes()), chunk))
            }))),
            Script::Refuse(status) => Err(ClientError::Status {
                endpoint: endpoint.to_string(),
                status,
            }),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn open_search(&self, request: &SearchRequest) -> Result<ByteStream, ClientError> {
        self.searches.lock().unwrap().push(request.clone());
        let script = self.search_scripts.lock().unwrap().pop_front();
        Self::play(script, "/api/search")
    }

    async fn open_ingest(&self, batch: IngestBatch) -> Result<ByteStream, ClientError> {
        self.uploads.lock().unwrap().push(batch);
        let script = self.ingest_scripts.lock().unwrap().pop_front();
        Self::play(script, "/api/ingest/contextual/batch")
    }

    async fn list_sessions(
        &self,
        limit: usize,
        _active_only: bool,
    ) -> Result<Vec<Session>, ClientError> {
        if self.listing_fails() {
            return Err(ClientError::Status {
                endpoint: "/api/conversation/sessions".to_string(),
                status: 500,
            });
        }
        Ok(self.sessions.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn session_messages(
        &self,
        _session_id: &str,
    ) -> Result<Vec<StoredExchange>, ClientError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.sessions.lock().unwrap().retain(|s| s.id != session_id);
        self.deleted.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn list_documents(&self) -> Result<DocumentList, ClientError> {
        self.document_listings.fetch_add(1, Ordering::SeqCst);
        if self.listing_fails() {
            return Ok(DocumentList {
                success: false,
                documents: Vec::new(),
                total: 0,
                error: Some("datastore unavailable".to_string()),
            });
        }
        let documents = self.documents.lock().unwrap().clone();
        Ok(DocumentList {
            success: true,
            total: documents.len() as u64,
            documents,
            error: None,
        })
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), ClientError> {
        self.documents.lock().unwrap().retain(|d| d.id != document_id);
        self.deleted.lock().unwrap().push(document_id.to_string());
        Ok(())
    }

    async fn health(&self) -> Result<(), ClientError> {
        Ok(())
    }
}
