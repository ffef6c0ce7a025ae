//! Acceso al backend: contrato (`Backend`) e implementación HTTP con reqwest.
//!
//! Endpoints:
//!   - `POST /api/search` (SSE)
//!   - `POST /api/ingest/contextual/batch` (multipart, SSE)
//!   - `GET|DELETE /api/conversation/sessions...`
//!   - `GET|DELETE /api/documents...`
//!   - `GET /health`

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::ClientConfig,
    error::ClientError,
    models::{DocumentList, Session, StoredExchange},
    upload::IngestBatch,
};

/// Bytes crudos de una respuesta SSE, tal y como los entrega el transporte.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ClientError>> + Send>>;

/// Cuerpo de `POST /api/search`. `session_id` se serializa como `null`
/// cuando no hay sesión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub mode: String,
    pub stream: bool,
    pub session_id: Option<String>,
}

impl SearchRequest {
    pub fn new(query: &str, session_id: Option<String>) -> Self {
        Self {
            query: query.to_string(),
            mode: "hybrid".to_string(),
            stream: true,
            session_id,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn open_search(&self, request: &SearchRequest) -> Result<ByteStream, ClientError>;

    async fn open_ingest(&self, batch: IngestBatch) -> Result<ByteStream, ClientError>;

    async fn list_sessions(
        &self,
        limit: usize,
        active_only: bool,
    ) -> Result<Vec<Session>, ClientError>;

    async fn session_messages(&self, session_id: &str)
        -> Result<Vec<StoredExchange>, ClientError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), ClientError>;

    async fn list_documents(&self) -> Result<DocumentList, ClientError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), ClientError>;

    async fn health(&self) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct SessionsEnvelope {
    #[serde(default)]
    sessions: Vec<Session>,
}

/// Cliente HTTP del backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Url(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }
        // Sin timeout global: los streams SSE pueden durar lo que haga falta.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        info!("Backend configurado en {base}");
        Ok(Self {
            client,
            base,
            request_timeout,
        })
    }

    pub fn from_config(cfg: &ClientConfig) -> Result<Self, ClientError> {
        Self::new(&cfg.api_url, cfg.request_timeout)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` ya descartó las URLs que no pueden ser base.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Status {
                endpoint: response.url().path().to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let endpoint = response.url().path().to_string();
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|source| ClientError::InvalidResponse { endpoint, source })
    }

    fn into_stream(response: reqwest::Response) -> ByteStream {
        Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from)),
        )
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn open_search(&self, request: &SearchRequest) -> Result<ByteStream, ClientError> {
        let url = self.endpoint(&["api", "search"]);
        debug!(
            "POST {url} (session_id = {})",
            request.session_id.as_deref().unwrap_or("null")
        );
        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        Ok(Self::into_stream(Self::check(response)?))
    }

    async fn open_ingest(&self, batch: IngestBatch) -> Result<ByteStream, ClientError> {
        let url = self.endpoint(&["api", "ingest", "contextual", "batch"]);
        debug!("POST {url} ({} ficheros)", batch.files.len());

        let mut form = Form::new();
        for file in batch.files {
            let part = Part::bytes(file.bytes)
                .file_name(file.name)
                .mime_str(&file.mime)?;
            form = form.part("files", part);
        }
        if let Some(instructions) = batch.user_instructions {
            form = form.text("user_instructions", instructions);
        }

        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .multipart(form)
            .send()
            .await?;
        Ok(Self::into_stream(Self::check(response)?))
    }

    async fn list_sessions(
        &self,
        limit: usize,
        active_only: bool,
    ) -> Result<Vec<Session>, ClientError> {
        let url = self.endpoint(&["api", "conversation", "sessions"]);
        let response = self
            .client
            .get(url)
            .query(&[
                ("limit", limit.to_string()),
                ("active_only", active_only.to_string()),
            ])
            .timeout(self.request_timeout)
            .send()
            .await?;
        let envelope: SessionsEnvelope = Self::read_json(Self::check(response)?).await?;
        Ok(envelope.sessions)
    }

    async fn session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<StoredExchange>, ClientError> {
        let url = self.endpoint(&["api", "conversation", "sessions", session_id, "messages"]);
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::read_json(Self::check(response)?).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&["api", "conversation", "sessions", session_id]);
        let response = self
            .client
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::check(response)?;
        Ok(())
    }

    async fn list_documents(&self) -> Result<DocumentList, ClientError> {
        let url = self.endpoint(&["api", "documents"]);
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::read_json(Self::check(response)?).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&["api", "documents", document_id]);
        let response = self
            .client
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::check(response)?;
        Ok(())
    }

    async fn health(&self) -> Result<(), ClientError> {
        let url = self.endpoint(&["health"]);
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::check(response)?;
        Ok(())
    }
}
