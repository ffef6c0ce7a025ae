//! Punto de entrada de alto nivel: reúne el backend, la conversación, el
//! controlador de consultas y el directorio de sesiones/documentos.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{
    backend::{Backend, HttpBackend},
    config::ClientConfig,
    directory::Directory,
    error::ClientError,
    ingest_stream::{IngestReport, IngestStreamController, IngestUpdate},
    query_stream::{QueryOptions, QueryState, QueryStreamController, QueryUpdate, SessionChoice},
    reconciler::ConversationHandle,
    upload::IngestBatch,
};

pub struct Workspace {
    backend: Arc<dyn Backend>,
    conversation: ConversationHandle,
    query: QueryStreamController,
    directory: Directory,
}

impl Workspace {
    pub fn new(backend: Arc<dyn Backend>, cfg: &ClientConfig) -> Self {
        let conversation = ConversationHandle::new();
        let query = QueryStreamController::new(Arc::clone(&backend), conversation.clone())
            .with_options(QueryOptions {
                show_thinking: cfg.show_thinking,
                idle_timeout: cfg.idle_timeout,
            });
        let directory = Directory::new(Arc::clone(&backend), cfg.session_limit, cfg.active_only);
        Self {
            backend,
            conversation,
            query,
            directory,
        }
    }

    /// Construye el workspace contra el backend HTTP de la configuración.
    pub fn connect(cfg: &ClientConfig) -> Result<Self, ClientError> {
        let backend = HttpBackend::from_config(cfg)?;
        Ok(Self::new(Arc::new(backend), cfg))
    }

    pub fn with_query_observer(mut self, observer: UnboundedSender<QueryUpdate>) -> Self {
        self.query = self.query.with_observer(observer);
        self
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn query(&self) -> &QueryStreamController {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut QueryStreamController {
        &mut self.query
    }

    pub fn current_session(&self) -> Option<String> {
        self.query.session_id()
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        self.backend.health().await
    }

    /// Envía una consulta y espera a que termine. Después refresca la lista
    /// de sesiones, que ha podido cambiar.
    pub async fn ask(&mut self, text: &str, choice: SessionChoice) -> QueryState {
        let state = self.query.send(text, choice).await;
        if let Err(e) = self.directory.refresh_sessions().await {
            warn!("Lista de sesiones sin actualizar: {e}");
        }
        state
    }

    /// Controlador para un lote nuevo; puede ejecutarse en paralelo a una consulta.
    pub fn ingestion(&self) -> IngestStreamController {
        IngestStreamController::new(Arc::clone(&self.backend), self.conversation.clone())
            .with_directory(self.directory.clone())
    }

    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        user_instructions: Option<String>,
        observer: Option<UnboundedSender<IngestUpdate>>,
    ) -> Result<IngestReport, ClientError> {
        let batch = IngestBatch::from_paths(paths, user_instructions).await?;
        let mut controller = self.ingestion();
        if let Some(observer) = observer {
            controller = controller.with_observer(observer);
        }
        Ok(controller.run(batch).await)
    }

    /// Sustituye la conversación por el historial de una sesión y la deja
    /// como sesión recordada.
    pub async fn open_session(&mut self, session_id: &str) -> Result<usize, ClientError> {
        let exchanges = self.directory.session_history(session_id).await?;
        self.query.cancel();
        self.conversation.lock().load_history(session_id, &exchanges);
        self.query.set_session(Some(session_id.to_string()));
        info!("Sesión {session_id} abierta ({} intercambios)", exchanges.len());
        Ok(exchanges.len())
    }

    /// Conversación nueva: lista vacía, sin sesión y sin petición en curso.
    pub fn new_conversation(&mut self) {
        self.query.reset();
        self.conversation.lock().clear();
    }

    pub async fn delete_session(&mut self, session_id: &str) -> Result<(), ClientError> {
        self.directory.delete_session(session_id).await?;
        if self.current_session().as_deref() == Some(session_id) {
            self.new_conversation();
        }
        Ok(())
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<(), ClientError> {
        self.directory.delete_document(document_id).await
    }

    /// Refresca sesiones y documentos. Devuelve los avisos de los que fallen.
    pub async fn refresh_directory(&self) -> Vec<String> {
        let mut notices = Vec::new();
        if let Err(e) = self.directory.refresh_sessions().await {
            notices.push(format!("Could not load sessions: {e}"));
        }
        if let Err(e) = self.directory.refresh_documents().await {
            notices.push(format!("Could not load documents: {e}"));
        }
        notices
    }
}
