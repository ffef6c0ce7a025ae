//! Directorio de sesiones y documentos: vistas CRUD simples sobre el backend.
//!
//! No hay máquina de estados. Si una operación falla, el error se registra,
//! la lista en caché queda como estaba y el error vuelve al llamador para
//! que lo muestre como aviso.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::{
    backend::Backend,
    error::ClientError,
    models::{DocumentRecord, Session, StoredExchange},
};

/// Última foto conocida de las sesiones y documentos.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub sessions: Vec<Session>,
    pub documents: Vec<DocumentRecord>,
    pub total_documents: u64,
}

#[derive(Clone)]
pub struct Directory {
    backend: Arc<dyn Backend>,
    listing: Arc<Mutex<Listing>>,
    session_limit: usize,
    active_only: bool,
}

impl Directory {
    pub fn new(backend: Arc<dyn Backend>, session_limit: usize, active_only: bool) -> Self {
        Self {
            backend,
            listing: Arc::new(Mutex::new(Listing::default())),
            session_limit,
            active_only,
        }
    }

    fn listing(&self) -> MutexGuard<'_, Listing> {
        self.listing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Listing {
        self.listing().clone()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.listing().sessions.clone()
    }

    pub fn documents(&self) -> Vec<DocumentRecord> {
        self.listing().documents.clone()
    }

    pub fn pending_documents(&self) -> usize {
        self.listing()
            .documents
            .iter()
            .filter(|d| d.is_pending())
            .count()
    }

    pub async fn refresh_sessions(&self) -> Result<usize, ClientError> {
        match self
            .backend
            .list_sessions(self.session_limit, self.active_only)
            .await
        {
            Ok(sessions) => {
                let count = sessions.len();
                self.listing().sessions = sessions;
                Ok(count)
            }
            Err(e) => {
                warn!("No se pudieron cargar las sesiones: {e}");
                Err(e)
            }
        }
    }

    pub async fn refresh_documents(&self) -> Result<usize, ClientError> {
        let result = match self.backend.list_documents().await {
            Ok(list) if list.success => Ok(list),
            Ok(list) => Err(ClientError::Backend(
                list.error
                    .unwrap_or_else(|| "document listing failed".to_string()),
            )),
            Err(e) => Err(e),
        };

        match result {
            Ok(list) => {
                let count = list.documents.len();
                let mut listing = self.listing();
                listing.total_documents = list.total.max(count as u64);
                listing.documents = list.documents;
                Ok(count)
            }
            Err(e) => {
                warn!("No se pudieron cargar los documentos: {e}");
                Err(e)
            }
        }
    }

    pub async fn session_history(&self, session_id: &str) -> Result<Vec<StoredExchange>, ClientError> {
        self.backend.session_messages(session_id).await.map_err(|e| {
            warn!("No se pudo cargar el historial de la sesión {session_id}: {e}");
            e
        })
    }

    /// Borra la sesión y la quita de la lista en caché.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        if let Err(e) = self.backend.delete_session(session_id).await {
            warn!("No se pudo borrar la sesión {session_id}: {e}");
            return Err(e);
        }
        self.listing().sessions.retain(|s| s.id != session_id);
        info!("Sesión {session_id} borrada");
        Ok(())
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<(), ClientError> {
        if let Err(e) = self.backend.delete_document(document_id).await {
            warn!("No se pudo borrar el documento {document_id}: {e}");
            return Err(e);
        }
        {
            let mut listing = self.listing();
            let before = listing.documents.len();
            listing.documents.retain(|d| d.id != document_id);
            if listing.documents.len() < before {
                listing.total_documents = listing.total_documents.saturating_sub(1);
            }
        }
        info!("Documento {document_id} borrado");
        Ok(())
    }
}
