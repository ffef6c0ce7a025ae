//! Controlador del stream de búsqueda.
//!
//! Una petición de búsqueda atraviesa las fases
//! `idle → routing → searching → synthesizing → answering →
//! (validating_start → validating_thinking)? → complete`, con `error`
//! alcanzable desde cualquier fase no terminal.
//!
//! La máquina de estados (`QueryState::apply`) es pura: devuelve una lista
//! de `QueryUpdate`. El controlador ejecuta la lectura del stream en una
//! tarea de tokio, aplica cada update al reconciliador y lo reenvía al
//! observador, si lo hay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Backend, SearchRequest},
    decoder::decode_events,
    error::ClientError,
    models::{Citation, RequestId, ValidationResult},
    reconciler::{ConversationHandle, ConversationReconciler},
};

pub const ROUTING_STATUS: &str = "Analyzing your question...";
pub const SEARCH_STATUS: &str = "Searching knowledge base...";
pub const SYNTHESIS_STATUS: &str = "Preparing answer...";
pub const VALIDATION_STATUS: &str = "Validating response...";

/// Longitud (en caracteres) del avance del razonamiento que se muestra como estado.
pub const THINKING_PREVIEW_CHARS: usize = 100;

/// Frame del stream de búsqueda, discriminado por `phase`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum QueryEvent {
    Routing,
    Search,
    Synthesis,
    SessionCreated {
        session_id: String,
    },
    SessionContinued {
        session_id: String,
    },
    QueryEnhanced {
        #[serde(alias = "content")]
        enhanced_query: String,
    },
    Answer {
        #[serde(default)]
        content: String,
    },
    Citations {
        #[serde(default)]
        citations: Vec<Citation>,
    },
    ValidationStart,
    ValidationThinking {
        #[serde(default)]
        content: String,
    },
    ValidationComplete {
        #[serde(default)]
        validation: ValidationResult,
    },
    Complete,
    Error {
        #[serde(default, alias = "message")]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryPhase {
    #[default]
    Idle,
    Routing,
    Searching,
    Synthesizing,
    Answering,
    ValidatingStart,
    ValidatingThinking,
    Complete,
    Error,
}

impl QueryPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Cambios observables que produce cada frame.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryUpdate {
    Status(Option<String>),
    SessionBound(String),
    EnhancedQuery(String),
    /// Contenido acumulado de la respuesta hasta el momento.
    Answer(String),
    Citations(Vec<Citation>),
    /// Razonamiento completo hasta el momento (no un delta).
    Thinking(String),
    Validation(ValidationResult),
    Completed,
    Failed(String),
}

/// Estado de una petición en curso.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryState {
    pub request_id: Option<RequestId>,
    pub phase: QueryPhase,
    pub status: Option<String>,
    pub answer: String,
    pub thinking: String,
    pub session_id: Option<String>,
    pub enhanced_query: Option<String>,
    pub citations: Vec<Citation>,
    pub validation: Option<ValidationResult>,
    pub error: Option<String>,
}

impl QueryState {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    /// Aplica un frame y devuelve los cambios que produce. Tras una fase
    /// terminal no se procesa nada más.
    pub fn apply(&mut self, event: QueryEvent) -> Vec<QueryUpdate> {
        if self.phase.is_terminal() {
            debug!("Frame ignorado tras fase terminal: {event:?}");
            return Vec::new();
        }

        match event {
            QueryEvent::Routing => self.enter(QueryPhase::Routing, Some(ROUTING_STATUS)),
            QueryEvent::Search => self.enter(QueryPhase::Searching, Some(SEARCH_STATUS)),
            QueryEvent::Synthesis => self.enter(QueryPhase::Synthesizing, Some(SYNTHESIS_STATUS)),
            QueryEvent::SessionCreated { session_id }
            | QueryEvent::SessionContinued { session_id } => {
                self.session_id = Some(session_id.clone());
                vec![QueryUpdate::SessionBound(session_id)]
            }
            QueryEvent::QueryEnhanced { enhanced_query } => {
                self.enhanced_query = Some(enhanced_query.clone());
                vec![QueryUpdate::EnhancedQuery(enhanced_query)]
            }
            QueryEvent::Answer { content } => {
                let mut updates = self.enter(QueryPhase::Answering, None);
                self.answer.push_str(&content);
                updates.push(QueryUpdate::Answer(self.answer.clone()));
                updates
            }
            QueryEvent::Citations { citations } => {
                self.citations = citations.clone();
                vec![QueryUpdate::Citations(citations)]
            }
            QueryEvent::ValidationStart => {
                self.thinking.clear();
                self.enter(QueryPhase::ValidatingStart, Some(VALIDATION_STATUS))
            }
            QueryEvent::ValidationThinking { content } => {
                // El backend envía el razonamiento completo, no un delta.
                self.thinking = content;
                let preview = thinking_preview(&self.thinking);
                let mut updates =
                    self.enter(QueryPhase::ValidatingThinking, Some(preview.as_str()));
                updates.push(QueryUpdate::Thinking(self.thinking.clone()));
                updates
            }
            QueryEvent::ValidationComplete { validation } => {
                self.validation = Some(validation.clone());
                let mut updates = self.set_status(None);
                updates.push(QueryUpdate::Validation(validation));
                updates
            }
            QueryEvent::Complete => {
                let mut updates = self.enter(QueryPhase::Complete, None);
                updates.push(QueryUpdate::Completed);
                updates
            }
            QueryEvent::Error { error } => {
                self.fail(error.as_deref().unwrap_or("Unknown error"))
            }
            QueryEvent::Unknown => {
                debug!("Fase desconocida ignorada");
                Vec::new()
            }
        }
    }

    /// Lleva la petición a `error`. No hace nada si ya terminó.
    pub fn fail(&mut self, message: &str) -> Vec<QueryUpdate> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        self.error = Some(message.to_string());
        let mut updates = self.enter(QueryPhase::Error, None);
        updates.push(QueryUpdate::Failed(message.to_string()));
        updates
    }

    /// El transporte terminó sin frame terminal: se da la petición por completada.
    fn close(&mut self) -> Vec<QueryUpdate> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        warn!("El stream de búsqueda se cerró sin frame terminal");
        let mut updates = self.enter(QueryPhase::Complete, None);
        updates.push(QueryUpdate::Completed);
        updates
    }

    fn enter(&mut self, phase: QueryPhase, status: Option<&str>) -> Vec<QueryUpdate> {
        self.phase = phase;
        self.set_status(status)
    }

    fn set_status(&mut self, status: Option<&str>) -> Vec<QueryUpdate> {
        let status = status.map(str::to_string);
        if self.status == status {
            return Vec::new();
        }
        self.status = status.clone();
        vec![QueryUpdate::Status(status)]
    }
}

fn thinking_preview(thinking: &str) -> String {
    match thinking.char_indices().nth(THINKING_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &thinking[..idx]),
        None => thinking.to_string(),
    }
}

/// Qué sesión usar al enviar una consulta.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionChoice {
    /// Continúa la sesión recordada por el controlador (si la hay).
    #[default]
    Remembered,
    /// Fuerza una sesión nueva y olvida la recordada.
    Fresh,
    Explicit(String),
}

/// Aplica un update a la conversación.
pub fn reconcile(
    conversation: &mut ConversationReconciler,
    request: RequestId,
    update: &QueryUpdate,
    show_thinking: bool,
) {
    match update {
        QueryUpdate::Answer(buffer) => {
            conversation.apply_answer(request, buffer);
        }
        QueryUpdate::SessionBound(session_id) => conversation.bind_session(request, session_id),
        QueryUpdate::EnhancedQuery(enhanced) => {
            conversation.backfill_enhanced_query(request, enhanced);
        }
        QueryUpdate::Citations(citations) => conversation.place_citations(request, citations),
        QueryUpdate::Thinking(thinking) if show_thinking => {
            conversation.show_thinking(request, thinking)
        }
        QueryUpdate::Validation(result) => conversation.place_validation(request, result),
        QueryUpdate::Failed(message) => {
            conversation.push_error(Some(request), message);
        }
        QueryUpdate::Status(_) | QueryUpdate::Thinking(_) | QueryUpdate::Completed => {}
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Materializa el razonamiento de la validación como entrada provisional.
    pub show_thinking: bool,
    /// Sin datos durante este tiempo, la petición termina en error.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct Shared {
    query: QueryState,
    /// Sesión recordada entre peticiones.
    session_id: Option<String>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controlador de consultas. Una única petición viva por instancia: iniciar
/// otra cancela la anterior.
pub struct QueryStreamController {
    backend: Arc<dyn Backend>,
    conversation: ConversationHandle,
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<QueryState>>,
    observer: Option<UnboundedSender<QueryUpdate>>,
    options: QueryOptions,
}

impl QueryStreamController {
    pub fn new(backend: Arc<dyn Backend>, conversation: ConversationHandle) -> Self {
        Self {
            backend,
            conversation,
            shared: Arc::new(Mutex::new(Shared::default())),
            task: None,
            observer: None,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: UnboundedSender<QueryUpdate>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> QueryState {
        lock(&self.shared).query.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.shared).session_id.clone()
    }

    pub fn set_session(&self, session_id: Option<String>) {
        lock(&self.shared).session_id = session_id;
    }

    pub fn is_streaming(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Inicia una consulta. La entrada del usuario se añade antes de tocar la
    /// red. Debe llamarse dentro de un runtime de tokio.
    pub fn start(&mut self, query: &str, choice: SessionChoice) -> RequestId {
        self.abort_task();

        let request_id = RequestId::new();
        let session_id = {
            let mut shared = lock(&self.shared);
            let session_id = match choice {
                SessionChoice::Remembered => shared.session_id.clone(),
                SessionChoice::Fresh => None,
                SessionChoice::Explicit(id) => Some(id),
            };
            shared.session_id = session_id.clone();
            shared.query = QueryState::new(request_id);
            session_id
        };

        self.conversation
            .lock()
            .push_user(request_id, query, session_id.clone());

        let driver = Driver {
            request_id,
            backend: Arc::clone(&self.backend),
            conversation: self.conversation.clone(),
            shared: Arc::clone(&self.shared),
            observer: self.observer.clone(),
            options: self.options,
        };
        let request = SearchRequest::new(query, session_id);
        info!(request = %request_id, "Consulta iniciada");
        self.task = Some(tokio::spawn(driver.run(request)));
        request_id
    }

    /// Espera a que termine la petición en curso. `None` si no había ninguna
    /// o si fue cancelada.
    pub async fn wait(&mut self) -> Option<QueryState> {
        let task = self.task.take()?;
        match task.await {
            Ok(state) => Some(state),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                error!("La tarea de la consulta falló: {e}");
                None
            }
        }
    }

    /// `start` + `wait`.
    pub async fn send(&mut self, query: &str, choice: SessionChoice) -> QueryState {
        self.start(query, choice);
        match self.wait().await {
            Some(state) => state,
            None => self.state(),
        }
    }

    /// Deja de consumir la petición en curso y vuelve a `idle`.
    pub fn cancel(&mut self) {
        self.abort_task();
        lock(&self.shared).query = QueryState::default();
    }

    /// Cancela y además olvida la sesión recordada.
    pub fn reset(&mut self) {
        self.cancel();
        lock(&self.shared).session_id = None;
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("Cancelando la consulta anterior");
            }
            task.abort();
        }
    }
}

impl Drop for QueryStreamController {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Lado de la tarea: lee el stream y aplica los frames de una petición.
struct Driver {
    request_id: RequestId,
    backend: Arc<dyn Backend>,
    conversation: ConversationHandle,
    shared: Arc<Mutex<Shared>>,
    observer: Option<UnboundedSender<QueryUpdate>>,
    options: QueryOptions,
}

impl Driver {
    async fn run(self, request: SearchRequest) -> QueryState {
        let bytes = match self.backend.open_search(&request).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(request = %self.request_id, "No se pudo abrir el stream de búsqueda: {e}");
                self.step(|query| query.fail(&e.to_string()));
                return self.snapshot();
            }
        };

        let mut events = Box::pin(decode_events::<QueryEvent, _, _>(bytes));
        loop {
            let next = match self.options.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, events.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let e = ClientError::IdleTimeout(limit);
                        warn!(request = %self.request_id, "{e}");
                        self.step(|query| query.fail(&e.to_string()));
                        break;
                    }
                },
                None => events.next().await,
            };

            let finished = match next {
                Some(Ok(event)) => self.step(|query| query.apply(event)),
                Some(Err(e)) => {
                    error!(request = %self.request_id, "Stream de búsqueda interrumpido: {e}");
                    self.step(|query| query.fail(&e.to_string()));
                    true
                }
                None => {
                    self.step(QueryState::close);
                    true
                }
            };
            if finished {
                break;
            }
        }

        info!(request = %self.request_id, "Consulta finalizada");
        self.snapshot()
    }

    /// Aplica una transición y propaga sus efectos. Devuelve `true` si la
    /// petición ya no debe leer más frames (terminal o reemplazada).
    ///
    /// `shared` se mantiene tomado hasta haber reconciliado y notificado:
    /// un `start` concurrente no puede reemplazar la petición a mitad de
    /// camino. Orden de locks: `shared` → conversación.
    fn step(&self, transition: impl FnOnce(&mut QueryState) -> Vec<QueryUpdate>) -> bool {
        let mut shared = lock(&self.shared);
        if shared.query.request_id != Some(self.request_id) {
            debug!(request = %self.request_id, "Frame de una petición reemplazada; se descarta");
            return true;
        }
        let updates = transition(&mut shared.query);
        if let Some(session_id) = updates.iter().find_map(|u| match u {
            QueryUpdate::SessionBound(id) => Some(id.clone()),
            _ => None,
        }) {
            shared.session_id = Some(session_id);
        }
        let finished = shared.query.phase.is_terminal();

        if !updates.is_empty() {
            let mut conversation = self.conversation.lock();
            for update in &updates {
                reconcile(
                    &mut conversation,
                    self.request_id,
                    update,
                    self.options.show_thinking,
                );
            }
        }

        if let Some(observer) = &self.observer {
            for update in updates {
                // Si el receptor desapareció seguimos: la conversación ya está al día.
                let _ = observer.send(update);
            }
        }

        finished
    }

    fn snapshot(&self) -> QueryState {
        lock(&self.shared).query.clone()
    }
}
