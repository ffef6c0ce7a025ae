//! Reconciliador de la conversación.
//!
//! Es el único dueño de la lista ordenada de entradas. Los controladores de
//! streaming no tocan la lista directamente: le piden que aplique una regla
//! concreta (reemplazo in situ, inserción tras otra entrada, append). Cada
//! entrada lleva la petición que la originó, de modo que las fusiones
//! apuntan a la entrada correcta aunque dos streams se intercalen.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::models::{
    Citation, Message, MessageKind, RequestId, Severity, StoredExchange, ValidationResult,
};

/// Id sintético de la entrada derivada con las citas.
pub const CITATIONS_ID: &str = "citations";
/// Id sintético de la entrada derivada con la validación (y su "thinking").
pub const VALIDATION_ID: &str = "validation";

#[derive(Debug, Default)]
pub struct ConversationReconciler {
    messages: Vec<Message>,
}

impl ConversationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Regla 1: la entrada del usuario se añade en el acto, antes de la red.
    pub fn push_user(
        &mut self,
        request: RequestId,
        content: &str,
        session_id: Option<String>,
    ) -> String {
        let mut message = Message::new(MessageKind::User, content).owned_by(request);
        message.session_id = session_id;
        self.append(message)
    }

    /// Regla 2: el buffer ya es acumulativo, así que se reemplaza el
    /// contenido de la entrada del asistente de esa petición; si todavía no
    /// existe, se crea.
    pub fn apply_answer(&mut self, request: RequestId, buffer: &str) -> String {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.kind == MessageKind::Assistant && m.belongs_to(request))
        {
            existing.content.clear();
            existing.content.push_str(buffer);
            return existing.id.clone();
        }

        let mut message = Message::new(MessageKind::Assistant, buffer).owned_by(request);
        message.session_id = self.session_of(request);
        self.append(message)
    }

    /// Regla 3: la consulta mejorada se adjunta a la entrada de usuario de la
    /// petición. Si esa petición no tiene entrada de usuario se usa la más
    /// reciente.
    pub fn backfill_enhanced_query(&mut self, request: RequestId, enhanced: &str) -> bool {
        let position = self
            .messages
            .iter()
            .rposition(|m| m.kind == MessageKind::User && m.belongs_to(request))
            .or_else(|| {
                self.messages
                    .iter()
                    .rposition(|m| m.kind == MessageKind::User)
            });

        match position {
            Some(idx) => {
                self.messages[idx].enhanced_query = Some(enhanced.to_string());
                true
            }
            None => {
                warn!("Consulta mejorada sin entrada de usuario a la que adjuntarla");
                false
            }
        }
    }

    /// Regla 4: una única entrada de citas, colocada justo después de la
    /// respuesta de la petición activa.
    pub fn place_citations(&mut self, request: RequestId, citations: &[Citation]) {
        self.remove(CITATIONS_ID);
        if citations.is_empty() {
            return;
        }

        let message = Message::new(MessageKind::System, render_citations(citations))
            .with_id(CITATIONS_ID)
            .owned_by(request);

        let anchor = self
            .messages
            .iter()
            .rposition(|m| m.kind == MessageKind::Assistant && m.belongs_to(request))
            .or_else(|| {
                self.messages
                    .iter()
                    .rposition(|m| m.kind == MessageKind::Assistant)
            });

        match anchor {
            Some(idx) => self.messages.insert(idx + 1, message),
            None => self.messages.push(message),
        }
    }

    /// Muestra el razonamiento en curso bajo el id de la validación; el
    /// resultado final lo sustituye.
    pub fn show_thinking(&mut self, request: RequestId, thinking: &str) {
        let content = format!("Validating...\n{thinking}");
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == VALIDATION_ID) {
            existing.content = content;
            existing.request_id = Some(request);
            return;
        }
        self.messages.push(
            Message::new(MessageKind::System, content)
                .with_id(VALIDATION_ID)
                .owned_by(request),
        );
    }

    /// Regla 5: cualquier entrada previa con el id de validación se elimina
    /// antes de añadir la nueva.
    pub fn place_validation(&mut self, request: RequestId, result: &ValidationResult) {
        self.remove(VALIDATION_ID);
        let severity = if result.query_answered {
            Severity::Success
        } else {
            Severity::Info
        };
        let mut message = Message::new(MessageKind::System, render_validation(result))
            .with_id(VALIDATION_ID)
            .owned_by(request);
        message.severity = severity;
        self.messages.push(message);
    }

    /// Asocia la sesión a todas las entradas de la petición.
    pub fn bind_session(&mut self, request: RequestId, session_id: &str) {
        for message in self.messages.iter_mut().filter(|m| m.belongs_to(request)) {
            message.session_id = Some(session_id.to_string());
        }
    }

    /// Entrada de error independiente, nunca fusionada con otra.
    pub fn push_error(&mut self, request: Option<RequestId>, text: &str) -> String {
        let mut message =
            Message::new(MessageKind::System, text).with_severity(Severity::Error);
        message.request_id = request;
        self.append(message)
    }

    /// Entrada provisional que más tarde se muta con `update_status`.
    pub fn push_status(&mut self, request: RequestId, text: &str) -> String {
        self.append(Message::new(MessageKind::System, text).owned_by(request))
    }

    pub fn update_status(&mut self, id: &str, text: &str, severity: Severity) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.content = text.to_string();
                message.severity = severity;
                message.is_error = severity == Severity::Error;
                true
            }
            None => false,
        }
    }

    pub fn push_notice(
        &mut self,
        request: RequestId,
        kind: MessageKind,
        text: &str,
        severity: Severity,
    ) -> String {
        self.append(
            Message::new(kind, text)
                .owned_by(request)
                .with_severity(severity),
        )
    }

    /// Regla 6: el historial reemplaza la lista completa, un par
    /// usuario/asistente por cada intercambio almacenado.
    pub fn load_history(&mut self, session_id: &str, exchanges: &[StoredExchange]) {
        self.messages = exchanges
            .iter()
            .flat_map(|exchange| {
                let mut user = Message::new(MessageKind::User, exchange.query.as_str());
                user.id = format!("{}-query", exchange.id);
                user.enhanced_query = exchange.enhanced_query.clone();
                user.session_id = Some(session_id.to_string());

                let mut assistant =
                    Message::new(MessageKind::Assistant, exchange.response.as_str());
                assistant.id = format!("{}-response", exchange.id);
                assistant.session_id = Some(session_id.to_string());

                [user, assistant]
            })
            .collect();
        debug!(
            "Historial de la sesión {session_id} cargado: {} entradas",
            self.messages.len()
        );
    }

    /// Regla 7.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn session_of(&self, request: RequestId) -> Option<String> {
        self.messages
            .iter()
            .filter(|m| m.belongs_to(request))
            .find_map(|m| m.session_id.clone())
    }

    fn remove(&mut self, id: &str) {
        self.messages.retain(|m| m.id != id);
    }

    fn append(&mut self, message: Message) -> String {
        let id = message.id.clone();
        self.remove(&id);
        self.messages.push(message);
        id
    }
}

/// Texto de la entrada de citas.
pub fn render_citations(citations: &[Citation]) -> String {
    let mut sorted: Vec<&Citation> = citations.iter().collect();
    sorted.sort_by_key(|c| c.number);
    let lines: Vec<String> = sorted
        .iter()
        .map(|c| format!("[{}] {} (page {})", c.number, c.doc_name, c.page))
        .collect();
    format!("Sources:\n{}", lines.join("\n"))
}

/// Texto determinista de la entrada de validación.
pub fn render_validation(result: &ValidationResult) -> String {
    let mut lines = vec!["Validation Results".to_string()];
    lines.push(if result.query_answered {
        "Query answered: yes".to_string()
    } else {
        "Query answered: no".to_string()
    });
    for fact in &result.facts_checked {
        let marker = if fact.verified { "[verified]" } else { "[unverified]" };
        match &fact.page_found {
            Some(page) => lines.push(format!("{marker} {} (page {page})", fact.fact)),
            None => lines.push(format!("{marker} {}", fact.fact)),
        }
    }
    lines.join("\n")
}

/// Handle compartido. Cada regla se aplica con el lock tomado, lo que
/// serializa las mutaciones de controladores concurrentes. El lock nunca se
/// mantiene a través de un `.await`.
#[derive(Debug, Clone, Default)]
pub struct ConversationHandle(Arc<Mutex<ConversationReconciler>>);

impl ConversationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ConversationReconciler> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages().to_vec()
    }
}
