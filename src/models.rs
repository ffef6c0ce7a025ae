//! Modelos de dominio: entradas de la conversación y snapshots del backend
//! (sesiones, documentos, citas, validaciones).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identificador de una petición (consulta o lote de ingesta).
/// Cada entrada de la conversación queda etiquetada con la petición que la originó.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

/// Gravedad de una entrada. La capa de presentación decide la decoración.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Error,
}

/// Entrada de la conversación. `id` es la clave de fusión.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub enhanced_query: Option<String>,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub severity: Severity,
    pub request_id: Option<RequestId>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            enhanced_query: None,
            session_id: None,
            is_error: false,
            severity: Severity::Info,
            request_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn owned_by(mut self, request: RequestId) -> Self {
        self.request_id = Some(request);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self.is_error = severity == Severity::Error;
        self
    }

    pub fn belongs_to(&self, request: RequestId) -> bool {
        self.request_id == Some(request)
    }
}

/// Sesión de conversación tal y como la lista el backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub started_at: String,
    pub last_message_at: String,
    pub message_count: u32,
    pub is_active: bool,
}

/// Documento indexado en el datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub size_formatted: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRecord {
    /// El estado es opaco; sólo distinguimos los que siguen en proceso.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status.to_lowercase().as_str(),
            "processing" | "pending" | "uploading"
        )
    }
}

/// Respuesta de `GET /api/documents`.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentList {
    pub success: bool,
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
    #[serde(default)]
    pub total: u64,
    pub error: Option<String>,
}

/// Fila del historial de una sesión: una pregunta y su respuesta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExchange {
    pub id: String,
    pub query: String,
    pub enhanced_query: Option<String>,
    pub response: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(deserialize_with = "ordinal")]
    pub number: u32,
    #[serde(default = "unknown_doc")]
    pub doc_name: String,
    #[serde(default = "unknown_page", deserialize_with = "text_or_number")]
    pub page: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCheck {
    #[serde(default)]
    pub fact: String,
    /// Los hechos vienen de JSON generado por el LLM; sin campo = no verificado.
    #[serde(default)]
    pub verified: bool,
    #[serde(default, deserialize_with = "optional_text_or_number")]
    pub page_found: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub query_answered: bool,
    #[serde(default)]
    pub facts_checked: Vec<FactCheck>,
    pub verified_facts: Option<u32>,
    pub total_facts: Option<u32>,
    pub accuracy_score: Option<f64>,
}

impl ValidationResult {
    /// Número de hechos verificados; usa el recuento del backend si lo hay.
    pub fn verified_count(&self) -> usize {
        self.verified_facts
            .map(|n| n as usize)
            .unwrap_or_else(|| self.facts_checked.iter().filter(|f| f.verified).count())
    }
}

fn unknown_doc() -> String {
    "Unknown".to_string()
}

fn unknown_page() -> String {
    "N/A".to_string()
}

// El backend serializa los números de cita como texto ("1") y las páginas
// como número o "N/A"; aceptamos ambas formas.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Int(i64),
    Float(f64),
}

impl TextOrNumber {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
        }
    }
}

fn ordinal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let raw = TextOrNumber::deserialize(deserializer)?.into_text();
    raw.trim()
        .parse::<u32>()
        .map_err(|_| serde::de::Error::custom(format!("invalid citation number: {raw}")))
}

fn text_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(TextOrNumber::deserialize(deserializer)?.into_text())
}

fn optional_text_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<TextOrNumber>::deserialize(deserializer)?
        .map(TextOrNumber::into_text)
        .filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn citation_accepts_textual_number_and_page() {
        let citation: Citation =
            serde_json::from_value(json!({"number": "2", "doc_name": "a.pdf", "page": 7}))
                .unwrap();
        assert_eq!(citation.number, 2);
        assert_eq!(citation.page, "7");

        let citation: Citation = serde_json::from_value(json!({"number": 3})).unwrap();
        assert_eq!(citation.doc_name, "Unknown");
        assert_eq!(citation.page, "N/A");
    }

    #[test]
    fn document_record_reads_wire_field_names() {
        let doc: DocumentRecord = serde_json::from_value(json!({
            "id": "d1",
            "name": "report.pdf",
            "type": "pdf",
            "size": 2048,
            "size_formatted": "2.0 KB",
            "status": "processing",
            "created_at": "2024-05-01T10:00:00",
            "updated_at": "2024-05-01T10:00:00"
        }))
        .unwrap();
        assert_eq!(doc.doc_type, "pdf");
        assert_eq!(doc.size_bytes, 2048);
        assert!(doc.is_pending());
    }

    #[test]
    fn validation_counts_verified_facts_when_backend_omits_totals() {
        let result: ValidationResult = serde_json::from_value(json!({
            "query_answered": true,
            "facts_checked": [
                {"fact": "a", "verified": true, "page_found": 3},
                {"fact": "b", "verified": false, "page_found": ""}
            ]
        }))
        .unwrap();
        assert_eq!(result.verified_count(), 1);
        assert_eq!(result.facts_checked[0].page_found.as_deref(), Some("3"));
        assert_eq!(result.facts_checked[1].page_found, None);
    }

    #[test]
    fn facts_without_verified_flag_count_as_unverified() {
        let result: ValidationResult = serde_json::from_value(json!({
            "query_answered": true,
            "facts_checked": [
                {"fact": "Revenue grew", "page_found": null},
                {"fact": "Costs fell", "verified": true},
                {"verified": true}
            ]
        }))
        .unwrap();
        assert_eq!(result.facts_checked.len(), 3);
        assert!(!result.facts_checked[0].verified);
        assert_eq!(result.facts_checked[2].fact, "");
        assert_eq!(result.verified_count(), 2);
    }

    #[test]
    fn error_severity_flags_message() {
        let msg = Message::new(MessageKind::System, "boom").with_severity(Severity::Error);
        assert!(msg.is_error);
    }
}
