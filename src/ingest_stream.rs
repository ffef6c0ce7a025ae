//! Controlador del stream de ingesta por lotes.
//!
//! Un `progress` crea una entrada provisional; el `file_complete` que le
//! corresponde la muta en el sitio, de modo que cada fichero se ve como una
//! sola línea de estado que se "resuelve". Los `file_failed` siempre crean
//! una entrada nueva. Al terminar, con o sin fallos, se refresca el
//! directorio de documentos.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{
    backend::Backend,
    decoder::decode_events,
    directory::Directory,
    models::{MessageKind, RequestId, Severity},
    reconciler::{ConversationHandle, ConversationReconciler},
    upload::IngestBatch,
};

/// Marcadores decorativos que el backend incrusta en sus mensajes.
const DECORATIONS: &[&str] = &[
    "✅", "❌", "⚠️", "⚠", "📄", "📝", "📚", "🔄", "⏳", "🎉", "✓", "✗", "\u{fe0f}",
];

/// Frame del stream de ingesta, discriminado por `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    Progress {
        #[serde(default)]
        message: String,
        #[serde(default, alias = "file")]
        filename: Option<String>,
    },
    FileComplete {
        #[serde(default)]
        message: String,
        #[serde(default, alias = "file")]
        filename: Option<String>,
    },
    FileFailed {
        #[serde(default)]
        message: String,
        #[serde(default, alias = "file")]
        filename: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    FileSummary {
        #[serde(default, alias = "file")]
        filename: Option<String>,
        #[serde(default)]
        summary: String,
    },
    BatchComplete,
    #[serde(other)]
    Unknown,
}

/// Cambios observables de una ingesta.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestUpdate {
    Progress(String),
    FileComplete {
        filename: Option<String>,
        message: String,
    },
    FileFailed {
        filename: Option<String>,
        message: String,
    },
    Summary {
        filename: Option<String>,
        summary: String,
    },
    BatchComplete,
    Failed(String),
}

/// Resultado de un lote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub request_id: Option<RequestId>,
    pub processed: Vec<String>,
    pub failed: Vec<String>,
    pub summaries: usize,
    /// Se recibió `batch_complete`.
    pub completed: bool,
    pub error: Option<String>,
}

/// Quita los iconos decorativos; la presentación decide cómo decorar.
pub fn strip_decorations(text: &str) -> String {
    let mut clean = text.to_string();
    for marker in DECORATIONS {
        clean = clean.replace(marker, "");
    }
    clean.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Estado de un lote: entradas provisionales pendientes y recuentos.
#[derive(Debug)]
pub struct IngestTracker {
    request_id: RequestId,
    /// (fichero, id de la entrada provisional)
    placeholders: Vec<(Option<String>, String)>,
    report: IngestReport,
}

impl IngestTracker {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            placeholders: Vec::new(),
            report: IngestReport {
                request_id: Some(request_id),
                ..IngestReport::default()
            },
        }
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    pub fn is_finished(&self) -> bool {
        self.report.completed
    }

    /// Aplica un frame a la conversación. Tras `batch_complete` no se hace nada más.
    pub fn apply(
        &mut self,
        event: IngestEvent,
        conversation: &mut ConversationReconciler,
    ) -> Option<IngestUpdate> {
        if self.report.completed {
            debug!("Frame de ingesta ignorado tras batch_complete: {event:?}");
            return None;
        }

        match event {
            IngestEvent::Progress { message, filename } => {
                let text = non_empty(strip_decorations(&message)).unwrap_or_else(|| {
                    format!("Processing {}...", filename.as_deref().unwrap_or("file"))
                });
                let id = conversation.push_status(self.request_id, &text);
                self.placeholders.push((filename, id));
                Some(IngestUpdate::Progress(text))
            }
            IngestEvent::FileComplete { message, filename } => {
                let text = non_empty(strip_decorations(&message)).unwrap_or_else(|| {
                    format!("Processed {}", filename.as_deref().unwrap_or("file"))
                });
                let mutated = self
                    .take_placeholder(filename.as_deref())
                    .is_some_and(|id| conversation.update_status(&id, &text, Severity::Success));
                if !mutated {
                    conversation.push_notice(
                        self.request_id,
                        MessageKind::System,
                        &text,
                        Severity::Success,
                    );
                }
                if let Some(name) = &filename {
                    self.report.processed.push(name.clone());
                }
                Some(IngestUpdate::FileComplete {
                    filename,
                    message: text,
                })
            }
            IngestEvent::FileFailed {
                message,
                filename,
                error,
            } => {
                let text = non_empty(strip_decorations(&message)).unwrap_or_else(|| {
                    format!(
                        "Failed to process {}: {}",
                        filename.as_deref().unwrap_or("file"),
                        error.as_deref().unwrap_or("unknown error")
                    )
                });
                conversation.push_notice(
                    self.request_id,
                    MessageKind::System,
                    &text,
                    Severity::Error,
                );
                if let Some(name) = &filename {
                    // El aviso de progreso queda como estaba, pero ya no
                    // puede resolverlo un `file_complete` posterior.
                    self.placeholders
                        .retain(|(key, _)| key.as_deref() != Some(name.as_str()));
                    self.report.failed.push(name.clone());
                }
                Some(IngestUpdate::FileFailed {
                    filename,
                    message: text,
                })
            }
            IngestEvent::FileSummary { filename, summary } => {
                let text = match &filename {
                    Some(name) => format!("Summary of {name}:\n{summary}"),
                    None => summary.clone(),
                };
                conversation.push_notice(
                    self.request_id,
                    MessageKind::Assistant,
                    &text,
                    Severity::Info,
                );
                self.report.summaries += 1;
                Some(IngestUpdate::Summary { filename, summary })
            }
            IngestEvent::BatchComplete => {
                self.report.completed = true;
                Some(IngestUpdate::BatchComplete)
            }
            IngestEvent::Unknown => {
                debug!("Tipo de frame de ingesta desconocido");
                None
            }
        }
    }

    /// Una única entrada de error por fallo de transporte o de apertura.
    pub fn fail(&mut self, message: &str, conversation: &mut ConversationReconciler) -> IngestUpdate {
        let text = format!("Upload failed: {message}");
        conversation.push_error(Some(self.request_id), &text);
        self.report.error = Some(message.to_string());
        IngestUpdate::Failed(text)
    }

    fn take_placeholder(&mut self, filename: Option<&str>) -> Option<String> {
        let position = self
            .placeholders
            .iter()
            .rposition(|(key, _)| key.is_none() || filename.is_none() || key.as_deref() == filename)?;
        Some(self.placeholders.remove(position).1)
    }

    fn into_report(self) -> IngestReport {
        self.report
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// Controlador de un lote de ingesta (una instancia por lote).
pub struct IngestStreamController {
    request_id: RequestId,
    backend: Arc<dyn Backend>,
    conversation: ConversationHandle,
    directory: Option<Directory>,
    observer: Option<UnboundedSender<IngestUpdate>>,
}

impl IngestStreamController {
    pub fn new(backend: Arc<dyn Backend>, conversation: ConversationHandle) -> Self {
        Self {
            request_id: RequestId::new(),
            backend,
            conversation,
            directory: None,
            observer: None,
        }
    }

    /// Directorio a refrescar cuando termine el lote.
    pub fn with_directory(mut self, directory: Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_observer(mut self, observer: UnboundedSender<IngestUpdate>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run(self, batch: IngestBatch) -> IngestReport {
        let mut tracker = IngestTracker::new(self.request_id);
        info!(
            request = %self.request_id,
            "Subiendo {} ficheros ({} bytes)",
            batch.files.len(),
            batch.total_bytes()
        );

        match self.backend.open_ingest(batch).await {
            Ok(bytes) => {
                let mut events = Box::pin(decode_events::<IngestEvent, _, _>(bytes));
                while let Some(next) = events.next().await {
                    match next {
                        Ok(event) => {
                            let update = tracker.apply(event, &mut self.conversation.lock());
                            self.notify(update);
                            if tracker.is_finished() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(request = %self.request_id, "Stream de ingesta interrumpido: {e}");
                            let update = tracker.fail(&e.to_string(), &mut self.conversation.lock());
                            self.notify(Some(update));
                            break;
                        }
                    }
                }
                if !tracker.is_finished() && tracker.report().error.is_none() {
                    warn!(request = %self.request_id, "El stream de ingesta se cerró sin batch_complete");
                }
            }
            Err(e) => {
                error!(request = %self.request_id, "No se pudo iniciar la ingesta: {e}");
                let update = tracker.fail(&e.to_string(), &mut self.conversation.lock());
                self.notify(Some(update));
            }
        }

        if let Some(directory) = &self.directory {
            // El fallo ya queda registrado por el directorio.
            let _ = directory.refresh_documents().await;
        }

        let report = tracker.into_report();
        info!(
            request = %self.request_id,
            "Ingesta terminada: {} procesados, {} fallidos",
            report.processed.len(),
            report.failed.len()
        );
        report
    }

    fn notify(&self, update: Option<IngestUpdate>) {
        if let (Some(observer), Some(update)) = (&self.observer, update) {
            let _ = observer.send(update);
        }
    }
}
