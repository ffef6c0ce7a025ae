//! Cliente de streaming para el backend de inteligencia documental Miras.
//!
//! Flujo de datos:
//!   bytes de red → `decoder` → eventos tipados → controlador de stream
//!   (`query_stream` / `ingest_stream`) → `reconciler` → estado observable.

pub mod backend;
pub mod config;
pub mod decoder;
pub mod directory;
pub mod error;
pub mod ingest_stream;
pub mod models;
pub mod query_stream;
pub mod reconciler;
pub mod upload;
pub mod workspace;

pub use backend::{Backend, ByteStream, HttpBackend, SearchRequest};
pub use config::ClientConfig;
pub use error::ClientError;
pub use ingest_stream::{IngestReport, IngestStreamController, IngestUpdate};
pub use query_stream::{QueryPhase, QueryState, QueryStreamController, QueryUpdate, SessionChoice};
pub use reconciler::{ConversationHandle, ConversationReconciler};
pub use workspace::Workspace;
