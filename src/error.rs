//! Taxonomía de errores del cliente.

use std::time::Duration;

/// Error único que los controladores exponen hacia fuera.
///
/// Los fallos de transporte, los errores reportados por el backend y los
/// problemas de configuración terminan aquí; los frames mal formados nunca
/// llegan a convertirse en `ClientError` (se descartan en el decodificador).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Respuesta no-2xx al abrir un stream o en una llamada CRUD.
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// El backend respondió correctamente pero informó de un fallo
    /// (`success: false`, frame `phase: error`, ...).
    #[error("{0}")]
    Backend(String),

    #[error("no files to upload")]
    EmptyBatch,

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("invalid response from {endpoint}: {source}")]
    InvalidResponse {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// `true` si el fallo ocurrió antes o durante el transporte (no es un
    /// error lógico del backend).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Status { .. } | Self::Network(_) | Self::IdleTimeout(_) | Self::Io(_)
        )
    }
}
