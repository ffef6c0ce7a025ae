//! Preparación de un lote de ingesta: rutas del sistema de archivos →
//! ficheros en memoria con su tipo MIME, listos para el multipart.

use std::path::{Path, PathBuf};

use mime_guess::MimeGuess;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ClientError;

/// Fichero a subir como parte `files` del multipart.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let mime = MimeGuess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        Self { name, mime, bytes }
    }

    pub async fn from_path(path: &Path) -> Result<Self, ClientError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Ok(Self::from_bytes(name, bytes))
    }
}

/// Lote enviado a `POST /api/ingest/contextual/batch`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestBatch {
    pub files: Vec<UploadFile>,
    pub user_instructions: Option<String>,
}

impl IngestBatch {
    pub fn new(files: Vec<UploadFile>, user_instructions: Option<String>) -> Self {
        Self {
            files,
            user_instructions: user_instructions.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Lee los ficheros indicados; los directorios se recorren recursivamente.
    pub async fn from_paths(
        paths: &[PathBuf],
        user_instructions: Option<String>,
    ) -> Result<Self, ClientError> {
        let mut files = Vec::new();
        for path in collect_upload_paths(paths) {
            files.push(UploadFile::from_path(&path).await?);
        }
        if files.is_empty() {
            return Err(ClientError::EmptyBatch);
        }
        info!("Lote preparado con {} ficheros", files.len());
        Ok(Self::new(files, user_instructions))
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.bytes.len()).sum()
    }
}

/// Expande directorios a sus ficheros (sin ocultos) en orden estable.
pub fn collect_upload_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            found.sort();
            debug!("{} ficheros encontrados en {}", found.len(), path.display());
            out.extend(found);
        } else {
            out.push(path.clone());
        }
    }
    out
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}
