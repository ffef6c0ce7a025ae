//! Decodificador de frames SSE.
//!
//! Convierte los trozos de bytes que entrega el transporte en líneas de
//! texto completas y, a partir de las líneas `data: `, en eventos JSON
//! tipados. Es tolerante a cortes arbitrarios entre trozos: caracteres
//! multibyte partidos, líneas a medias y payloads JSON incompletos.

use std::collections::VecDeque;

use futures::{stream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Prefijo de las líneas que transportan un payload.
pub const DATA_PREFIX: &str = "data: ";

/// Estado incremental del decodificador. Se crea uno nuevo por petición.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes que todavía no forman un carácter UTF-8 completo.
    pending: Vec<u8>,
    /// Texto decodificado a la espera del siguiente `\n`.
    partial: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade un trozo y devuelve, en orden, las líneas que ya están completas.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        // `partial` nunca contiene '\n' aquí: basta con mirar el texto nuevo.
        let mut scan_from = self.partial.len();
        self.decode_pending();

        let mut lines = Vec::new();
        while let Some(offset) = self.partial[scan_from..].find('\n') {
            let pos = scan_from + offset;
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
            scan_from = 0;
        }
        lines
    }

    /// Vacía el fragmento retenido cuando el transporte ha terminado.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.partial.push_str(&tail);
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches('\r');
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn decode_pending(&mut self) {
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    self.partial.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = start + err.valid_up_to();
                    // `valid_up_to` garantiza que este rango es UTF-8 válido.
                    self.partial
                        .push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            self.partial.push(char::REPLACEMENT_CHARACTER);
                            start = valid + bad;
                        }
                        // Secuencia incompleta: esperamos al siguiente trozo.
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }
}

/// Devuelve el payload de una línea `data: `; cualquier otra línea
/// (keep-alive, comentario, línea vacía) se ignora.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
}

/// Parsea un payload JSON. Un frame mal formado se descarta con un aviso y
/// nunca interrumpe el stream.
pub fn parse_frame<T: DeserializeOwned>(payload: &str) -> Option<T> {
    match serde_json::from_str::<T>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Frame SSE descartado ({e}): {}", preview(payload));
            None
        }
    }
}

/// Decodifica de una vez una secuencia de trozos ya recibidos.
pub fn decode_chunks<T, B>(chunks: impl IntoIterator<Item = B>) -> Vec<T>
where
    T: DeserializeOwned,
    B: AsRef<[u8]>,
{
    let mut decoder = FrameDecoder::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        lines.extend(decoder.push(chunk.as_ref()));
    }
    lines.extend(decoder.finish());
    lines
        .iter()
        .filter_map(|line| data_payload(line))
        .filter_map(parse_frame)
        .collect()
}

struct DecodeState<S, T> {
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<T>,
    done: bool,
}

impl<S, T: DeserializeOwned> DecodeState<S, T> {
    fn enqueue(&mut self, lines: Vec<String>) {
        for line in lines {
            if let Some(event) = data_payload(&line).and_then(parse_frame::<T>) {
                self.ready.push_back(event);
            } else if !line.is_empty() && !line.starts_with(DATA_PREFIX) {
                debug!("Línea SSE ignorada: {}", preview(&line));
            }
        }
    }
}

/// Adapta un stream de bytes a un stream perezoso de eventos tipados.
///
/// El orden de llegada se conserva. El stream termina cuando termina el
/// transporte; un error de transporte se emite una única vez y cierra la
/// secuencia.
pub fn decode_events<T, S, B>(inner: S) -> impl Stream<Item = Result<T, ClientError>>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<B, ClientError>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        inner,
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.decoder.push(chunk.as_ref());
                    state.enqueue(lines);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    let rest: Vec<String> = state.decoder.finish().into_iter().collect();
                    state.enqueue(rest);
                }
            }
        }
    })
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
