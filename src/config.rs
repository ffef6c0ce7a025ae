//! Carga y gestión de configuración del cliente (backend + streaming).

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Configuración completa del cliente.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    /// Número de sesiones a listar.
    pub session_limit: usize,
    pub active_only: bool,
    /// Materializa el razonamiento de la validación como entrada provisional.
    pub show_thinking: bool,
    /// Timeout de las llamadas CRUD. Los streams SSE no tienen timeout global.
    pub request_timeout: Duration,
    /// Tiempo máximo sin datos en un stream; `None` = esperar indefinidamente.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            session_limit: 20,
            active_only: false,
            show_thinking: false,
            request_timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let api_url = lookup("MIRAS_API_URL").unwrap_or(defaults.api_url);
        Url::parse(&api_url).with_context(|| format!("MIRAS_API_URL no es una URL válida: {api_url}"))?;

        let session_limit = match lookup("MIRAS_SESSION_LIMIT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("MIRAS_SESSION_LIMIT inválido: {raw}"))?,
            None => defaults.session_limit,
        };

        let active_only = match lookup("MIRAS_ACTIVE_ONLY") {
            Some(raw) => parse_flag("MIRAS_ACTIVE_ONLY", &raw)?,
            None => defaults.active_only,
        };

        let show_thinking = match lookup("MIRAS_SHOW_THINKING") {
            Some(raw) => parse_flag("MIRAS_SHOW_THINKING", &raw)?,
            None => defaults.show_thinking,
        };

        let request_timeout = match lookup("MIRAS_REQUEST_TIMEOUT_SECS") {
            Some(raw) => parse_secs("MIRAS_REQUEST_TIMEOUT_SECS", &raw)?,
            None => defaults.request_timeout,
        };

        let idle_timeout = lookup("MIRAS_IDLE_TIMEOUT_SECS")
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_secs("MIRAS_IDLE_TIMEOUT_SECS", &raw))
            .transpose()?;

        Ok(Self {
            api_url,
            session_limit,
            active_only,
            show_thinking,
            request_timeout,
            idle_timeout,
        })
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{key} debe ser true/false, no '{other}'")),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{key} inválido: {raw}"))?;
    if secs == 0 {
        return Err(anyhow!("{key} debe ser mayor que cero"));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ClientConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(load(&[]).unwrap(), ClientConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = load(&[
            ("MIRAS_API_URL", "https://miras.example.com/"),
            ("MIRAS_SESSION_LIMIT", "5"),
            ("MIRAS_ACTIVE_ONLY", "yes"),
            ("MIRAS_SHOW_THINKING", "TRUE"),
            ("MIRAS_REQUEST_TIMEOUT_SECS", "12"),
            ("MIRAS_IDLE_TIMEOUT_SECS", "90"),
        ])
        .unwrap();
        assert_eq!(cfg.api_url, "https://miras.example.com/");
        assert_eq!(cfg.session_limit, 5);
        assert!(cfg.active_only);
        assert!(cfg.show_thinking);
        assert_eq!(cfg.request_timeout, Duration::from_secs(12));
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(load(&[("MIRAS_API_URL", "not a url")]).is_err());
        assert!(load(&[("MIRAS_ACTIVE_ONLY", "maybe")]).is_err());
        assert!(load(&[("MIRAS_IDLE_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("MIRAS_SESSION_LIMIT", "-1")]).is_err());
    }
}
