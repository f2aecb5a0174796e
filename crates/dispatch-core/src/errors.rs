//! Errores del núcleo de despacho.
//!
//! Cada variante separa el mensaje que puede verse desde fuera (`public_message`)
//! del detalle interno (`debug_message`), que sólo va a logs y alertas.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DispatchError {
    /// Parámetros mal formados, faltantes o flags contradictorios.
    #[error("request not understood: {0}")]
    RequestNotUnderstood(String),
    /// JobID, parámetros o identidad no concuerdan. `debug` nunca sale hacia
    /// el cliente.
    #[error("authorization error: {message}")]
    Authorization { message: String, debug: String },
    /// Se consultó trabajo inexistente sin pedir "new".
    #[error("no record found for job {job_id}")]
    NoRecordFound { job_id: String },
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    /// Lectura de output concurrente con una escritura (transitorio).
    #[error("output snapshot corrupt: {0}")]
    OutputCorrupt(String),
    #[error("backend communication failed: {0}")]
    TransientBackend(String),
    /// Más de un registro canónico o estado persistido ilegible.
    #[error("store consistency fault on {key}: {detail}")]
    StoreConsistency { key: String, detail: String },
    #[error("storage: {0}")]
    Storage(String),
}

/// Clasificación gruesa usada por logging, alertas y persistencia.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Authorization,
    Transient,
    Permanent,
}

pub fn classify_error(err: &DispatchError) -> ErrorClass {
    match err {
        DispatchError::RequestNotUnderstood(_) | DispatchError::NoRecordFound { .. } => ErrorClass::Validation,
        DispatchError::Authorization { .. } => ErrorClass::Authorization,
        DispatchError::OutputCorrupt(_) | DispatchError::TransientBackend(_) | DispatchError::Storage(_) => {
            ErrorClass::Transient
        }
        DispatchError::AlreadyExists(_) | DispatchError::StoreConsistency { .. } => ErrorClass::Permanent,
    }
}

impl DispatchError {
    pub fn authorization(message: impl Into<String>, debug: impl Into<String>) -> Self {
        Self::Authorization { message: message.into(),
                              debug: debug.into() }
    }

    pub fn consistency(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StoreConsistency { key: key.into(),
                                 detail: detail.into() }
    }

    /// Mensaje corto apto para el llamador. Para errores de autorización y de
    /// consistencia no incluye ningún valor interno.
    pub fn public_message(&self) -> String {
        match self {
            Self::Authorization { message, .. } => message.clone(),
            Self::StoreConsistency { .. } => "internal consistency fault, reported to operators".to_string(),
            Self::Storage(_) => "storage unavailable, retry later".to_string(),
            other => other.to_string(),
        }
    }

    /// Mensaje completo para logs del servidor.
    pub fn debug_message(&self) -> String {
        match self {
            Self::Authorization { message, debug } => format!("{message} [{debug}]"),
            other => other.to_string(),
        }
    }

    /// Errores que además se envían al colector de alertas operativas.
    pub fn is_alertable(&self) -> bool {
        matches!(self, Self::Authorization { .. } | Self::StoreConsistency { .. })
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_public_message_hides_debug() {
        let e = DispatchError::authorization("job id does not match request", "expected=abc got=def params={x:1}");
        assert_eq!(e.public_message(), "job id does not match request");
        assert!(e.debug_message().contains("params={x:1}"));
        assert!(e.is_alertable());
        assert_eq!(classify_error(&e), ErrorClass::Authorization);
    }

    #[test]
    fn consistency_fault_is_redacted_and_permanent() {
        let e = DispatchError::consistency("job/abc", "2 live records");
        assert!(!e.public_message().contains("2 live records"));
        assert_eq!(classify_error(&e), ErrorClass::Permanent);
        assert!(e.is_alertable());
    }

    #[test]
    fn output_corrupt_is_transient() {
        let e = DispatchError::OutputCorrupt("truncated".into());
        assert_eq!(classify_error(&e), ErrorClass::Transient);
        assert!(!e.is_alertable());
    }
}
