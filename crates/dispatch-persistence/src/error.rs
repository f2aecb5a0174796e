//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y luego al
//! `DispatchError` del núcleo.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use dispatch_core::DispatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("row decode: {0}")]
    Decode(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Decode(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            DieselError::RollbackErrorOnCommit { rollback_error, commit_error } => {
                Self::Unknown(format!("rollback={rollback_error}; commit={commit_error}"))
            }
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<PersistenceError> for DispatchError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::UniqueViolation(m) => DispatchError::AlreadyExists(m),
            PersistenceError::Decode(m) => DispatchError::consistency("postgres", m),
            other => DispatchError::Storage(format!("postgres: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::{classify_error, ErrorClass};

    #[test]
    fn storage_faults_stay_transient() {
        let e: DispatchError = PersistenceError::TransientIo("pool timeout".into()).into();
        assert_eq!(classify_error(&e), ErrorClass::Transient);
        assert!(!e.public_message().contains("pool timeout"));
    }

    #[test]
    fn undecodable_rows_are_consistency_faults() {
        let e: DispatchError = PersistenceError::Decode("missing field `status`".into()).into();
        assert!(matches!(e, DispatchError::StoreConsistency { .. }));
        assert!(e.is_alertable());
    }
}
