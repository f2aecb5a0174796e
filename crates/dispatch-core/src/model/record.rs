//! Documentos persistidos de un `JobRecord`.
//!
//! Layout por registro: meta, snapshot de parámetros, documento de estado,
//! log de progreso (append-only), output actual + snapshots rotados, e
//! historial de notificaciones por canal.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobStatus, RecordKey, UserIdentity};

/// Metadatos del registro: creación, alias activo e identidad de origen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub key: RecordKey,
    pub created_at: DateTime<Utc>,
    /// Registro fuente mientras este registro está redirigido.
    pub alias_of: Option<RecordKey>,
    /// Sujeto de la identidad que creó el registro (None = público).
    pub identity_subject: Option<String>,
    /// Expiración de la credencial embebida (para GC externo).
    pub credential_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_email: Option<String>,
    /// Claims ya verificados del creador; las notificaciones disparadas por
    /// callbacks del backend leen de aquí política y destinatarios.
    #[serde(default)]
    pub claims: Value,
}

impl RecordMeta {
    pub fn new(key: RecordKey, created_at: DateTime<Utc>) -> Self {
        Self { key,
               created_at,
               alias_of: None,
               identity_subject: None,
               credential_expires_at: None,
               owner_email: None,
               claims: Value::Null }
    }

    pub fn for_identity(key: RecordKey, created_at: DateTime<Utc>, identity: &UserIdentity) -> Self {
        Self { identity_subject: identity.subject.clone(),
               credential_expires_at: identity.expires_at,
               owner_email: identity.email.clone(),
               claims: identity.claims.clone(),
               ..Self::new(key, created_at) }
    }

    /// Identidad del creador reconstruida desde lo persistido.
    pub fn identity(&self) -> UserIdentity {
        UserIdentity { subject: self.identity_subject.clone(),
                       email: self.owner_email.clone(),
                       roles: vec![],
                       expires_at: self.credential_expires_at,
                       claims: self.claims.clone() }
    }

    pub fn is_aliased(&self) -> bool {
        self.alias_of.is_some()
    }
}

/// Documento de estado actual ("last write wins").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub status: JobStatus,
    /// Número de intento de despacho; cada reenvío lo incrementa.
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
    /// Momento del despacho del intento actual.
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: Value,
}

impl StatusDocument {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { status: JobStatus::New,
               attempt: 0,
               updated_at: now,
               submitted_at: None,
               details: Value::Null }
    }

    /// Copia con nuevo estado y sello de tiempo.
    pub fn advanced(&self, status: JobStatus, now: DateTime<Utc>, details: Value) -> Self {
        Self { status,
               attempt: self.attempt,
               updated_at: now,
               submitted_at: self.submitted_at,
               details }
    }
}

/// Entrada del log de progreso (nunca se descarta).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub details: Value,
}

/// Output cacheado. Los anteriores se rotan a un log con su sello de tiempo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub written_at: DateTime<Utc>,
    pub output: Value,
}
