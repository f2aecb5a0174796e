//! Identificadores: `JobId` (derivado de contenido), `SessionId` (aleatorio)
//! y `RecordKey` (par que identifica un registro).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::JOB_ID_LEN;
use crate::errors::{DispatchError, DispatchResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Valida formato: `JOB_ID_LEN` caracteres hex en minúsculas.
    pub fn parse(raw: &str) -> DispatchResult<Self> {
        let ok = raw.len() == JOB_ID_LEN && raw.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !ok {
            return Err(DispatchError::RequestNotUnderstood(format!("malformed job id '{raw}'")));
        }
        Ok(Self(raw.to_string()))
    }

    /// Recorta un digest hex completo a la longitud de JobID.
    pub(crate) fn from_digest(digest: &str) -> Self {
        Self(digest.chars().take(JOB_ID_LEN).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Acepta tokens de cliente: 1..=64 chars alfanuméricos, `-` o `_`. Se
    /// usan como componente de ruta en el store de archivos.
    pub fn parse(raw: &str) -> DispatchResult<Self> {
        let ok = !raw.is_empty()
                 && raw.len() <= 64
                 && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(DispatchError::RequestNotUnderstood(format!("malformed session id '{raw}'")));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clave de un `JobRecord`: (SessionID, JobID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub session_id: SessionId,
    pub job_id: JobId,
}

impl RecordKey {
    pub fn new(session_id: SessionId, job_id: JobId) -> Self {
        Self { session_id, job_id }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.job_id)
    }
}
