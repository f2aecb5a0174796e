//! Vista de sólo lectura para el colaborador de garbage collection.
//!
//! El núcleo nunca borra registros; expone creación, última modificación,
//! expiración de la credencial embebida y estado, y la política de borrado
//! queda fuera.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::DispatchResult;
use crate::model::{JobStatus, RecordKey};
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordAgeInfo {
    pub key: RecordKey,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub credential_expires_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub aliased: bool,
}

impl RecordAgeInfo {
    /// La credencial embebida ya no es válida en `now`.
    pub fn credential_expired(&self, now: DateTime<Utc>) -> bool {
        self.credential_expires_at.is_some_and(|exp| exp <= now)
    }
}

pub fn inspect_record(store: &dyn JobStore, key: &RecordKey) -> DispatchResult<RecordAgeInfo> {
    let meta = store.read_meta(key)?;
    let status = store.read_status(key)?;
    let last_progress = store.list_progress(key)?.last().map(|p| p.at);
    let last_modified = [Some(meta.created_at), Some(status.updated_at), last_progress].into_iter()
                                                                                      .flatten()
                                                                                      .max()
                                                                                      .unwrap_or(meta.created_at);
    Ok(RecordAgeInfo { key: key.clone(),
                       created_at: meta.created_at,
                       last_modified,
                       credential_expires_at: meta.credential_expires_at,
                       status: status.status,
                       aliased: meta.is_aliased() })
}

/// Inspecciona todos los registros; los ilegibles se omiten con aviso.
pub fn list_records(store: &dyn JobStore) -> DispatchResult<Vec<RecordAgeInfo>> {
    let mut out = vec![];
    for key in store.list_keys()? {
        match inspect_record(store, &key) {
            Ok(info) => out.push(info),
            Err(e) => log::warn!("gc: skipping unreadable record key={key} err={}", e.debug_message()),
        }
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(out)
}
