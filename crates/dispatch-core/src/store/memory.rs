use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use super::{holder_is_released, DispatchClaim, JobStore};
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{JobId, NotificationEvent, OutputSnapshot, ProgressEntry, RecordKey, RecordMeta, RequestParameters,
                   SessionId, StatusDocument};

/// Contenido de un registro en memoria.
#[derive(Debug, Clone)]
struct RecordSlot {
    meta: RecordMeta,
    params: Option<RequestParameters>,
    status: StatusDocument,
    output: Option<OutputSnapshot>,
    output_log: Vec<OutputSnapshot>,
    progress: Vec<ProgressEntry>,
    history: HashMap<String, Vec<NotificationEvent>>,
}

/// Store en memoria (tests, demo y procesos de una sola instancia).
///
/// `DashMap` particiona por clave, así que operaciones sobre registros
/// distintos no se bloquean entre sí.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: DashMap<RecordKey, RecordSlot>,
    by_job: DashMap<JobId, Vec<SessionId>>,
    claims: DashMap<JobId, RecordKey>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<T>(&self, key: &RecordKey, f: impl FnOnce(&RecordSlot) -> T) -> DispatchResult<T> {
        self.records
            .get(key)
            .map(|slot| f(&slot))
            .ok_or_else(|| not_found(key))
    }

    fn with_slot_mut<T>(&self, key: &RecordKey, f: impl FnOnce(&mut RecordSlot) -> T) -> DispatchResult<T> {
        self.records
            .get_mut(key)
            .map(|mut slot| f(&mut slot))
            .ok_or_else(|| not_found(key))
    }
}

fn not_found(key: &RecordKey) -> DispatchError {
    DispatchError::NoRecordFound { job_id: key.job_id.to_string() }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, meta: &RecordMeta, initial: &StatusDocument) -> DispatchResult<()> {
        match self.records.entry(meta.key.clone()) {
            Entry::Occupied(_) => return Err(DispatchError::AlreadyExists(meta.key.to_string())),
            Entry::Vacant(v) => {
                v.insert(RecordSlot { meta: meta.clone(),
                                      params: None,
                                      status: initial.clone(),
                                      output: None,
                                      output_log: vec![],
                                      progress: vec![],
                                      history: HashMap::new() });
            }
        }
        self.by_job
            .entry(meta.key.job_id.clone())
            .or_default()
            .push(meta.key.session_id.clone());
        debug!("create key={}", meta.key);
        Ok(())
    }

    fn read_meta(&self, key: &RecordKey) -> DispatchResult<RecordMeta> {
        self.with_slot(key, |s| s.meta.clone())
    }

    fn write_meta(&self, meta: &RecordMeta) -> DispatchResult<()> {
        self.with_slot_mut(&meta.key, |s| s.meta = meta.clone())
    }

    fn write_parameters(&self, key: &RecordKey, params: &RequestParameters) -> DispatchResult<()> {
        self.with_slot_mut(key, |s| s.params = Some(params.clone()))
    }

    fn read_parameters(&self, key: &RecordKey) -> DispatchResult<RequestParameters> {
        self.with_slot(key, |s| s.params.clone())?
            .ok_or_else(|| DispatchError::consistency(key.to_string(), "record has no parameters snapshot"))
    }

    fn write_status(&self, key: &RecordKey, doc: &StatusDocument) -> DispatchResult<()> {
        self.with_slot_mut(key, |s| s.status = doc.clone())
    }

    fn read_status(&self, key: &RecordKey) -> DispatchResult<StatusDocument> {
        self.with_slot(key, |s| s.status.clone())
    }

    fn write_output(&self, key: &RecordKey, snapshot: &OutputSnapshot) -> DispatchResult<()> {
        self.with_slot_mut(key, |s| {
                if let Some(prev) = s.output.replace(snapshot.clone()) {
                    s.output_log.push(prev);
                }
            })
    }

    fn read_output(&self, key: &RecordKey) -> DispatchResult<Option<OutputSnapshot>> {
        self.with_slot(key, |s| s.output.clone())
    }

    fn list_output_log(&self, key: &RecordKey) -> DispatchResult<Vec<OutputSnapshot>> {
        self.with_slot(key, |s| s.output_log.clone())
    }

    fn append_progress(&self, key: &RecordKey, entry: &ProgressEntry) -> DispatchResult<()> {
        self.with_slot_mut(key, |s| s.progress.push(entry.clone()))
    }

    fn list_progress(&self, key: &RecordKey) -> DispatchResult<Vec<ProgressEntry>> {
        self.with_slot(key, |s| s.progress.clone())
    }

    fn append_history(&self, key: &RecordKey, channel: &str, event: &NotificationEvent) -> DispatchResult<()> {
        self.with_slot_mut(key, |s| {
                s.history
                 .entry(channel.to_string())
                 .or_default()
                 .push(event.clone())
            })
    }

    fn list_history_events(&self, key: &RecordKey, channel: &str) -> DispatchResult<Vec<NotificationEvent>> {
        self.with_slot(key, |s| s.history.get(channel).cloned().unwrap_or_default())
    }

    fn records_for_job(&self, job_id: &JobId) -> DispatchResult<Vec<RecordKey>> {
        Ok(self.by_job
               .get(job_id)
               .map(|sessions| {
                   sessions.iter()
                           .map(|s| RecordKey::new(s.clone(), job_id.clone()))
                           .collect()
               })
               .unwrap_or_default())
    }

    fn list_keys(&self) -> DispatchResult<Vec<RecordKey>> {
        Ok(self.records.iter().map(|r| r.key().clone()).collect())
    }

    fn claim_dispatch(&self, key: &RecordKey) -> DispatchResult<DispatchClaim> {
        // El entry mantiene bloqueada la partición del JobID mientras se
        // decide; `records` es otro mapa, leerlo aquí no produce deadlock.
        match self.claims.entry(key.job_id.clone()) {
            Entry::Vacant(v) => {
                v.insert(key.clone());
                Ok(DispatchClaim::Granted)
            }
            Entry::Occupied(mut o) => {
                let holder = o.get().clone();
                if holder == *key || holder_is_released(self, &holder) {
                    o.insert(key.clone());
                    Ok(DispatchClaim::Granted)
                } else {
                    Ok(DispatchClaim::Held(holder))
                }
            }
        }
    }

    fn release_dispatch(&self, key: &RecordKey) -> DispatchResult<()> {
        self.claims.remove_if(&key.job_id, |_, holder| holder == key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn in_memory_store_satisfies_contract() {
        let store = InMemoryJobStore::new();
        contract::run_all(&store);
    }

    #[test]
    fn missing_parameters_is_a_consistency_fault() {
        let store = InMemoryJobStore::new();
        let k = contract::key("s1", "0000000000000abc");
        contract::create(&store, &k);
        assert!(matches!(store.read_parameters(&k), Err(DispatchError::StoreConsistency { .. })));
    }
}
