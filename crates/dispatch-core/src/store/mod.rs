//! Job Record Store: único recurso mutable compartido del núcleo.
//!
//! Cada registro vive bajo su clave (SessionID, JobID) y todas las escrituras
//! son locales a ese espacio. Hay un índice secundario por JobID para el
//! Aliasing Controller y un claim por JobID que garantiza como mucho un
//! despacho vivo.
//!
//! Semántica compartida por las implementaciones:
//! - estado: "last write wins";
//! - progreso e historial: append-only, preservando orden;
//! - output: `write_output` rota el anterior a un log con sello de tiempo.

mod fs;
mod memory;

pub use fs::FileJobStore;
pub use memory::InMemoryJobStore;

use chrono::{DateTime, Utc};

use crate::errors::DispatchResult;
use crate::model::{JobId, JobStatus, NotificationEvent, OutputSnapshot, ProgressEntry, RecordKey, RecordMeta,
                   RequestParameters, StatusDocument};

/// Resultado de pedir el claim de despacho de un JobID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchClaim {
    Granted,
    /// Otro registro vivo ya despachó este JobID.
    Held(RecordKey),
}

pub trait JobStore: Send + Sync {
    /// Crea el registro con su estado inicial. `AlreadyExists` si la clave ya
    /// existe (benigno: el llamador debe reutilizarlo).
    fn create(&self, meta: &RecordMeta, initial: &StatusDocument) -> DispatchResult<()>;

    /// `NoRecordFound` si no existe.
    fn read_meta(&self, key: &RecordKey) -> DispatchResult<RecordMeta>;
    fn write_meta(&self, meta: &RecordMeta) -> DispatchResult<()>;

    fn write_parameters(&self, key: &RecordKey, params: &RequestParameters) -> DispatchResult<()>;
    fn read_parameters(&self, key: &RecordKey) -> DispatchResult<RequestParameters>;

    fn write_status(&self, key: &RecordKey, doc: &StatusDocument) -> DispatchResult<()>;
    fn read_status(&self, key: &RecordKey) -> DispatchResult<StatusDocument>;

    /// Escribe el output actual rotando el anterior al log.
    fn write_output(&self, key: &RecordKey, snapshot: &OutputSnapshot) -> DispatchResult<()>;
    /// `OutputCorrupt` si la lectura colisiona con una escritura concurrente.
    fn read_output(&self, key: &RecordKey) -> DispatchResult<Option<OutputSnapshot>>;
    /// Snapshots rotados, del más antiguo al más reciente.
    fn list_output_log(&self, key: &RecordKey) -> DispatchResult<Vec<OutputSnapshot>>;

    fn append_progress(&self, key: &RecordKey, entry: &ProgressEntry) -> DispatchResult<()>;
    fn list_progress(&self, key: &RecordKey) -> DispatchResult<Vec<ProgressEntry>>;

    fn append_history(&self, key: &RecordKey, channel: &str, event: &NotificationEvent) -> DispatchResult<()>;
    /// Todos los eventos de un canal (enviados o no), en orden de append.
    fn list_history_events(&self, key: &RecordKey, channel: &str) -> DispatchResult<Vec<NotificationEvent>>;

    /// Timestamps de las notificaciones **enviadas** para `status` en `channel`.
    fn list_history(&self, key: &RecordKey, channel: &str, status: JobStatus) -> DispatchResult<Vec<DateTime<Utc>>> {
        Ok(self.list_history_events(key, channel)?
               .into_iter()
               .filter(|e| e.status == status && e.is_sent())
               .map(|e| e.timestamp)
               .collect())
    }

    /// Índice secundario: todas las claves que comparten `job_id`.
    fn records_for_job(&self, job_id: &JobId) -> DispatchResult<Vec<RecordKey>>;
    fn list_keys(&self) -> DispatchResult<Vec<RecordKey>>;

    /// Concede el claim si está libre, si ya es de `key`, o si su titular ya
    /// está asentado (ready/done/failed) o desapareció.
    fn claim_dispatch(&self, key: &RecordKey) -> DispatchResult<DispatchClaim>;
    /// Libera el claim sólo si `key` es el titular.
    fn release_dispatch(&self, key: &RecordKey) -> DispatchResult<()>;

    fn exists(&self, key: &RecordKey) -> DispatchResult<bool> {
        match self.read_meta(key) {
            Ok(_) => Ok(true),
            Err(crate::errors::DispatchError::NoRecordFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// ¿Está libre el claim cuyo titular es `holder`?
pub(crate) fn holder_is_released<S: JobStore + ?Sized>(store: &S, holder: &RecordKey) -> bool {
    match store.read_status(holder) {
        Ok(doc) => doc.status.is_settled(),
        Err(_) => true,
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Pruebas de contrato compartidas por todas las implementaciones.
    use super::*;
    use crate::errors::DispatchError;
    use crate::model::{JobId, NotificationOutcome, SessionId};
    use chrono::Duration;
    use serde_json::json;

    pub fn key(session: &str, job: &str) -> RecordKey {
        RecordKey::new(SessionId::parse(session).unwrap(), JobId::parse(job).unwrap())
    }

    pub fn create(store: &dyn JobStore, k: &RecordKey) {
        let now = Utc::now();
        store.create(&RecordMeta::new(k.clone(), now), &StatusDocument::new(now)).unwrap();
    }

    pub fn create_is_exclusive(store: &dyn JobStore) {
        let k = key("s1", "00000000000000aa");
        create(store, &k);
        let again = store.create(&RecordMeta::new(k.clone(), Utc::now()), &StatusDocument::new(Utc::now()));
        assert!(matches!(again, Err(DispatchError::AlreadyExists(_))));
        assert!(store.exists(&k).unwrap());
        assert!(!store.exists(&key("s2", "00000000000000aa")).unwrap());
        assert!(matches!(store.read_status(&key("s9", "00000000000000aa")),
                         Err(DispatchError::NoRecordFound { .. })));
    }

    pub fn parameters_and_status_roundtrip(store: &dyn JobStore) {
        let k = key("s1", "00000000000000bb");
        create(store, &k);
        let params = RequestParameters::new().with("instrument", "isgri").with("scw", json!(["1", "2"]));
        store.write_parameters(&k, &params).unwrap();
        assert_eq!(store.read_parameters(&k).unwrap(), params);

        let mut doc = store.read_status(&k).unwrap();
        assert_eq!(doc.status, JobStatus::New);
        doc.status = JobStatus::Submitted;
        doc.attempt = 1;
        store.write_status(&k, &doc).unwrap();
        assert_eq!(store.read_status(&k).unwrap(), doc);
    }

    pub fn output_rotates_instead_of_overwriting(store: &dyn JobStore) {
        let k = key("s1", "00000000000000cc");
        create(store, &k);
        assert!(store.read_output(&k).unwrap().is_none());
        let t0 = Utc::now();
        let first = OutputSnapshot { written_at: t0,
                                     output: json!({"image": "v1"}) };
        let second = OutputSnapshot { written_at: t0 + Duration::seconds(5),
                                      output: json!({"image": "v2"}) };
        store.write_output(&k, &first).unwrap();
        store.write_output(&k, &second).unwrap();
        assert_eq!(store.read_output(&k).unwrap(), Some(second));
        assert_eq!(store.list_output_log(&k).unwrap(), vec![first]);
    }

    pub fn progress_and_history_are_append_only(store: &dyn JobStore) {
        let k = key("s1", "00000000000000dd");
        create(store, &k);
        let t0 = Utc::now();
        for i in 0..3 {
            store.append_progress(&k,
                                  &ProgressEntry { attempt: 1,
                                                   at: t0 + Duration::seconds(i),
                                                   details: json!({"step": i}) })
                 .unwrap();
        }
        let steps: Vec<i64> = store.list_progress(&k)
                                   .unwrap()
                                   .iter()
                                   .map(|p| p.details["step"].as_i64().unwrap())
                                   .collect();
        assert_eq!(steps, vec![0, 1, 2]);

        let sent = NotificationEvent { status: JobStatus::Submitted,
                                       timestamp: t0,
                                       outcome: NotificationOutcome::Sent,
                                       reason: "first".into() };
        let suppressed = NotificationEvent { status: JobStatus::Submitted,
                                             timestamp: t0 + Duration::seconds(1),
                                             outcome: NotificationOutcome::Suppressed,
                                             reason: "interval".into() };
        store.append_history(&k, "email", &sent).unwrap();
        store.append_history(&k, "email", &suppressed).unwrap();
        assert_eq!(store.list_history_events(&k, "email").unwrap().len(), 2);
        assert_eq!(store.list_history(&k, "email", JobStatus::Submitted).unwrap(), vec![t0]);
        assert!(store.list_history(&k, "chat", JobStatus::Submitted).unwrap().is_empty());
        assert!(store.list_history(&k, "email", JobStatus::Done).unwrap().is_empty());
    }

    pub fn secondary_index_and_claims(store: &dyn JobStore) {
        let a = key("sa", "00000000000000ee");
        let b = key("sb", "00000000000000ee");
        let other = key("sa", "00000000000000ff");
        create(store, &a);
        create(store, &b);
        create(store, &other);
        let mut found = store.records_for_job(&a.job_id).unwrap();
        found.sort();
        assert_eq!(found, vec![a.clone(), b.clone()]);
        assert_eq!(store.list_keys().unwrap().len(), 3);

        // claims: sólo un titular vivo por JobID
        let mut doc = store.read_status(&a).unwrap();
        doc.status = JobStatus::Submitted;
        store.write_status(&a, &doc).unwrap();
        assert_eq!(store.claim_dispatch(&a).unwrap(), DispatchClaim::Granted);
        assert_eq!(store.claim_dispatch(&a).unwrap(), DispatchClaim::Granted);
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Held(a.clone()));
        assert_eq!(store.claim_dispatch(&other).unwrap(), DispatchClaim::Granted);

        // release por no-titular no tiene efecto
        store.release_dispatch(&b).unwrap();
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Held(a.clone()));

        // titular asentado => claim libre
        doc.status = JobStatus::Done;
        store.write_status(&a, &doc).unwrap();
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Granted);
        store.release_dispatch(&b).unwrap();
        assert_eq!(store.claim_dispatch(&a).unwrap(), DispatchClaim::Granted);
    }

    pub fn meta_updates_persist(store: &dyn JobStore) {
        let a = key("sa", "0000000000000011");
        let b = key("sb", "0000000000000011");
        create(store, &a);
        create(store, &b);
        let mut meta = store.read_meta(&b).unwrap();
        meta.alias_of = Some(a.clone());
        store.write_meta(&meta).unwrap();
        assert_eq!(store.read_meta(&b).unwrap().alias_of, Some(a));
    }

    pub fn run_all(store: &dyn JobStore) {
        create_is_exclusive(store);
        parameters_and_status_roundtrip(store);
        output_rotates_instead_of_overwriting(store);
        progress_and_history_are_append_only(store);
        secondary_index_and_claims(store);
        meta_updates_persist(store);
    }
}
