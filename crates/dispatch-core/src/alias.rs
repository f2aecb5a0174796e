//! Aliasing Controller.
//!
//! Trabajo idéntico concurrente (pestañas duplicadas, polling repetido) se
//! resuelve en como mucho un despacho por JobID: las sesiones nuevas se
//! redirigen al registro vivo que ya lo ejecuta. La resolución se calcula una
//! vez por request a partir del estado persistido y se pasa explícitamente a
//! la máquina de estados (`Resolution`), sin punteros mutables entre
//! registros.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::errors::{DispatchError, DispatchResult};
use crate::model::{JobId, JobStatus, OutputSnapshot, RecordKey, StatusDocument};
use crate::store::JobStore;

/// Decisión de aliasing para un registro.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Sin alias utilizable: el propio registro sigue su ciclo de vida.
    Own,
    /// Fuente en vuelo y fresca: lecturas/escrituras van a `source`.
    Redirect { source: RecordKey },
    /// Fuente en vuelo sin actualizaciones durante más de T_resub: se reenvía
    /// bajo el registro original.
    ResubmitSource { source: RecordKey },
    /// Fuente terminal con éxito: el registro propio arranca como nuevo pero
    /// recibe el output ya calculado.
    CopyResult { source: RecordKey, output: OutputSnapshot },
}

impl Resolution {
    /// Registro sobre el que se opera tras resolver.
    pub fn target<'a>(&'a self, own: &'a RecordKey) -> &'a RecordKey {
        match self {
            Self::Own | Self::CopyResult { .. } => own,
            Self::Redirect { source } | Self::ResubmitSource { source } => source,
        }
    }

    pub fn source(&self) -> Option<&RecordKey> {
        match self {
            Self::Own => None,
            Self::Redirect { source } | Self::ResubmitSource { source } | Self::CopyResult { source, .. } => Some(source),
        }
    }
}

pub struct AliasingController<'a> {
    store: &'a dyn JobStore,
    resubmit_timeout: Duration,
    now: DateTime<Utc>,
}

impl<'a> AliasingController<'a> {
    pub fn new(store: &'a dyn JobStore, resubmit_timeout: Duration, now: DateTime<Utc>) -> Self {
        Self { store,
               resubmit_timeout,
               now }
    }

    /// ¿Lleva `doc` más de T_resub sin actualizarse?
    pub fn is_stale(&self, doc: &StatusDocument) -> bool {
        doc.status.is_in_flight() && self.now - doc.updated_at > self.resubmit_timeout
    }

    /// Registro canónico que comparte `job_id`, excluyendo `exclude`.
    ///
    /// Candidatos: registros no redirigidos ya despachados. Si hay uno en
    /// vuelo se devuelve; más de uno en vuelo es un fallo de consistencia. Sin
    /// ninguno en vuelo se devuelve el asentado más reciente. Registros
    /// ilegibles se omiten (el fallo queda acotado a ellos).
    pub fn find_alias(&self, job_id: &JobId, exclude: &RecordKey) -> DispatchResult<Option<RecordKey>> {
        let mut live: Vec<RecordKey> = vec![];
        let mut settled: Option<(DateTime<Utc>, RecordKey)> = None;
        for key in self.store.records_for_job(job_id)? {
            if key == *exclude {
                continue;
            }
            let (meta, doc) = match (self.store.read_meta(&key), self.store.read_status(&key)) {
                (Ok(m), Ok(d)) => (m, d),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("find_alias: skipping unreadable record key={key} err={}", e.debug_message());
                    continue;
                }
            };
            if meta.is_aliased() {
                continue;
            }
            if doc.status.is_in_flight() {
                live.push(key);
            } else if doc.status.is_settled() && settled.as_ref().map_or(true, |(at, _)| doc.updated_at > *at) {
                settled = Some((doc.updated_at, key));
            }
        }
        if live.len() > 1 {
            let keys: Vec<String> = live.iter().map(RecordKey::to_string).collect();
            return Err(DispatchError::consistency(format!("job/{job_id}"),
                                                  format!("{} live records: {}", live.len(), keys.join(", "))));
        }
        Ok(live.pop().or(settled.map(|(_, k)| k)))
    }

    /// Resuelve qué registro atiende la request sobre `own`.
    pub fn resolve(&self, own: &RecordKey) -> DispatchResult<Resolution> {
        let own_doc = self.store.read_status(own)?;
        if own_doc.status != JobStatus::New {
            // el registro ya ejecuta (o ejecutó) por sí mismo
            return Ok(Resolution::Own);
        }
        let Some(source) = self.find_alias(&own.job_id, own)? else {
            return Ok(Resolution::Own);
        };
        let source_doc = self.store.read_status(&source)?;
        let resolution = if source_doc.status.is_in_flight() {
            if self.is_stale(&source_doc) {
                Resolution::ResubmitSource { source }
            } else {
                Resolution::Redirect { source }
            }
        } else if source_doc.status == JobStatus::Done {
            match self.store.read_output(&source) {
                Ok(Some(output)) => Resolution::CopyResult { source, output },
                Ok(None) => Resolution::Own,
                // carrera con una escritura: se recalcula en vez de fallar
                Err(DispatchError::OutputCorrupt(detail)) => {
                    warn!("resolve: output of {source} unreadable ({detail}), running fresh");
                    Resolution::Own
                }
                Err(e) => return Err(e),
            }
        } else {
            Resolution::Own
        };
        debug!("resolve own={own} -> {resolution:?}");
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecordMeta, SessionId};
    use crate::store::InMemoryJobStore;
    use serde_json::json;

    const JOB: &str = "00000000000000c1";

    fn record(store: &InMemoryJobStore, session: &str, status: JobStatus, updated_at: DateTime<Utc>) -> RecordKey {
        let key = RecordKey::new(SessionId::parse(session).unwrap(), JobId::parse(JOB).unwrap());
        let mut doc = StatusDocument::new(updated_at);
        doc.status = status;
        store.create(&RecordMeta::new(key.clone(), updated_at), &doc).unwrap();
        key
    }

    #[test]
    fn fresh_record_without_peers_is_own() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let own = record(&store, "own", JobStatus::New, now);
        let ctl = AliasingController::new(&store, Duration::minutes(30), now);
        assert_eq!(ctl.resolve(&own).unwrap(), Resolution::Own);
    }

    #[test]
    fn in_flight_source_is_redirected_until_stale() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let src = record(&store, "src", JobStatus::Submitted, t0);
        let own = record(&store, "own", JobStatus::New, t0);

        let ctl = AliasingController::new(&store, Duration::minutes(30), t0 + Duration::minutes(10));
        assert_eq!(ctl.resolve(&own).unwrap(), Resolution::Redirect { source: src.clone() });

        let late = AliasingController::new(&store, Duration::minutes(30), t0 + Duration::minutes(31));
        let r = late.resolve(&own).unwrap();
        assert_eq!(r, Resolution::ResubmitSource { source: src.clone() });
        assert_eq!(r.target(&own), &src);
    }

    #[test]
    fn done_source_with_output_is_copied() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let src = record(&store, "src", JobStatus::Done, t0);
        let out = OutputSnapshot { written_at: t0,
                                   output: json!({"image": "png"}) };
        store.write_output(&src, &out).unwrap();
        let own = record(&store, "own", JobStatus::New, t0);
        let ctl = AliasingController::new(&store, Duration::minutes(30), t0);
        let r = ctl.resolve(&own).unwrap();
        assert_eq!(r, Resolution::CopyResult { source: src, output: out });
        assert_eq!(r.target(&own), &own);
    }

    #[test]
    fn failed_or_ready_source_means_fresh_run() {
        for status in [JobStatus::Failed, JobStatus::Ready] {
            let store = InMemoryJobStore::new();
            let t0 = Utc::now();
            record(&store, "src", status, t0);
            let own = record(&store, "own", JobStatus::New, t0);
            let ctl = AliasingController::new(&store, Duration::minutes(30), t0);
            assert_eq!(ctl.resolve(&own).unwrap(), Resolution::Own, "status {status}");
        }
    }

    #[test]
    fn two_live_records_are_a_consistency_fault() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        record(&store, "a", JobStatus::Submitted, t0);
        record(&store, "b", JobStatus::Progress, t0);
        let own = record(&store, "own", JobStatus::New, t0);
        let ctl = AliasingController::new(&store, Duration::minutes(30), t0);
        assert!(matches!(ctl.resolve(&own), Err(DispatchError::StoreConsistency { .. })));
    }

    #[test]
    fn aliased_records_are_not_candidates() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let src = record(&store, "src", JobStatus::Submitted, t0);
        let follower = record(&store, "follower", JobStatus::Progress, t0);
        let mut meta = store.read_meta(&follower).unwrap();
        meta.alias_of = Some(src.clone());
        store.write_meta(&meta).unwrap();
        let own = record(&store, "own", JobStatus::New, t0);
        let ctl = AliasingController::new(&store, Duration::minutes(30), t0);
        assert_eq!(ctl.find_alias(&own.job_id, &own).unwrap(), Some(src));
    }

    #[test]
    fn latest_settled_record_wins_without_live_ones() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        record(&store, "old", JobStatus::Done, t0);
        let newer = record(&store, "newer", JobStatus::Failed, t0 + Duration::minutes(5));
        let own = record(&store, "own", JobStatus::New, t0 + Duration::minutes(6));
        let ctl = AliasingController::new(&store, Duration::minutes(30), t0 + Duration::minutes(6));
        assert_eq!(ctl.find_alias(&own.job_id, &own).unwrap(), Some(newer));
    }
}
