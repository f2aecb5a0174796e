//! Backend de entrega por directorio spool.
//!
//! Cada `submit` deja un ticket `<job_id>.<attempt>.json` en el spool. El
//! broker externo lo consume y responde con callbacks `on_status`. Un ticket
//! lleva el checksum sha256 de los parámetros canónicos para que el broker
//! detecte tickets truncados.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_core::hashing::to_canonical_json;
use dispatch_core::{Backend, BackendAck, BackendCallback, Clock, DispatchError, DispatchResult, JobId, JobStatus,
                    JobStore, RecordKey, RequestParameters, SystemClock};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolTicket {
    pub job_id: JobId,
    pub attempt: u32,
    pub spooled_at: DateTime<Utc>,
    pub params: RequestParameters,
    pub checksum: String,
}

impl SpoolTicket {
    pub fn new(job_id: &JobId, params: &RequestParameters, attempt: u32, now: DateTime<Utc>) -> Self {
        Self { job_id: job_id.clone(),
               attempt,
               spooled_at: now,
               params: params.clone(),
               checksum: params_checksum(params) }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}.json", self.job_id, self.attempt)
    }

    pub fn is_intact(&self) -> bool {
        self.checksum == params_checksum(&self.params)
    }

    /// Callback para este ticket dirigido al registro que lo despachó.
    pub fn callback(&self, store: &dyn JobStore, status: JobStatus, details: Value) -> DispatchResult<BackendCallback> {
        route_callback(store, &self.job_id, self.attempt, status, details)
    }
}

/// El backend sólo conoce el JobID: el callback se dirige al registro no
/// redirigido de ese JobID que está en vuelo o, si ninguno lo está, al
/// actualizado más recientemente.
pub fn route_callback(store: &dyn JobStore,
                      job_id: &JobId,
                      attempt: u32,
                      status: JobStatus,
                      details: Value)
                      -> DispatchResult<BackendCallback> {
    let mut best: Option<((bool, DateTime<Utc>), RecordKey)> = None;
    for key in store.records_for_job(job_id)? {
        if store.read_meta(&key)?.is_aliased() {
            continue;
        }
        let doc = store.read_status(&key)?;
        let rank = (doc.status.is_in_flight(), doc.updated_at);
        if best.as_ref().map_or(true, |(r, _)| rank > *r) {
            best = Some((rank, key));
        }
    }
    let (_, key) = best.ok_or_else(|| DispatchError::NoRecordFound { job_id: job_id.to_string() })?;
    Ok(BackendCallback::new(&key, attempt, status, details))
}

fn params_checksum(params: &RequestParameters) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(&params.to_value()).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct SpoolBackend {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SpoolBackend {
    /// Crea el directorio si no existe.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir,
                  clock: Arc::new(SystemClock) })
    }

    /// Mismo reloj que la máquina de despacho para fechar los tickets.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tickets pendientes, ordenados por JobID e intento. Los ilegibles se
    /// omiten con un warn.
    pub fn pending(&self) -> io::Result<Vec<SpoolTicket>> {
        let mut tickets = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path)?;
            match serde_json::from_slice::<SpoolTicket>(&raw) {
                Ok(t) => tickets.push(t),
                Err(e) => warn!("spool: skipping unreadable ticket {}: {e}", path.display()),
            }
        }
        tickets.sort_by(|a, b| (&a.job_id, a.attempt).cmp(&(&b.job_id, b.attempt)));
        Ok(tickets)
    }

    /// Retira un ticket ya consumido. `false` si no existía.
    pub fn take(&self, ticket: &SpoolTicket) -> io::Result<bool> {
        match fs::remove_file(self.dir.join(ticket.file_name())) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write_ticket(&self, ticket: &SpoolTicket) -> io::Result<PathBuf> {
        let body = serde_json::to_vec_pretty(ticket)?;
        let path = self.dir.join(ticket.file_name());
        // el broker sólo lista *.json: el temporal no se ve a medio escribir
        let tmp = self.dir.join(format!(".{}.{}", ticket.file_name(), Uuid::new_v4().simple()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

impl Backend for SpoolBackend {
    fn submit(&self, job_id: &JobId, params: &RequestParameters, attempt: u32) -> DispatchResult<BackendAck> {
        let ticket = SpoolTicket::new(job_id, params, attempt, self.clock.now());
        let path = self.write_ticket(&ticket)
                       .map_err(|e| DispatchError::TransientBackend(format!("spool {}: {e}", self.dir.display())))?;
        debug!("spooled job_id={job_id} attempt={attempt} path={}", path.display());
        Ok(BackendAck::Accepted { details: json!({"spool": ticket.file_name(),
                                                  "attempt": attempt}) })
    }
}
