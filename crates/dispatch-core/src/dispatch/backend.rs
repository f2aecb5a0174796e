//! Colaboradores externos de la máquina de estados: backend de cómputo y
//! post-proceso local (`ready -> done`).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DispatchError, DispatchResult};
use crate::model::{JobId, JobStatus, RecordKey, RequestParameters, SessionId};

/// Respuesta del backend a un `submit`.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendAck {
    /// Aceptado; el resto llega por callbacks.
    Accepted { details: Value },
    /// Backend no asíncrono: el resultado ya está.
    Completed { output: Value },
    /// El backend rechazó el trabajo.
    Failed { message: String },
}

pub trait Backend: Send + Sync + fmt::Debug {
    /// `attempt` viaja con el trabajo para que los callbacks lo devuelvan y
    /// los de intentos anteriores puedan descartarse. Errores de
    /// comunicación se devuelven como `DispatchError::TransientBackend`.
    fn submit(&self, job_id: &JobId, params: &RequestParameters, attempt: u32) -> DispatchResult<BackendAck>;
}

/// Callback asíncrono `on_status(job_id, status, details)`. El backend
/// devuelve el `attempt` recibido en `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCallback {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub status: JobStatus,
    pub attempt: u32,
    #[serde(default)]
    pub details: Value,
}

impl BackendCallback {
    pub fn new(key: &RecordKey, attempt: u32, status: JobStatus, details: Value) -> Self {
        Self { job_id: key.job_id.clone(),
               session_id: key.session_id.clone(),
               status,
               attempt,
               details }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.session_id.clone(), self.job_id.clone())
    }
}

/// Post-proceso local que convierte el resultado del backend en output.
pub trait ResultFinalizer: Send + Sync + fmt::Debug {
    fn finalize(&self, key: &RecordKey, backend_details: &Value) -> DispatchResult<Value>;
}

/// Usa los detalles del backend tal cual como output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFinalizer;

impl ResultFinalizer for PassthroughFinalizer {
    fn finalize(&self, _key: &RecordKey, backend_details: &Value) -> DispatchResult<Value> {
        Ok(backend_details.clone())
    }
}

/// Backend programable: responde con las acks encoladas y, agotadas,
/// con `Accepted`. Registra cada submit.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<DispatchResult<BackendAck>>>,
    calls: Mutex<Vec<(JobId, u32)>>,
    count: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, reply: DispatchResult<BackendAck>) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(reply);
        }
        self
    }

    pub fn then_completed(self, output: Value) -> Self {
        self.then(Ok(BackendAck::Completed { output }))
    }

    pub fn then_unreachable(self, message: &str) -> Self {
        self.then(Err(DispatchError::TransientBackend(message.to_string())))
    }

    pub fn submissions(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(JobId, u32)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Backend for ScriptedBackend {
    fn submit(&self, job_id: &JobId, _params: &RequestParameters, attempt: u32) -> DispatchResult<BackendAck> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut c) = self.calls.lock() {
            c.push((job_id.clone(), attempt));
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(BackendAck::Accepted { details: Value::Null }))
    }
}
