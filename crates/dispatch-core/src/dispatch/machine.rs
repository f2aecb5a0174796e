use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use super::backend::{Backend, BackendAck, BackendCallback, ResultFinalizer};
use super::builder::DispatchBuilder;
use crate::alert::{AlertLevel, AlertSink};
use crate::alias::{AliasingController, Resolution};
use crate::clock::Clock;
use crate::constants::DEFAULT_RESUBMIT_TIMEOUT_SECS;
use crate::errors::{DispatchError, DispatchResult};
use crate::identity::{IdentityService, ParamsSource};
use crate::metrics::{Counter, DispatchMetrics};
use crate::model::{JobId, JobStatus, OutputSnapshot, ProgressEntry, RecordKey, RecordMeta, RequestParameters,
                   SessionId, StatusDocument, UserIdentity};
use crate::notify::{NotificationGate, NotificationReport, TransitionContext};
use crate::store::{DispatchClaim, JobStore};

/// Qué pide el cliente: arrancar trabajo o consultar el existente.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    New,
    Status,
}

impl QueryStatus {
    /// `query_status` del formulario: "new" (o ausente) arranca; cualquier
    /// otro estado conocido es una consulta.
    pub fn parse(raw: Option<&str>) -> DispatchResult<Self> {
        match raw {
            None | Some("") | Some("new") => Ok(Self::New),
            Some(other) => other.parse::<JobStatus>().map(|_| Self::Status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// T_resub.
    pub resubmit_timeout: Duration,
}

impl DispatchConfig {
    pub fn with_resubmit_secs(secs: i64) -> Self {
        Self { resubmit_timeout: Duration::seconds(secs) }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::with_resubmit_secs(DEFAULT_RESUBMIT_TIMEOUT_SECS)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub params: RequestParameters,
    pub identity: UserIdentity,
    pub session_id: Option<SessionId>,
    /// JobID reclamado por el cliente; se valida siempre.
    pub job_id: Option<JobId>,
    pub query: QueryStatus,
}

impl DispatchRequest {
    pub fn new(params: RequestParameters, identity: UserIdentity) -> Self {
        Self { params,
               identity,
               session_id: None,
               job_id: None,
               query: QueryStatus::New }
    }

    /// Consulta sin parámetros: se valida contra el registro persistido.
    pub fn poll(key: &RecordKey, identity: UserIdentity) -> Self {
        Self { params: RequestParameters::new(),
               identity,
               session_id: Some(key.session_id.clone()),
               job_id: Some(key.job_id.clone()),
               query: QueryStatus::Status }
    }

    /// Lee `session_id`, `job_id` y `query_status` de los propios parámetros.
    pub fn from_params(params: RequestParameters, identity: UserIdentity) -> DispatchResult<Self> {
        let session_id = params.get_str("session_id")
                               .filter(|s| !s.is_empty())
                               .map(SessionId::parse)
                               .transpose()?;
        let job_id = params.get_str("job_id")
                           .filter(|s| !s.is_empty())
                           .map(JobId::parse)
                           .transpose()?;
        let query = QueryStatus::parse(params.get_str("query_status"))?;
        Ok(Self { params,
                  identity,
                  session_id,
                  job_id,
                  query })
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_query(mut self, query: QueryStatus) -> Self {
        self.query = query;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResponse {
    /// Registro propio de la sesión.
    pub key: RecordKey,
    /// Registro que realmente atendió la request (distinto si hubo alias).
    pub served_by: RecordKey,
    pub status: JobStatus,
    pub attempt: u32,
    pub output: Option<Value>,
    pub details: Value,
    pub notifications: Vec<NotificationReport>,
}

impl DispatchResponse {
    pub fn is_aliased(&self) -> bool {
        self.key != self.served_by
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied {
        status: JobStatus,
        notifications: Vec<NotificationReport>,
    },
    /// Reentrega de un estado terminal ya aplicado; sólo se registra en el
    /// historial de notificaciones.
    DuplicateTerminal {
        status: JobStatus,
        notifications: Vec<NotificationReport>,
    },
    /// Callback de un intento anterior a un reenvío.
    Stale { attempt: u32, current: u32 },
    /// Transición no permitida desde el estado actual (hacia atrás o sobre
    /// un registro aún no despachado); se descarta.
    Ignored { current: JobStatus, received: JobStatus },
}

/// Motor de despacho. Sin estado propio: todo vive en el `JobStore`, así que
/// varias instancias pueden atender el mismo store.
pub struct DispatchStateMachine {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) gate: Arc<dyn NotificationGate>,
    pub(super) identity: IdentityService,
    pub(super) finalizer: Arc<dyn ResultFinalizer>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) alerts: Arc<dyn AlertSink>,
    pub(super) metrics: Arc<DispatchMetrics>,
    pub(super) config: DispatchConfig,
}

impl fmt::Debug for DispatchStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchStateMachine")
         .field("backend", &self.backend)
         .field("gate", &self.gate)
         .field("config", &self.config)
         .finish_non_exhaustive()
    }
}

impl DispatchStateMachine {
    pub fn builder(store: Arc<dyn JobStore>, backend: Arc<dyn Backend>) -> DispatchBuilder {
        DispatchBuilder::new(store, backend)
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    /// Atiende una request de cliente: valida, crea el registro si es "new",
    /// resuelve alias y avanza el registro destino.
    pub fn handle_request(&self, req: DispatchRequest) -> DispatchResult<DispatchResponse> {
        let now = self.clock.now();
        let result = self.handle_inner(&req, now);
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    /// Aplica un callback del backend. Siempre valida contra el registro
    /// persistido; un callback falsificado no modifica nada.
    pub fn on_backend_status(&self, callback: BackendCallback) -> DispatchResult<CallbackOutcome> {
        let now = self.clock.now();
        let result = self.callback_inner(&callback, now);
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    fn report(&self, err: &DispatchError) {
        if matches!(err, DispatchError::Authorization { .. }) {
            self.metrics.incr(Counter::AuthorizationFailure);
        }
        if err.is_alertable() {
            let level = match err {
                DispatchError::StoreConsistency { .. } => AlertLevel::Error,
                _ => AlertLevel::Warning,
            };
            self.alerts.capture_message(level, &err.debug_message());
        } else {
            debug!("request rejected: {}", err.debug_message());
        }
    }

    fn handle_inner(&self, req: &DispatchRequest, now: DateTime<Utc>) -> DispatchResult<DispatchResponse> {
        let session_id = req.session_id.clone().unwrap_or_else(SessionId::generate);
        let key = self.locate(req, session_id)?;
        if !self.store.exists(&key)? {
            if req.query != QueryStatus::New {
                return Err(DispatchError::NoRecordFound { job_id: key.job_id.to_string() });
            }
            self.create_record(&key, req, now)?;
        }
        let resolution = AliasingController::new(self.store.as_ref(), self.config.resubmit_timeout, now).resolve(&key)?;
        match resolution {
            Resolution::Own => {
                self.set_alias(&key, None)?;
                self.advance(&key, &key, now)
            }
            Resolution::Redirect { source } | Resolution::ResubmitSource { source } => {
                if self.metrics.incr_and_should_log(Counter::AliasRedirect) {
                    info!("alias {key} -> {source}");
                }
                self.set_alias(&key, Some(&source))?;
                self.advance(&key, &source, now)
            }
            Resolution::CopyResult { source, output } => {
                self.set_alias(&key, None)?;
                self.adopt_output(&key, &source, output, now)
            }
        }
    }

    /// Determina la clave propia validando el JobID reclamado.
    fn locate(&self, req: &DispatchRequest, session_id: SessionId) -> DispatchResult<RecordKey> {
        if req.params.fingerprint_view().is_empty() {
            if req.query == QueryStatus::New {
                return Err(DispatchError::RequestNotUnderstood("new request without parameters".into()));
            }
            let job_id = req.job_id
                            .clone()
                            .ok_or_else(|| DispatchError::RequestNotUnderstood("status query needs a job_id".into()))?;
            let key = RecordKey::new(session_id, job_id);
            if !self.store.exists(&key)? {
                return Err(DispatchError::NoRecordFound { job_id: key.job_id.to_string() });
            }
            self.identity.validate(&key.job_id,
                                   ParamsSource::Record { store: self.store.as_ref(),
                                                          key: &key },
                                   &req.identity)?;
            return Ok(key);
        }
        if let Some(claimed) = &req.job_id {
            self.identity.validate(claimed, ParamsSource::Request(&req.params), &req.identity)?;
        }
        Ok(RecordKey::new(session_id, self.identity.compute_job_id(&req.params, &req.identity)))
    }

    fn create_record(&self, key: &RecordKey, req: &DispatchRequest, now: DateTime<Utc>) -> DispatchResult<()> {
        let meta = RecordMeta::for_identity(key.clone(), now, &req.identity);
        match self.store.create(&meta, &StatusDocument::new(now)) {
            Ok(()) => debug!("created record {key}"),
            // otra request de la misma sesión llegó antes: se reutiliza
            Err(DispatchError::AlreadyExists(_)) => debug!("record {key} already exists, reusing"),
            Err(e) => return Err(e),
        }
        self.store.write_parameters(key, &req.params.stored_view())
    }

    fn set_alias(&self, key: &RecordKey, source: Option<&RecordKey>) -> DispatchResult<()> {
        let mut meta = self.store.read_meta(key)?;
        if meta.alias_of.as_ref() == source {
            return Ok(());
        }
        meta.alias_of = source.cloned();
        self.store.write_meta(&meta)
    }

    fn is_stale(&self, doc: &StatusDocument, now: DateTime<Utc>) -> bool {
        doc.status.is_in_flight() && now - doc.updated_at > self.config.resubmit_timeout
    }

    /// Avanza `target` en nombre de `own`: reenvío por T_resub, despacho de
    /// registros "new" y post-proceso de "ready".
    fn advance(&self, own: &RecordKey, target: &RecordKey, now: DateTime<Utc>) -> DispatchResult<DispatchResponse> {
        let mut reports = vec![];
        let mut doc = self.store.read_status(target)?;
        if self.is_stale(&doc, now) {
            doc = self.reset_for_resubmission(target, doc, now, &mut reports)?;
        }
        match doc.status {
            JobStatus::New => return self.dispatch(own, target, doc, now, reports),
            JobStatus::Ready => {
                let details = doc.details.clone();
                doc = self.complete(target, &doc, &details, now, &mut reports)?;
            }
            _ => {}
        }
        self.respond(own, target, doc, reports)
    }

    fn reset_for_resubmission(&self,
                              key: &RecordKey,
                              doc: StatusDocument,
                              now: DateTime<Utc>,
                              reports: &mut Vec<NotificationReport>)
                              -> DispatchResult<StatusDocument> {
        self.metrics.incr(Counter::Resubmission);
        info!("resubmitting {key}: attempt {} idle since {}", doc.attempt, doc.updated_at);
        let reset = doc.advanced(JobStatus::New,
                                 now,
                                 json!({"reason": "resubmit-timeout", "stale_since": doc.updated_at}));
        self.store.write_status(key, &reset)?;
        self.offer(key, &doc, &reset, reports);
        Ok(reset)
    }

    fn dispatch(&self,
                own: &RecordKey,
                target: &RecordKey,
                doc: StatusDocument,
                now: DateTime<Utc>,
                mut reports: Vec<NotificationReport>)
                -> DispatchResult<DispatchResponse> {
        if let DispatchClaim::Held(holder) = self.store.claim_dispatch(target)? {
            // otro registro ganó la carrera por este JobID
            self.metrics.incr(Counter::AliasRedirect);
            debug!("dispatch of {target} held by {holder}");
            if holder != *own {
                self.set_alias(own, Some(&holder))?;
            }
            let holder_doc = self.store.read_status(&holder)?;
            return self.respond(own, &holder, holder_doc, reports);
        }

        let params = self.store.read_parameters(target)?;
        let attempt = doc.attempt + 1;
        let mut submitted = doc.advanced(JobStatus::Submitted, now, Value::Null);
        submitted.attempt = attempt;
        submitted.submitted_at = Some(now);
        // persistido antes de llamar al backend: un duplicado concurrente ve "submitted"
        self.store.write_status(target, &submitted)?;
        self.offer(target, &doc, &submitted, &mut reports);
        info!("dispatching {target} attempt={attempt}");

        let settled = match self.backend.submit(&target.job_id, &params, attempt) {
            Ok(BackendAck::Accepted { details }) => {
                self.metrics.incr(Counter::Dispatch);
                if !details.is_null() {
                    submitted.details = details;
                    self.store.write_status(target, &submitted)?;
                }
                submitted
            }
            Ok(BackendAck::Completed { output }) => {
                self.metrics.incr(Counter::Dispatch);
                self.complete(target, &submitted, &output, now, &mut reports)?
            }
            Ok(BackendAck::Failed { message }) => {
                self.metrics.incr(Counter::DispatchFailure);
                self.fail(target, &submitted, json!({"error": message}), now, &mut reports)?
            }
            Err(e) => {
                self.metrics.incr(Counter::DispatchFailure);
                warn!("backend dispatch of {target} failed: {}", e.debug_message());
                self.fail(target,
                          &submitted,
                          json!({"error": e.public_message(), "transient": true}),
                          now,
                          &mut reports)?
            }
        };
        self.respond(own, target, settled, reports)
    }

    /// Post-proceso local y paso a "done". Si el post-proceso falla el
    /// trabajo termina en "failed".
    fn complete(&self,
                key: &RecordKey,
                from: &StatusDocument,
                backend_details: &Value,
                now: DateTime<Utc>,
                reports: &mut Vec<NotificationReport>)
                -> DispatchResult<StatusDocument> {
        let output = match self.finalizer.finalize(key, backend_details) {
            Ok(output) => output,
            Err(e) => {
                warn!("finalizing {key} failed: {}", e.debug_message());
                return self.fail(key, from, json!({"error": e.public_message(), "stage": "finalize"}), now, reports);
            }
        };
        self.store.write_output(key, &OutputSnapshot { written_at: now, output })?;
        let done = from.advanced(JobStatus::Done, now, backend_details.clone());
        self.store.write_status(key, &done)?;
        self.store.release_dispatch(key)?;
        self.offer(key, from, &done, reports);
        Ok(done)
    }

    fn fail(&self,
            key: &RecordKey,
            from: &StatusDocument,
            details: Value,
            now: DateTime<Utc>,
            reports: &mut Vec<NotificationReport>)
            -> DispatchResult<StatusDocument> {
        let failed = from.advanced(JobStatus::Failed, now, details);
        self.store.write_status(key, &failed)?;
        self.store.release_dispatch(key)?;
        self.offer(key, from, &failed, reports);
        Ok(failed)
    }

    /// Fuente terminal con éxito: el registro propio pasa a "done" con una
    /// copia del output.
    fn adopt_output(&self,
                    own: &RecordKey,
                    source: &RecordKey,
                    snapshot: OutputSnapshot,
                    now: DateTime<Utc>)
                    -> DispatchResult<DispatchResponse> {
        let mut reports = vec![];
        let doc = self.store.read_status(own)?;
        self.store.write_output(own,
                                &OutputSnapshot { written_at: now,
                                                  output: snapshot.output })?;
        let done = doc.advanced(JobStatus::Done, now, json!({"copied_from": source.to_string()}));
        self.store.write_status(own, &done)?;
        self.offer(own, &doc, &done, &mut reports);
        info!("{own} reused output of {source}");
        self.respond(own, own, done, reports)
    }

    /// Ofrece la transición ya escrita a la gate. Nada de lo que ocurra aquí
    /// revierte el estado.
    fn offer(&self, key: &RecordKey, from: &StatusDocument, to: &StatusDocument, reports: &mut Vec<NotificationReport>) {
        let identity = match self.store.read_meta(key) {
            Ok(meta) => meta.identity(),
            Err(e) => {
                warn!("notification for {key} skipped, meta unreadable: {}", e.debug_message());
                return;
            }
        };
        let ctx = TransitionContext { key,
                                      previous: from.status,
                                      status: to.status,
                                      at: to.updated_at,
                                      submitted_at: to.submitted_at,
                                      identity: &identity,
                                      details: &to.details };
        reports.extend(self.gate.offer(self.store.as_ref(), &ctx));
    }

    fn respond(&self,
               own: &RecordKey,
               served_by: &RecordKey,
               doc: StatusDocument,
               notifications: Vec<NotificationReport>)
               -> DispatchResult<DispatchResponse> {
        let output = if doc.status == JobStatus::Done {
            match self.store.read_output(served_by) {
                Ok(snapshot) => snapshot.map(|s| s.output),
                // escritura concurrente: el cliente vuelve a consultar
                Err(DispatchError::OutputCorrupt(detail)) => {
                    warn!("output of {served_by} not readable yet: {detail}");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        Ok(DispatchResponse { key: own.clone(),
                              served_by: served_by.clone(),
                              status: doc.status,
                              attempt: doc.attempt,
                              output,
                              details: doc.details,
                              notifications })
    }

    fn callback_inner(&self, cb: &BackendCallback, now: DateTime<Utc>) -> DispatchResult<CallbackOutcome> {
        let key = cb.key();
        self.identity.validate_record(&cb.job_id, self.store.as_ref(), &key)?;
        if cb.status == JobStatus::New {
            return Err(DispatchError::RequestNotUnderstood("backend cannot report status 'new'".into()));
        }
        let doc = self.store.read_status(&key)?;

        // sin despacho en vuelo (alias nunca despachado o reenvío pendiente)
        if doc.status == JobStatus::New {
            warn!("ignoring callback for undispatched {key}: attempt {} status {}", cb.attempt, cb.status);
            return Ok(CallbackOutcome::Ignored { current: doc.status,
                                                 received: cb.status });
        }
        if cb.attempt < doc.attempt {
            if self.metrics.incr_and_should_log(Counter::StaleCallback) {
                warn!("stale callback for {key}: attempt {} < current {}", cb.attempt, doc.attempt);
            }
            return Ok(CallbackOutcome::Stale { attempt: cb.attempt,
                                               current: doc.attempt });
        }
        if cb.attempt > doc.attempt {
            return Err(DispatchError::RequestNotUnderstood(format!("callback for attempt {} but only {} dispatched",
                                                                   cb.attempt, doc.attempt)));
        }

        let mut reports = vec![];
        if !doc.status.can_advance_to(cb.status) {
            if doc.status == cb.status && cb.status.is_terminal() {
                // no se reescribe el estado; la gate registra el duplicado
                let redelivered = doc.advanced(cb.status, now, cb.details.clone());
                self.offer(&key, &doc, &redelivered, &mut reports);
                return Ok(CallbackOutcome::DuplicateTerminal { status: cb.status,
                                                               notifications: reports });
            }
            warn!("ignoring callback for {key}: {} -> {}", doc.status, cb.status);
            return Ok(CallbackOutcome::Ignored { current: doc.status,
                                                 received: cb.status });
        }

        let next = match cb.status {
            JobStatus::Done => self.complete(&key, &doc, &cb.details, now, &mut reports)?,
            JobStatus::Failed => self.fail(&key, &doc, cb.details.clone(), now, &mut reports)?,
            status => {
                if status == JobStatus::Progress {
                    self.store.append_progress(&key,
                                               &ProgressEntry { attempt: doc.attempt,
                                                                at: now,
                                                                details: cb.details.clone() })?;
                }
                let next = doc.advanced(status, now, cb.details.clone());
                self.store.write_status(&key, &next)?;
                self.offer(&key, &doc, &next, &mut reports);
                next
            }
        };
        info!("callback applied {key}: {} -> {}", doc.status, next.status);
        Ok(CallbackOutcome::Applied { status: next.status,
                                      notifications: reports })
    }
}
