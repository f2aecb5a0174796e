//! Implementación Postgres (Diesel) del `JobStore` del núcleo.
//!
//! Paridad 1:1 con los backends en memoria y de ficheros:
//! - una fila por registro en `job_records` (meta, parámetros, documento de
//!   estado y output actual como JSONB);
//! - progreso, outputs rotados e historial de notificaciones en tablas
//!   append-only ordenadas por `seq` (BIGSERIAL);
//! - el claim de despacho por JobID se decide dentro de una transacción
//!   `SERIALIZABLE`, de modo que dos procesos no pueden despachar el mismo
//!   JobID a la vez.
//!
//! Los errores transitorios (conflictos de serialización, pool) se reintentan
//! con backoff corto.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use dispatch_core::{DispatchClaim, DispatchError, DispatchResult, JobId, JobStatus, JobStore, NotificationEvent,
                    OutputSnapshot, ProgressEntry, RecordKey, RecordMeta, RequestParameters, SessionId,
                    StatusDocument};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{dispatch_claims, job_outputs, job_progress, job_records, notification_history};

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Contrato: devuelve una conexión válida o `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

/// `ConnectionProvider` respaldado por un `PgPool`.
#[derive(Clone)]
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Fila de `job_records`.
#[derive(Queryable, Debug)]
pub struct RecordRow {
    pub session_id: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub meta: Value,
    pub params: Option<Value>,
    pub status: String,
    pub status_doc: Value,
    pub updated_at: DateTime<Utc>,
    pub output: Option<Value>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = job_records)]
pub struct NewRecordRow<'a> {
    pub session_id: &'a str,
    pub job_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub meta: &'a Value,
    pub status: &'a str,
    pub status_doc: &'a Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = job_progress)]
pub struct NewProgressRow<'a> {
    pub session_id: &'a str,
    pub job_id: &'a str,
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub details: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = job_outputs)]
pub struct NewOutputRow<'a> {
    pub session_id: &'a str,
    pub job_id: &'a str,
    pub written_at: DateTime<Utc>,
    pub output: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = notification_history)]
pub struct NewHistoryRow<'a> {
    pub session_id: &'a str,
    pub job_id: &'a str,
    pub channel: &'a str,
    pub status: &'a str,
    pub ts: DateTime<Utc>,
    pub event: &'a Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = dispatch_claims)]
pub struct NewClaimRow<'a> {
    pub job_id: &'a str,
    pub session_id: &'a str,
    pub claimed_at: DateTime<Utc>,
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        // algunos drivers entregan estos casos como texto
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry simple con backoff lineal (hasta 3 reintentos: 15ms, 30ms, 45ms).
/// Emite `warn!` por intento.
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn not_found(key: &RecordKey) -> DispatchError {
    DispatchError::NoRecordFound { job_id: key.job_id.to_string() }
}

/// Traduce un error de persistencia en el contexto de un registro concreto.
fn on_record(key: &RecordKey, err: PersistenceError) -> DispatchError {
    match err {
        PersistenceError::NotFound | PersistenceError::ForeignKeyViolation(_) => not_found(key),
        other => other.into(),
    }
}

fn encode<T: Serialize>(key: &RecordKey, value: &T) -> DispatchResult<Value> {
    serde_json::to_value(value).map_err(|e| DispatchError::Storage(format!("{key}: encode: {e}")))
}

fn decode<T: DeserializeOwned>(key: &RecordKey, what: &str, value: Value) -> DispatchResult<T> {
    serde_json::from_value(value).map_err(|e| DispatchError::consistency(key.to_string(), format!("{what} undecodable: {e}")))
}

fn parse_key(session_id: &str, job_id: &str) -> DispatchResult<RecordKey> {
    Ok(RecordKey::new(SessionId::parse(session_id)?, JobId::parse(job_id)?))
}

/// `NotFound` si el registro no existe.
fn require_record(conn: &mut PgConnection, key: &RecordKey) -> Result<(), PersistenceError> {
    let n: i64 = job_records::table.filter(job_records::session_id.eq(key.session_id.as_str()))
                                   .filter(job_records::job_id.eq(key.job_id.as_str()))
                                   .count()
                                   .get_result(conn)?;
    if n == 0 {
        return Err(PersistenceError::NotFound);
    }
    Ok(())
}

/// `JobStore` sobre Postgres.
pub struct PgJobStore<P: ConnectionProvider = PoolProvider> {
    pub provider: P,
}

impl PgJobStore<PoolProvider> {
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(PoolProvider { pool })
    }
}

impl<P: ConnectionProvider> PgJobStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Actualiza una fila de `job_records`; `NoRecordFound` si no había.
    fn update_record<F>(&self, key: &RecordKey, mut f: F) -> DispatchResult<()>
        where F: FnMut(&mut PgConnection) -> Result<usize, PersistenceError>
    {
        let updated = with_retry(|| {
                          let mut conn = self.provider.connection()?;
                          f(&mut conn)
                      }).map_err(|e| on_record(key, e))?;
        if updated == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }

    fn read_column<T, F>(&self, key: &RecordKey, mut f: F) -> DispatchResult<T>
        where F: FnMut(&mut PgConnection) -> Result<Option<T>, PersistenceError>
    {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            f(&mut conn)
        }).map_err(|e| on_record(key, e))?
          .ok_or_else(|| not_found(key))
    }
}

impl<P: ConnectionProvider> JobStore for PgJobStore<P> {
    fn create(&self, meta: &RecordMeta, initial: &StatusDocument) -> DispatchResult<()> {
        let key = &meta.key;
        let meta_v = encode(key, meta)?;
        let status_v = encode(key, initial)?;
        let row = NewRecordRow { session_id: key.session_id.as_str(),
                                 job_id: key.job_id.as_str(),
                                 created_at: meta.created_at,
                                 meta: &meta_v,
                                 status: initial.status.as_str(),
                                 status_doc: &status_v,
                                 updated_at: initial.updated_at };
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(job_records::table).values(&row).execute(&mut conn)?;
            Ok(())
        }).map_err(|e| match e {
              PersistenceError::UniqueViolation(_) => DispatchError::AlreadyExists(key.to_string()),
              other => other.into(),
          })?;
        debug!("create key={key}");
        Ok(())
    }

    fn read_meta(&self, key: &RecordKey) -> DispatchResult<RecordMeta> {
        let v = self.read_column(key, |conn| {
                        Ok(job_records::table.find((key.session_id.as_str(), key.job_id.as_str()))
                                             .select(job_records::meta)
                                             .first::<Value>(conn)
                                             .optional()?)
                    })?;
        decode(key, "meta", v)
    }

    fn write_meta(&self, meta: &RecordMeta) -> DispatchResult<()> {
        let key = &meta.key;
        let v = encode(key, meta)?;
        self.update_record(key, |conn| {
                Ok(diesel::update(job_records::table.find((key.session_id.as_str(), key.job_id.as_str())))
                   .set(job_records::meta.eq(&v))
                   .execute(conn)?)
            })
    }

    fn write_parameters(&self, key: &RecordKey, params: &RequestParameters) -> DispatchResult<()> {
        let v = params.to_value();
        self.update_record(key, |conn| {
                Ok(diesel::update(job_records::table.find((key.session_id.as_str(), key.job_id.as_str())))
                   .set(job_records::params.eq(Some(&v)))
                   .execute(conn)?)
            })
    }

    fn read_parameters(&self, key: &RecordKey) -> DispatchResult<RequestParameters> {
        let v = self.read_column(key, |conn| {
                        Ok(job_records::table.find((key.session_id.as_str(), key.job_id.as_str()))
                                             .select(job_records::params)
                                             .first::<Option<Value>>(conn)
                                             .optional()?)
                    })?
                    .ok_or_else(|| DispatchError::consistency(key.to_string(), "record has no parameters snapshot"))?;
        RequestParameters::from_value(v).map_err(|e| {
                                            DispatchError::consistency(key.to_string(),
                                                                       format!("parameters undecodable: {e}"))
                                        })
    }

    fn write_status(&self, key: &RecordKey, doc: &StatusDocument) -> DispatchResult<()> {
        let v = encode(key, doc)?;
        self.update_record(key, |conn| {
                Ok(diesel::update(job_records::table.find((key.session_id.as_str(), key.job_id.as_str())))
                   .set((job_records::status.eq(doc.status.as_str()),
                         job_records::status_doc.eq(&v),
                         job_records::updated_at.eq(doc.updated_at)))
                   .execute(conn)?)
            })
    }

    fn read_status(&self, key: &RecordKey) -> DispatchResult<StatusDocument> {
        let v = self.read_column(key, |conn| {
                        Ok(job_records::table.find((key.session_id.as_str(), key.job_id.as_str()))
                                             .select(job_records::status_doc)
                                             .first::<Value>(conn)
                                             .optional()?)
                    })?;
        decode(key, "status", v)
    }

    fn write_output(&self, key: &RecordKey, snapshot: &OutputSnapshot) -> DispatchResult<()> {
        let v = encode(key, snapshot)?;
        let (s, j) = (key.session_id.as_str(), key.job_id.as_str());
        // rotación y escritura en la misma transacción
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| {
                                                     let current: Option<Value> =
                                                         job_records::table.find((s, j))
                                                                           .select(job_records::output)
                                                                           .for_update()
                                                                           .first::<Option<Value>>(tx)
                                                                           .optional()?
                                                                           .ok_or(PersistenceError::NotFound)?;
                                                     if let Some(prev) = current {
                                                         let prev: OutputSnapshot = serde_json::from_value(prev)?;
                                                         diesel::insert_into(job_outputs::table)
                                                             .values(NewOutputRow { session_id: s,
                                                                                    job_id: j,
                                                                                    written_at: prev.written_at,
                                                                                    output: &prev.output })
                                                             .execute(tx)?;
                                                     }
                                                     diesel::update(job_records::table.find((s, j)))
                                                         .set(job_records::output.eq(Some(&v)))
                                                         .execute(tx)?;
                                                     Ok::<_, PersistenceError>(())
                                                 })
        }).map_err(|e| on_record(key, e))
    }

    fn read_output(&self, key: &RecordKey) -> DispatchResult<Option<OutputSnapshot>> {
        let v = self.read_column(key, |conn| {
                        Ok(job_records::table.find((key.session_id.as_str(), key.job_id.as_str()))
                                             .select(job_records::output)
                                             .first::<Option<Value>>(conn)
                                             .optional()?)
                    })?;
        v.map(|v| serde_json::from_value(v).map_err(|e| DispatchError::OutputCorrupt(format!("{key}: {e}"))))
         .transpose()
    }

    fn list_output_log(&self, key: &RecordKey) -> DispatchResult<Vec<OutputSnapshot>> {
        let rows: Vec<(DateTime<Utc>, Value)> = with_retry(|| {
                                                    let mut conn = self.provider.connection()?;
                                                    require_record(&mut conn, key)?;
                                                    Ok(job_outputs::table.filter(job_outputs::session_id.eq(key.session_id.as_str()))
                                                                         .filter(job_outputs::job_id.eq(key.job_id.as_str()))
                                                                         .order(job_outputs::seq.asc())
                                                                         .select((job_outputs::written_at, job_outputs::output))
                                                                         .load(&mut conn)?)
                                                }).map_err(|e| on_record(key, e))?;
        Ok(rows.into_iter()
               .map(|(written_at, output)| OutputSnapshot { written_at, output })
               .collect())
    }

    fn append_progress(&self, key: &RecordKey, entry: &ProgressEntry) -> DispatchResult<()> {
        let row = NewProgressRow { session_id: key.session_id.as_str(),
                                   job_id: key.job_id.as_str(),
                                   attempt: i32::try_from(entry.attempt).unwrap_or(i32::MAX),
                                   at: entry.at,
                                   details: &entry.details };
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(job_progress::table).values(&row).execute(&mut conn)?;
            Ok(())
        }).map_err(|e| on_record(key, e))
    }

    fn list_progress(&self, key: &RecordKey) -> DispatchResult<Vec<ProgressEntry>> {
        let rows: Vec<(i32, DateTime<Utc>, Value)> =
            with_retry(|| {
                let mut conn = self.provider.connection()?;
                require_record(&mut conn, key)?;
                Ok(job_progress::table.filter(job_progress::session_id.eq(key.session_id.as_str()))
                                      .filter(job_progress::job_id.eq(key.job_id.as_str()))
                                      .order(job_progress::seq.asc())
                                      .select((job_progress::attempt, job_progress::at, job_progress::details))
                                      .load(&mut conn)?)
            }).map_err(|e| on_record(key, e))?;
        Ok(rows.into_iter()
               .map(|(attempt, at, details)| ProgressEntry { attempt: u32::try_from(attempt).unwrap_or(0),
                                                             at,
                                                             details })
               .collect())
    }

    fn append_history(&self, key: &RecordKey, channel: &str, event: &NotificationEvent) -> DispatchResult<()> {
        let v = encode(key, event)?;
        let row = NewHistoryRow { session_id: key.session_id.as_str(),
                                  job_id: key.job_id.as_str(),
                                  channel,
                                  status: event.status.as_str(),
                                  ts: event.timestamp,
                                  event: &v };
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(notification_history::table).values(&row).execute(&mut conn)?;
            Ok(())
        }).map_err(|e| on_record(key, e))
    }

    fn list_history_events(&self, key: &RecordKey, channel: &str) -> DispatchResult<Vec<NotificationEvent>> {
        let rows: Vec<Value> = with_retry(|| {
                                   let mut conn = self.provider.connection()?;
                                   require_record(&mut conn, key)?;
                                   Ok(notification_history::table
                                          .filter(notification_history::session_id.eq(key.session_id.as_str()))
                                          .filter(notification_history::job_id.eq(key.job_id.as_str()))
                                          .filter(notification_history::channel.eq(channel))
                                          .order(notification_history::seq.asc())
                                          .select(notification_history::event)
                                          .load(&mut conn)?)
                               }).map_err(|e| on_record(key, e))?;
        rows.into_iter().map(|v| decode(key, "notification event", v)).collect()
    }

    fn list_history(&self, key: &RecordKey, channel: &str, status: JobStatus) -> DispatchResult<Vec<DateTime<Utc>>> {
        let rows: Vec<Value> = with_retry(|| {
                                   let mut conn = self.provider.connection()?;
                                   require_record(&mut conn, key)?;
                                   Ok(notification_history::table
                                          .filter(notification_history::session_id.eq(key.session_id.as_str()))
                                          .filter(notification_history::job_id.eq(key.job_id.as_str()))
                                          .filter(notification_history::channel.eq(channel))
                                          .filter(notification_history::status.eq(status.as_str()))
                                          .order(notification_history::seq.asc())
                                          .select(notification_history::event)
                                          .load(&mut conn)?)
                               }).map_err(|e| on_record(key, e))?;
        let mut sent = vec![];
        for v in rows {
            let event: NotificationEvent = decode(key, "notification event", v)?;
            if event.is_sent() {
                sent.push(event.timestamp);
            }
        }
        Ok(sent)
    }

    fn records_for_job(&self, job_id: &JobId) -> DispatchResult<Vec<RecordKey>> {
        let rows: Vec<(String, String)> = with_retry(|| {
                                              let mut conn = self.provider.connection()?;
                                              Ok(job_records::table.filter(job_records::job_id.eq(job_id.as_str()))
                                                                   .order(job_records::created_at.asc())
                                                                   .select((job_records::session_id, job_records::job_id))
                                                                   .load(&mut conn)?)
                                          })?;
        rows.iter().map(|(s, j)| parse_key(s, j)).collect()
    }

    fn list_keys(&self) -> DispatchResult<Vec<RecordKey>> {
        let rows: Vec<(String, String)> = with_retry(|| {
                                              let mut conn = self.provider.connection()?;
                                              Ok(job_records::table.select((job_records::session_id, job_records::job_id))
                                                                   .load(&mut conn)?)
                                          })?;
        rows.iter().map(|(s, j)| parse_key(s, j)).collect()
    }

    fn claim_dispatch(&self, key: &RecordKey) -> DispatchResult<DispatchClaim> {
        let (s, j) = (key.session_id.as_str(), key.job_id.as_str());
        let holder: Option<String> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().serializable().run(|tx| {
                let holder: Option<String> = dispatch_claims::table.find(j)
                                                                   .select(dispatch_claims::session_id)
                                                                   .for_update()
                                                                   .first(tx)
                                                                   .optional()?;
                match holder {
                    None => {
                        let inserted = diesel::insert_into(dispatch_claims::table)
                            .values(NewClaimRow { job_id: j,
                                                  session_id: s,
                                                  claimed_at: Utc::now() })
                            .on_conflict_do_nothing()
                            .execute(tx)?;
                        if inserted == 0 {
                            // otro proceso lo insertó entre la lectura y la escritura
                            return Err(PersistenceError::SerializationConflict);
                        }
                        Ok(None)
                    }
                    Some(h) if h == s => Ok(None),
                    Some(h) => {
                        let status: Option<String> = job_records::table.find((h.as_str(), j))
                                                                       .select(job_records::status)
                                                                       .first(tx)
                                                                       .optional()?;
                        let released = status.map_or(true, |st| {
                                                 st.parse::<JobStatus>().map_or(true, |st| st.is_settled())
                                             });
                        if !released {
                            return Ok(Some(h));
                        }
                        diesel::update(dispatch_claims::table.find(j))
                            .set((dispatch_claims::session_id.eq(s), dispatch_claims::claimed_at.eq(Utc::now())))
                            .execute(tx)?;
                        Ok(None)
                    }
                }
            })
        })?;
        match holder {
            None => {
                debug!("claim granted key={key}");
                Ok(DispatchClaim::Granted)
            }
            Some(h) => Ok(DispatchClaim::Held(parse_key(&h, j)?)),
        }
    }

    fn release_dispatch(&self, key: &RecordKey) -> DispatchResult<()> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::delete(dispatch_claims::table.filter(dispatch_claims::job_id.eq(key.job_id.as_str()))
                                                 .filter(dispatch_claims::session_id.eq(key.session_id.as_str())))
                .execute(&mut conn)?;
            Ok(())
        })?;
        Ok(())
    }
}

/// Construye un pool Postgres r2d2 y corre las migraciones pendientes.
///
/// Si `min_size > max_size` se usa `min_size = max_size`.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Carga `.env`, lee `DbConfig` y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
