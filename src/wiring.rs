//! Ensamblado de la máquina de despacho a partir de `AppConfig`.
//!
//! - store: Postgres si hay `DATABASE_URL`, si no el store de ficheros;
//! - backend: spool que consume el broker externo;
//! - notificaciones: outbox si está configurado, si no sólo log.

use std::sync::Arc;

use dispatch_adapters::{LogChannel, OutboxChannel, SpoolBackend};
use dispatch_core::{Clock, DispatchConfig, DispatchError, DispatchStateMachine, FileJobStore, JobStore, SystemClock};
use dispatch_persistence::{build_pool, PersistenceError, PgJobStore};
use dispatch_policies::{NotificationChannel, ThrottleEngine, ThrottlePolicy};
use log::info;
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("store: {0}")]
    Store(#[from] DispatchError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Services {
    pub store: Arc<dyn JobStore>,
    pub spool: Arc<SpoolBackend>,
    pub machine: DispatchStateMachine,
}

pub fn build_store(cfg: &AppConfig) -> Result<Arc<dyn JobStore>, WiringError> {
    match &cfg.database {
        Some(db) => {
            info!("job store: postgres");
            let pool = build_pool(&db.url, db.min_connections, db.max_connections)?;
            Ok(Arc::new(PgJobStore::from_pool(pool)))
        }
        None => {
            info!("job store: files under {}", cfg.store_dir.display());
            Ok(Arc::new(FileJobStore::open(&cfg.store_dir)?))
        }
    }
}

pub fn build_engine(cfg: &AppConfig) -> ThrottleEngine {
    let channel: Arc<dyn NotificationChannel> = match &cfg.outbox_dir {
        Some(dir) => Arc::new(OutboxChannel::email(dir)),
        None => Arc::new(LogChannel::default()),
    };
    ThrottleEngine::new(ThrottlePolicy::default()).with_channel(channel)
}

pub fn build_services(cfg: &AppConfig) -> Result<Services, WiringError> {
    build_services_with_clock(cfg, Arc::new(SystemClock))
}

pub fn build_services_with_clock(cfg: &AppConfig, clock: Arc<dyn Clock>) -> Result<Services, WiringError> {
    let store = build_store(cfg)?;
    let spool = Arc::new(SpoolBackend::open(&cfg.spool_dir)?.with_clock(clock.clone()));
    let machine = DispatchStateMachine::builder(store.clone(), spool.clone())
        .gate(Arc::new(build_engine(cfg)))
        .clock(clock)
        .config(DispatchConfig::with_resubmit_secs(cfg.resubmit_timeout_secs))
        .build();
    Ok(Services { store,
                  spool,
                  machine })
}
