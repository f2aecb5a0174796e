//! Punto de enganche entre la máquina de estados y el motor de throttle.
//!
//! La máquina escribe el estado y después ofrece la transición a la
//! `NotificationGate`. Lo que devuelve la gate se reporta al llamador pero
//! nunca revierte la transición.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::model::{JobStatus, NotificationEvent, RecordKey, UserIdentity};
use crate::store::JobStore;

/// Transición ya persistida que se ofrece a la gate.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    /// Registro cuyo historial gobierna el throttle (el destino tras alias).
    pub key: &'a RecordKey,
    pub previous: JobStatus,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    /// Inicio del intento actual; base del umbral de tiempo de proceso.
    pub submitted_at: Option<DateTime<Utc>>,
    pub identity: &'a UserIdentity,
    pub details: &'a Value,
}

impl TransitionContext<'_> {
    /// Tiempo de proceso transcurrido desde el despacho.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.submitted_at.map(|s| self.at - s)
    }
}

/// Decisión registrada para un canal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationReport {
    pub channel: String,
    pub event: NotificationEvent,
}

pub trait NotificationGate: Send + Sync + fmt::Debug {
    fn offer(&self, store: &dyn JobStore, ctx: &TransitionContext<'_>) -> Vec<NotificationReport>;
}

/// Gate sin canales: no decide ni registra nada.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGate;

impl NotificationGate for NoopGate {
    fn offer(&self, _store: &dyn JobStore, _ctx: &TransitionContext<'_>) -> Vec<NotificationReport> {
        vec![]
    }
}
