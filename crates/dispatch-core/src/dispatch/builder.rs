//! Builder para `DispatchStateMachine`.
//!
//! Store y backend son obligatorios; el resto tiene valores por defecto
//! (reloj del sistema, alertas al log, sin notificaciones, post-proceso
//! passthrough, T_resub por defecto).

use std::sync::Arc;

use super::backend::{Backend, PassthroughFinalizer, ResultFinalizer};
use super::machine::{DispatchConfig, DispatchStateMachine};
use crate::alert::{AlertSink, LogAlertSink};
use crate::clock::{Clock, SystemClock};
use crate::identity::IdentityService;
use crate::metrics::DispatchMetrics;
use crate::notify::{NoopGate, NotificationGate};
use crate::store::JobStore;

pub struct DispatchBuilder {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn Backend>,
    gate: Arc<dyn NotificationGate>,
    identity: IdentityService,
    finalizer: Arc<dyn ResultFinalizer>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<DispatchMetrics>,
    config: DispatchConfig,
}

impl DispatchBuilder {
    pub fn new(store: Arc<dyn JobStore>, backend: Arc<dyn Backend>) -> Self {
        Self { store,
               backend,
               gate: Arc::new(NoopGate),
               identity: IdentityService::default(),
               finalizer: Arc::new(PassthroughFinalizer),
               clock: Arc::new(SystemClock),
               alerts: Arc::new(LogAlertSink),
               metrics: Arc::new(DispatchMetrics::new()),
               config: DispatchConfig::default() }
    }

    pub fn gate(mut self, gate: Arc<dyn NotificationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn identity(mut self, identity: IdentityService) -> Self {
        self.identity = identity;
        self
    }

    pub fn finalizer(mut self, finalizer: Arc<dyn ResultFinalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Métricas compartidas entre varias máquinas (o inspeccionadas desde
    /// fuera).
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DispatchStateMachine {
        DispatchStateMachine { store: self.store,
                               backend: self.backend,
                               gate: self.gate,
                               identity: self.identity,
                               finalizer: self.finalizer,
                               clock: self.clock,
                               alerts: self.alerts,
                               metrics: self.metrics,
                               config: self.config }
    }
}
