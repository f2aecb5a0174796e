//! Política de throttle por destinatario y canal.

use dispatch_core::hashing::{hash_str, to_canonical_json};
use dispatch_core::JobStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Intervalo por defecto entre notificaciones "submitted" (segundos).
pub const DEFAULT_SUBMITTED_INTERVAL_SECS: i64 = 1800;
/// Tiempo mínimo de proceso para notificar "done" (segundos).
pub const DEFAULT_DONE_THRESHOLD_SECS: i64 = 1800;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub notify_submitted: bool,
    pub notify_done: bool,
    pub notify_failed: bool,
    /// Mínimo entre "submitted" repetidos, medido desde el último **enviado**.
    pub submitted_interval_secs: i64,
    /// "done" sólo se notifica si el proceso tardó más que esto. `None`
    /// desactiva el umbral.
    pub done_threshold_secs: Option<i64>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self { notify_submitted: true,
               notify_done: true,
               notify_failed: true,
               submitted_interval_secs: DEFAULT_SUBMITTED_INTERVAL_SECS,
               done_threshold_secs: Some(DEFAULT_DONE_THRESHOLD_SECS) }
    }
}

impl ThrottlePolicy {
    /// new/progress/ready nunca se notifican.
    pub fn is_enabled(&self, status: JobStatus) -> bool {
        match status {
            JobStatus::Submitted => self.notify_submitted,
            JobStatus::Done => self.notify_done,
            JobStatus::Failed => self.notify_failed,
            JobStatus::New | JobStatus::Progress | JobStatus::Ready => false,
        }
    }

    /// Resuelve la política de `channel` a partir de los claims del usuario:
    /// `defaults`, luego claims de primer nivel, luego `notify.<channel>`.
    ///
    /// Claves: `mssub`/`msdone`/`msfail` (flags), `intsub` (segundos),
    /// `tem` (segundos), `mstout=false` desactiva el umbral de "done".
    /// Valores con tipo inesperado se ignoran.
    pub fn from_claims(claims: &Value, channel: &str, defaults: &ThrottlePolicy) -> Self {
        let mut policy = defaults.clone();
        policy.apply(claims);
        if let Some(overrides) = claims.get("notify").and_then(|n| n.get(channel)) {
            policy.apply(overrides);
        }
        policy
    }

    fn apply(&mut self, v: &Value) {
        if let Some(b) = flag(v.get("mssub")) {
            self.notify_submitted = b;
        }
        if let Some(b) = flag(v.get("msdone")) {
            self.notify_done = b;
        }
        if let Some(b) = flag(v.get("msfail")) {
            self.notify_failed = b;
        }
        if let Some(secs) = seconds(v.get("intsub")) {
            self.submitted_interval_secs = secs;
        }
        if let Some(secs) = seconds(v.get("tem")) {
            self.done_threshold_secs = Some(secs);
        }
        if flag(v.get("mstout")) == Some(false) {
            self.done_threshold_secs = None;
        }
    }

    /// Hash canónico de la política (auditoría en logs).
    pub fn policy_hash(&self) -> String {
        match serde_json::to_value(self) {
            Ok(v) => hash_str(&to_canonical_json(&v)),
            Err(_) => String::new(),
        }
    }
}

fn flag(v: Option<&Value>) -> Option<bool> {
    match v? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn seconds(v: Option<&Value>) -> Option<i64> {
    let secs = match v? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (secs >= 0).then_some(secs)
}
