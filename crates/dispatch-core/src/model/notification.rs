//! Eventos de notificación: se registran en cada decisión, enviada o no.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobStatus;

/// Resultado de una decisión del throttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent,
    /// Se intentó y el canal falló.
    Failed { error: String },
    /// Se eligió no enviar (política, intervalo, umbral...).
    Suppressed,
    /// Reintento de un estado terminal ya notificado. No es error.
    DuplicateSuppressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub outcome: NotificationOutcome,
    pub reason: String,
}

impl NotificationEvent {
    pub fn is_sent(&self) -> bool {
        matches!(self.outcome, NotificationOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tagged_outcome() {
        let ev = NotificationEvent { status: JobStatus::Done,
                                     timestamp: Utc::now(),
                                     outcome: NotificationOutcome::Failed { error: "smtp 451".into() },
                                     reason: "terminal-first".into() };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["outcome"]["kind"], "failed");
        assert_eq!(v["outcome"]["error"], "smtp 451");
        assert_eq!(v["status"], "done");
        let back: NotificationEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
