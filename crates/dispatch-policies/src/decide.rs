//! Decisión enviar/suprimir para una transición, a partir del historial de
//! notificaciones **enviadas** del registro.

use chrono::{DateTime, Duration, Utc};
use dispatch_core::{DispatchResult, JobStatus, JobStore, RecordKey};

use crate::policy::ThrottlePolicy;

/// Transición a evaluar.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionInput {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    /// Tiempo de proceso desde el despacho, si se conoce.
    pub elapsed: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    /// La política del usuario/canal no notifica este estado.
    Disabled,
    /// Dentro del intervalo mínimo desde el último "submitted" enviado.
    Interval,
    /// "done" más rápido que el umbral de tiempo de proceso.
    BelowThreshold,
    /// El canal no tiene destinatario para esta identidad.
    NoRecipient,
}

impl SuppressReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Interval => "interval",
            Self::BelowThreshold => "below-threshold",
            Self::NoRecipient => "no-recipient",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Send { reason: &'static str },
    Suppress(SuppressReason),
    /// Estado terminal ya notificado para este registro.
    DuplicateTerminal,
}

impl ThrottleDecision {
    pub fn reason(&self) -> &'static str {
        match *self {
            Self::Send { reason } => reason,
            Self::Suppress(r) => r.as_str(),
            Self::DuplicateTerminal => "terminal-already-decided",
        }
    }
}

/// Decide leyendo del store los envíos previos de `channel` para el estado.
pub fn decide(store: &dyn JobStore,
              key: &RecordKey,
              channel: &str,
              input: &DecisionInput,
              policy: &ThrottlePolicy)
              -> DispatchResult<ThrottleDecision> {
    let prior = if input.status.is_terminal() {
        // un estado terminal se decide una sola vez por canal, se haya enviado o no
        store.list_history_events(key, channel)?
             .into_iter()
             .filter(|e| e.status == input.status)
             .map(|e| e.timestamp)
             .collect()
    } else {
        store.list_history(key, channel, input.status)?
    };
    Ok(decide_from_sent(&prior, input, policy))
}

/// Núcleo puro de la decisión. `sent` son los timestamps de notificaciones
/// enviadas para `input.status`; para estados terminales `decide` pasa
/// cualquier decisión previa (enviada, suprimida o fallida).
pub fn decide_from_sent(sent: &[DateTime<Utc>], input: &DecisionInput, policy: &ThrottlePolicy) -> ThrottleDecision {
    if input.status.is_terminal() && !sent.is_empty() {
        return ThrottleDecision::DuplicateTerminal;
    }
    if !policy.is_enabled(input.status) {
        return ThrottleDecision::Suppress(SuppressReason::Disabled);
    }
    match input.status {
        JobStatus::Submitted => match sent.iter().max() {
            None => ThrottleDecision::Send { reason: "first" },
            Some(last) if input.at - *last >= Duration::seconds(policy.submitted_interval_secs) => {
                ThrottleDecision::Send { reason: "interval-elapsed" }
            }
            Some(_) => ThrottleDecision::Suppress(SuppressReason::Interval),
        },
        JobStatus::Done => match (policy.done_threshold_secs, input.elapsed) {
            (None, _) => ThrottleDecision::Send { reason: "terminal" },
            (Some(threshold), Some(elapsed)) if elapsed > Duration::seconds(threshold) => {
                ThrottleDecision::Send { reason: "terminal-after-threshold" }
            }
            _ => ThrottleDecision::Suppress(SuppressReason::BelowThreshold),
        },
        _ => ThrottleDecision::Send { reason: "terminal" },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(mins: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(mins)
    }

    fn input(status: JobStatus, mins: i64, elapsed_mins: Option<i64>) -> DecisionInput {
        DecisionInput { status,
                        at: at(mins),
                        elapsed: elapsed_mins.map(Duration::minutes) }
    }

    #[test]
    fn submitted_is_rate_limited_from_last_sent() {
        let p = ThrottlePolicy { submitted_interval_secs: 600,
                                 ..ThrottlePolicy::default() };
        assert_eq!(decide_from_sent(&[], &input(JobStatus::Submitted, 0, None), &p),
                   ThrottleDecision::Send { reason: "first" });
        let sent = [at(0)];
        assert_eq!(decide_from_sent(&sent, &input(JobStatus::Submitted, 9, None), &p),
                   ThrottleDecision::Suppress(SuppressReason::Interval));
        assert_eq!(decide_from_sent(&sent, &input(JobStatus::Submitted, 10, None), &p),
                   ThrottleDecision::Send { reason: "interval-elapsed" });
    }

    #[test]
    fn terminal_statuses_send_once() {
        let p = ThrottlePolicy::default();
        assert!(matches!(decide_from_sent(&[], &input(JobStatus::Failed, 1, Some(1)), &p),
                         ThrottleDecision::Send { .. }));
        assert_eq!(decide_from_sent(&[at(1)], &input(JobStatus::Failed, 2, Some(2)), &p),
                   ThrottleDecision::DuplicateTerminal);
    }

    #[test]
    fn done_respects_processing_threshold() {
        let p = ThrottlePolicy { done_threshold_secs: Some(1800),
                                 ..ThrottlePolicy::default() };
        assert_eq!(decide_from_sent(&[], &input(JobStatus::Done, 5, Some(5)), &p),
                   ThrottleDecision::Suppress(SuppressReason::BelowThreshold));
        assert_eq!(decide_from_sent(&[], &input(JobStatus::Done, 5, None), &p),
                   ThrottleDecision::Suppress(SuppressReason::BelowThreshold));
        assert!(matches!(decide_from_sent(&[], &input(JobStatus::Done, 45, Some(45)), &p),
                         ThrottleDecision::Send { .. }));

        let untimed = ThrottlePolicy { done_threshold_secs: None,
                                       ..ThrottlePolicy::default() };
        assert!(matches!(decide_from_sent(&[], &input(JobStatus::Done, 1, Some(1)), &untimed),
                         ThrottleDecision::Send { .. }));
    }

    #[test]
    fn disabled_status_is_suppressed() {
        let p = ThrottlePolicy { notify_submitted: false,
                                 ..ThrottlePolicy::default() };
        assert_eq!(decide_from_sent(&[], &input(JobStatus::Submitted, 0, None), &p),
                   ThrottleDecision::Suppress(SuppressReason::Disabled));
        assert_eq!(decide_from_sent(&[], &input(JobStatus::Progress, 0, None), &p),
                   ThrottleDecision::Suppress(SuppressReason::Disabled));
    }
}
