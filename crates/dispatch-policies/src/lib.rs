//! dispatch-policies: Notification Throttle Engine.
//!
//! Decide, a partir del historial persistido de cada registro, si una
//! transición de estado debe notificarse por cada canal, y registra cada
//! decisión (enviada o no) con su motivo.

pub mod channel;
pub mod decide;
pub mod engine;
pub mod policy;

pub use channel::{NotificationChannel, NotificationContext, Recipient, RecipientSource, RecordingChannel};
pub use decide::{decide, decide_from_sent, DecisionInput, SuppressReason, ThrottleDecision};
pub use engine::ThrottleEngine;
pub use policy::{ThrottlePolicy, DEFAULT_DONE_THRESHOLD_SECS, DEFAULT_SUBMITTED_INTERVAL_SECS};
