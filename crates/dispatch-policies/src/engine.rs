//! Notification Throttle Engine: implementa la `NotificationGate` del núcleo.
//!
//! Por cada canal: resuelve la política desde los claims, decide, envía si
//! corresponde y añade el evento al historial del canal. Cada canal se
//! throttlea de forma independiente.

use std::sync::Arc;

use dispatch_core::{JobStore, NotificationEvent, NotificationGate, NotificationOutcome, NotificationReport,
                    TransitionContext};
use log::{debug, info, warn};

use crate::channel::{NotificationChannel, NotificationContext};
use crate::decide::{decide, DecisionInput, SuppressReason, ThrottleDecision};
use crate::policy::ThrottlePolicy;

#[derive(Debug, Default)]
pub struct ThrottleEngine {
    defaults: ThrottlePolicy,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl ThrottleEngine {
    pub fn new(defaults: ThrottlePolicy) -> Self {
        Self { defaults,
               channels: vec![] }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    fn offer_channel(&self,
                     store: &dyn JobStore,
                     channel: &dyn NotificationChannel,
                     ctx: &TransitionContext<'_>)
                     -> Option<NotificationReport> {
        let name = channel.name();
        let policy = ThrottlePolicy::from_claims(&ctx.identity.claims, name, &self.defaults);
        let input = DecisionInput { status: ctx.status,
                                    at: ctx.at,
                                    elapsed: ctx.elapsed() };
        let decision = match decide(store, ctx.key, name, &input, &policy) {
            Ok(d) => d,
            Err(e) => {
                // sin historial no se puede garantizar "una sola vez": no se envía
                warn!("throttle[{name}] {}: history unreadable, skipping: {}", ctx.key, e.debug_message());
                return None;
            }
        };

        let (outcome, reason) = match decision {
            ThrottleDecision::Send { reason } => match channel.recipient(ctx.identity) {
                None => (NotificationOutcome::Suppressed, SuppressReason::NoRecipient.as_str()),
                Some(recipient) => {
                    let context = NotificationContext { key: ctx.key.clone(),
                                                        previous: ctx.previous,
                                                        at: ctx.at,
                                                        elapsed_secs: ctx.elapsed().map(|d| d.num_seconds()),
                                                        details: ctx.details.clone() };
                    match channel.send(&recipient, ctx.status, &context) {
                        Ok(()) => {
                            info!("notified[{name}] {} status={} ({reason})", ctx.key, ctx.status);
                            (NotificationOutcome::Sent, reason)
                        }
                        // se reporta, la transición ya está escrita y no se toca
                        Err(error) => {
                            warn!("notification[{name}] {} status={} failed: {error}", ctx.key, ctx.status);
                            (NotificationOutcome::Failed { error }, reason)
                        }
                    }
                }
            },
            ThrottleDecision::DuplicateTerminal => {
                info!("duplicate terminal notification suppressed[{name}] {} status={}", ctx.key, ctx.status);
                (NotificationOutcome::DuplicateSuppressed, decision.reason())
            }
            ThrottleDecision::Suppress(r) => {
                debug!("suppressed[{name}] {} status={} reason={} policy={}",
                       ctx.key,
                       ctx.status,
                       r.as_str(),
                       policy.policy_hash());
                (NotificationOutcome::Suppressed, r.as_str())
            }
        };

        let event = NotificationEvent { status: ctx.status,
                                        timestamp: ctx.at,
                                        outcome,
                                        reason: reason.to_string() };
        if let Err(e) = store.append_history(ctx.key, name, &event) {
            warn!("throttle[{name}] {}: could not append history: {}", ctx.key, e.debug_message());
        }
        Some(NotificationReport { channel: name.to_string(),
                                  event })
    }
}

impl NotificationGate for ThrottleEngine {
    fn offer(&self, store: &dyn JobStore, ctx: &TransitionContext<'_>) -> Vec<NotificationReport> {
        self.channels
            .iter()
            .filter_map(|c| self.offer_channel(store, c.as_ref(), ctx))
            .collect()
    }
}
