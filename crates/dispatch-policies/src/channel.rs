//! Contrato "enviar una notificación" de los canales externos.
//!
//! La entrega física (SMTP, chat...) queda fuera; aquí sólo se consume el
//! resultado enviado/fallido.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dispatch_core::{JobStatus, RecordKey, UserIdentity};
use serde::Serialize;
use serde_json::Value;

/// Destinatario resuelto para una identidad en un canal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub address: String,
}

/// De dónde saca un canal la dirección del destinatario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipientSource {
    /// `UserIdentity::email`.
    Email,
    /// Un claim de texto, p. ej. `chat_id`.
    Claim(String),
}

impl RecipientSource {
    pub fn resolve(&self, identity: &UserIdentity) -> Option<Recipient> {
        if identity.is_public() {
            return None;
        }
        let address = match self {
            Self::Email => identity.email.clone(),
            Self::Claim(name) => identity.claims.get(name).and_then(Value::as_str).map(str::to_string),
        }?;
        (!address.trim().is_empty()).then_some(Recipient { address })
    }
}

/// Contexto que acompaña a cada envío (la plantilla del mensaje es externa).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NotificationContext {
    pub key: RecordKey,
    pub previous: JobStatus,
    pub at: DateTime<Utc>,
    pub elapsed_secs: Option<i64>,
    pub details: Value,
}

pub trait NotificationChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    /// `None` => el canal no tiene a quién enviar.
    fn recipient(&self, identity: &UserIdentity) -> Option<Recipient>;
    fn send(&self, recipient: &Recipient, status: JobStatus, context: &NotificationContext) -> Result<(), String>;
}

/// Canal en memoria: guarda lo enviado y puede forzarse a fallar.
#[derive(Debug)]
pub struct RecordingChannel {
    name: String,
    source: RecipientSource,
    failing: AtomicBool,
    sent: Mutex<Vec<(Recipient, JobStatus, NotificationContext)>>,
}

impl RecordingChannel {
    pub fn new(name: impl Into<String>, source: RecipientSource) -> Self {
        Self { name: name.into(),
               source,
               failing: AtomicBool::new(false),
               sent: Mutex::new(vec![]) }
    }

    pub fn email() -> Self {
        Self::new("email", RecipientSource::Email)
    }

    pub fn chat() -> Self {
        Self::new("chat", RecipientSource::Claim("chat_id".into()))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Recipient, JobStatus, NotificationContext)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_statuses(&self) -> Vec<JobStatus> {
        self.sent().into_iter().map(|(_, s, _)| s).collect()
    }
}

impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn recipient(&self, identity: &UserIdentity) -> Option<Recipient> {
        self.source.resolve(identity)
    }

    fn send(&self, recipient: &Recipient, status: JobStatus, context: &NotificationContext) -> Result<(), String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(format!("{} unavailable", self.name));
        }
        if let Ok(mut s) = self.sent.lock() {
            s.push((recipient.clone(), status, context.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recipients_come_from_identity() {
        let alice = UserIdentity::user("alice").with_email("alice@example.org")
                                               .with_claims(json!({"chat_id": "@alice"}));
        assert_eq!(RecipientSource::Email.resolve(&alice).unwrap().address, "alice@example.org");
        assert_eq!(RecipientSource::Claim("chat_id".into()).resolve(&alice).unwrap().address, "@alice");
        assert!(RecipientSource::Email.resolve(&UserIdentity::user("bob")).is_none());
        // el usuario público nunca recibe notificaciones
        let public = UserIdentity { email: Some("anon@example.org".into()),
                                    ..UserIdentity::public() };
        assert!(RecipientSource::Email.resolve(&public).is_none());
    }
}
