//! Identidad del usuario derivada de una credencial (o pública).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identidad resuelta. `subject == None` representa al usuario público.
///
/// `claims` conserva el documento de claims original para que otras capas
/// (política de notificaciones, destinatarios) lo consuman sin reinterpretar
/// la credencial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserIdentity {
    pub subject: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claims: Value,
}

impl UserIdentity {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn user(subject: impl Into<String>) -> Self {
        Self { subject: Some(subject.into()),
               ..Self::default() }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_claims(mut self, claims: Value) -> Self {
        self.claims = claims;
        self
    }

    pub fn is_public(&self) -> bool {
        self.subject.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Etiqueta corta para logs (nunca el email completo).
    pub fn label(&self) -> &str {
        self.subject.as_deref().unwrap_or("public")
    }
}
