//! Resolución de credenciales opacas a `UserIdentity`.
//!
//! La verificación criptográfica de la credencial ocurre fuera del núcleo;
//! `ClaimsResolver` recibe el documento de claims ya verificado.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::errors::{DispatchError, DispatchResult};
use crate::model::UserIdentity;

pub trait CredentialResolver: Send + Sync + std::fmt::Debug {
    /// `None` => identidad pública.
    fn resolve(&self, credential: Option<&str>, now: DateTime<Utc>) -> DispatchResult<UserIdentity>;
}

/// Lee `sub`, `email`, `exp` (segundos unix) y `roles` (lista o texto separado
/// por comas). El documento completo queda en `UserIdentity::claims`.
#[derive(Debug, Clone, Default)]
pub struct ClaimsResolver;

impl CredentialResolver for ClaimsResolver {
    fn resolve(&self, credential: Option<&str>, now: DateTime<Utc>) -> DispatchResult<UserIdentity> {
        let Some(raw) = credential.filter(|c| !c.trim().is_empty()) else {
            return Ok(UserIdentity::public());
        };
        let claims: Value = serde_json::from_str(raw).map_err(|e| {
                                                          DispatchError::authorization("invalid credential",
                                                                                       format!("claims not json: {e}"))
                                                      })?;
        let subject = claims.get("sub")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .ok_or_else(|| DispatchError::authorization("invalid credential", "claims without sub"))?
                            .to_string();
        let expires_at = match claims.get("exp") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let secs = v.as_i64()
                            .ok_or_else(|| DispatchError::authorization("invalid credential", "exp is not an integer"))?;
                Some(Utc.timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| DispatchError::authorization("invalid credential", "exp out of range"))?)
            }
        };
        if let Some(exp) = expires_at {
            if exp <= now {
                return Err(DispatchError::authorization("credential expired", format!("sub={subject} exp={exp}")));
            }
        }
        let roles = match claims.get("roles") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            Some(Value::String(s)) => s.split(',')
                                       .map(str::trim)
                                       .filter(|r| !r.is_empty())
                                       .map(str::to_string)
                                       .collect(),
            _ => vec![],
        };
        let email = claims.get("email").and_then(Value::as_str).map(str::to_string);
        Ok(UserIdentity { subject: Some(subject),
                          email,
                          roles,
                          expires_at,
                          claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_credential_is_public() {
        let id = ClaimsResolver.resolve(None, Utc::now()).unwrap();
        assert!(id.is_public());
        assert!(ClaimsResolver.resolve(Some("  "), Utc::now()).unwrap().is_public());
    }

    #[test]
    fn claims_are_mapped() {
        let now = Utc::now();
        let raw = json!({"sub": "alice", "email": "alice@example.org", "exp": now.timestamp() + 3600,
                         "roles": "general, unige-hpc-full", "mssub": true})
                  .to_string();
        let id = ClaimsResolver.resolve(Some(&raw), now).unwrap();
        assert_eq!(id.subject.as_deref(), Some("alice"));
        assert_eq!(id.email.as_deref(), Some("alice@example.org"));
        assert!(id.has_role("unige-hpc-full"));
        assert_eq!(id.claims["mssub"], true);
    }

    #[test]
    fn expired_or_malformed_credentials_fail_closed() {
        let now = Utc::now();
        let expired = json!({"sub": "alice", "exp": now.timestamp() - 1}).to_string();
        assert!(matches!(ClaimsResolver.resolve(Some(&expired), now), Err(DispatchError::Authorization { .. })));
        assert!(matches!(ClaimsResolver.resolve(Some("not-json"), now), Err(DispatchError::Authorization { .. })));
        let anonymous = json!({"email": "x@example.org"}).to_string();
        assert!(matches!(ClaimsResolver.resolve(Some(&anonymous), now), Err(DispatchError::Authorization { .. })));
    }
}
