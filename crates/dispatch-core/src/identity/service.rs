use log::warn;
use serde_json::Value;

use crate::constants::IDENTITY_KEY;
use crate::errors::{DispatchError, DispatchResult};
use crate::hashing::{fingerprint_with, FingerprintOptions};
use crate::model::{JobId, RecordKey, RequestParameters, UserIdentity};
use crate::store::JobStore;

/// Origen de los parámetros contra los que se valida un JobID reclamado.
pub enum ParamsSource<'a> {
    /// La request en curso.
    Request(&'a RequestParameters),
    /// El snapshot persistido del registro reclamado.
    Record { store: &'a dyn JobStore, key: &'a RecordKey },
}

/// Calcula y valida JobIDs.
///
/// JobID = fingerprint(parámetros sin claves volátiles ∪ {sub: identidad}).
/// La identidad pública no añade nada, de modo que las requests anónimas
/// idénticas comparten JobID.
#[derive(Debug, Clone, Default)]
pub struct IdentityService {
    options: FingerprintOptions,
}

impl IdentityService {
    pub fn new(options: FingerprintOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FingerprintOptions {
        &self.options
    }

    pub fn compute_job_id(&self, params: &RequestParameters, identity: &UserIdentity) -> JobId {
        self.compute_for_subject(params, identity.subject.as_deref())
    }

    pub fn compute_for_subject(&self, params: &RequestParameters, subject: Option<&str>) -> JobId {
        let mut view = params.fingerprint_view();
        if let Some(sub) = subject {
            view.insert(IDENTITY_KEY.to_string(), Value::String(sub.to_string()));
        }
        JobId::from_digest(&fingerprint_with(&Value::Object(view), &self.options))
    }

    /// Recalcula el id desde `source` con la identidad del llamador y lo
    /// compara con `job_id`. Falla cerrado con `Authorization`; el mensaje de
    /// debug lista claves, nunca valores.
    pub fn validate(&self, job_id: &JobId, source: ParamsSource<'_>, identity: &UserIdentity) -> DispatchResult<()> {
        let (params, origin) = match source {
            ParamsSource::Request(p) => (p.clone(), "request".to_string()),
            ParamsSource::Record { store, key } => (store.read_parameters(key)?, format!("record {key}")),
        };
        let recomputed = self.compute_job_id(&params, identity);
        self.compare(job_id, &recomputed, &params, identity.label(), &origin)
    }

    /// Validación de callbacks del backend: siempre contra el registro
    /// persistido y con la identidad guardada al crearlo.
    pub fn validate_record(&self, job_id: &JobId, store: &dyn JobStore, key: &RecordKey) -> DispatchResult<()> {
        if key.job_id != *job_id {
            return Err(DispatchError::authorization("job id does not match record",
                                                    format!("claimed={job_id} record={key}")));
        }
        let meta = store.read_meta(key)?;
        let params = store.read_parameters(key)?;
        let recomputed = self.compute_for_subject(&params, meta.identity_subject.as_deref());
        let label = meta.identity_subject.as_deref().unwrap_or("public");
        self.compare(job_id, &recomputed, &params, label, &format!("record {key}"))
    }

    fn compare(&self,
               claimed: &JobId,
               recomputed: &JobId,
               params: &RequestParameters,
               identity_label: &str,
               origin: &str)
               -> DispatchResult<()> {
        if claimed == recomputed {
            return Ok(());
        }
        let keys: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        let debug = format!("claimed={claimed} recomputed={recomputed} identity={identity_label} source={origin} keys={keys:?}");
        warn!("job id validation failed: {debug}");
        Err(DispatchError::authorization("job id does not match the request parameters or identity", debug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecordMeta, SessionId, StatusDocument};
    use crate::store::InMemoryJobStore;
    use chrono::Utc;
    use serde_json::json;

    fn params() -> RequestParameters {
        RequestParameters::new().with("instrument", "isgri")
                                .with("product", "isgri_image")
                                .with("scw", json!(["066500220010.001", "066500230010.001"]))
    }

    #[test]
    fn job_id_ignores_volatile_keys() {
        let svc = IdentityService::default();
        let id = svc.compute_job_id(&params(), &UserIdentity::public());
        let noisy = params().with("session_id", "abc").with("dry_run", true).with("token", "t").with("query_status", "new");
        assert_eq!(id, svc.compute_job_id(&noisy, &UserIdentity::public()));
        assert_eq!(id.as_str().len(), 16);
    }

    #[test]
    fn request_supplied_sub_cannot_impersonate() {
        let svc = IdentityService::default();
        let alice = svc.compute_job_id(&params(), &UserIdentity::user("alice"));
        let forged = svc.compute_job_id(&params().with("sub", "alice"), &UserIdentity::public());
        assert_ne!(alice, forged);
    }

    #[test]
    fn validate_fails_on_any_single_field_mutation() {
        let svc = IdentityService::default();
        let alice = UserIdentity::user("alice");
        let id = svc.compute_job_id(&params(), &alice);
        assert!(svc.validate(&id, ParamsSource::Request(&params()), &alice).is_ok());

        let mutated_value = params().with("product", "isgri_spectrum");
        let extra_key = params().with("E1_keV", 20);
        for p in [mutated_value, extra_key] {
            let err = svc.validate(&id, ParamsSource::Request(&p), &alice).unwrap_err();
            assert!(matches!(err, DispatchError::Authorization { .. }));
        }
        let err = svc.validate(&id, ParamsSource::Request(&params()), &UserIdentity::user("bob")).unwrap_err();
        assert!(!err.public_message().contains("isgri"));
        assert!(!err.debug_message().contains("066500220010.001"), "debug lists keys, not values");
    }

    #[test]
    fn validate_against_persisted_record() {
        let svc = IdentityService::default();
        let store = InMemoryJobStore::new();
        let alice = UserIdentity::user("alice");
        let id = svc.compute_job_id(&params(), &alice);
        let key = RecordKey::new(SessionId::generate(), id.clone());
        let mut meta = RecordMeta::new(key.clone(), Utc::now());
        meta.identity_subject = Some("alice".into());
        store.create(&meta, &StatusDocument::new(Utc::now())).unwrap();
        store.write_parameters(&key, &params()).unwrap();

        assert!(svc.validate(&id, ParamsSource::Record { store: &store, key: &key }, &alice).is_ok());
        assert!(svc.validate_record(&id, &store, &key).is_ok());
        assert!(matches!(svc.validate(&id, ParamsSource::Record { store: &store, key: &key }, &UserIdentity::public()),
                         Err(DispatchError::Authorization { .. })));

        let missing = RecordKey::new(SessionId::generate(), id.clone());
        assert!(matches!(svc.validate_record(&id, &store, &missing),
                         Err(DispatchError::NoRecordFound { .. })));
    }
}
