//! Propiedades de identidad de trabajos y anti-falsificación.

use chrono::Utc;
use dispatch_core::{AlertLevel, BackendCallback, DispatchError, DispatchRequest, FingerprintOptions, IdentityService,
                    JobId, JobStatus, ParamsSource, RecordKey, RecordMeta, RequestParameters, SessionId, StatusDocument,
                    UserIdentity};
use serde_json::{json, Value};
use test_support::{harness, image_params};

fn permuted(params: &RequestParameters) -> RequestParameters {
    let mut pairs: Vec<(String, Value)> = params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.reverse();
    pairs.into_iter().fold(RequestParameters::new(), |p, (k, v)| p.with(k, v))
}

#[test]
fn job_id_is_stable_under_key_and_sequence_reordering() {
    let svc = IdentityService::default();
    let user = UserIdentity::user("alice");
    let id = svc.compute_job_id(&image_params(), &user);
    assert_eq!(id, svc.compute_job_id(&permuted(&image_params()), &user));

    let reordered = image_params().with("scw_list", json!(["066500230010.001", "066500220010.001"]));
    assert_eq!(id, svc.compute_job_id(&reordered, &user));
}

#[test]
fn order_sensitive_fields_can_be_opted_in() {
    let svc = IdentityService::new(FingerprintOptions::default().with_ordered_field("scw_list"));
    let reordered = image_params().with("scw_list", json!(["066500230010.001", "066500220010.001"]));
    assert_ne!(svc.compute_job_id(&image_params(), &UserIdentity::public()),
               svc.compute_job_id(&reordered, &UserIdentity::public()));
}

#[test]
fn distinct_identities_never_share_a_job_id() {
    let svc = IdentityService::default();
    let users = [UserIdentity::public(), UserIdentity::user("alice"), UserIdentity::user("bob")];
    let ids: Vec<JobId> = users.iter().map(|u| svc.compute_job_id(&image_params(), u)).collect();
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[0], ids[2]);
    assert_ne!(ids[1], ids[2]);
}

#[test]
fn any_single_field_mutation_fails_validation() {
    let svc = IdentityService::default();
    let user = UserIdentity::user("alice");
    let id = svc.compute_job_id(&image_params(), &user);
    svc.validate(&id, ParamsSource::Request(&image_params()), &user).unwrap();

    for (key, _) in image_params().iter() {
        let mutated = image_params().with(key.clone(), "tampered");
        let err = svc.validate(&id, ParamsSource::Request(&mutated), &user).unwrap_err();
        assert!(matches!(err, DispatchError::Authorization { .. }), "field {key}");
    }
    let extra = image_params().with("radius", 5);
    assert!(svc.validate(&id, ParamsSource::Request(&extra), &user).is_err());
    assert!(svc.validate(&id, ParamsSource::Request(&image_params()), &UserIdentity::user("mallory")).is_err());
}

#[test]
fn forged_job_id_on_request_mutates_nothing() {
    let h = harness();
    let forged = JobId::parse("0000000000abc123").unwrap();
    let req = DispatchRequest::new(image_params(), UserIdentity::public()).with_job_id(forged);
    let err = h.machine.handle_request(req).unwrap_err();
    assert!(matches!(err, DispatchError::Authorization { .. }));
    assert!(!err.public_message().contains("isgri"));
    assert!(h.store.list_keys().unwrap().is_empty());
    assert_eq!(h.backend.submissions(), 0);
    assert_eq!(h.alerts.messages().len(), 1);
    assert_eq!(h.machine.metrics().snapshot().authorization_failures, 1);
}

#[test]
fn forged_completion_callback_is_rejected_and_record_unchanged() {
    let h = harness();
    // registro cuyo JobID no corresponde a sus parámetros persistidos
    let key = RecordKey::new(SessionId::parse("victim").unwrap(), JobId::parse("0000000000abc123").unwrap());
    let now = Utc::now();
    h.store.create(&RecordMeta::new(key.clone(), now), &StatusDocument::new(now)).unwrap();
    h.store.write_parameters(&key, &image_params()).unwrap();
    let before = h.store.read_status(&key).unwrap();

    let cb = BackendCallback::new(&key, 1, JobStatus::Done, json!({"image": "forged"}));
    let err = h.machine.on_backend_status(cb).unwrap_err();
    assert!(matches!(err, DispatchError::Authorization { .. }));
    assert_eq!(h.store.read_status(&key).unwrap(), before);
    assert!(h.store.read_output(&key).unwrap().is_none());
    let alerts = h.alerts.messages();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, AlertLevel::Warning);
}

#[test]
fn callback_for_unknown_record_is_not_an_authorization_error() {
    let h = harness();
    let key = RecordKey::new(SessionId::generate(), JobId::parse("00000000000def45").unwrap());
    let err = h.machine.on_backend_status(BackendCallback::new(&key, 1, JobStatus::Done, json!({}))).unwrap_err();
    assert!(matches!(err, DispatchError::NoRecordFound { .. }));
    assert!(h.alerts.messages().is_empty());
}

#[test]
fn users_get_independent_executions() {
    let h = harness();
    let alice = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::user("alice"))).unwrap();
    let bob = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::user("bob"))).unwrap();
    assert_ne!(alice.key.job_id, bob.key.job_id);
    assert!(!bob.is_aliased());
    assert_eq!(h.backend.submissions(), 2);

    // bob no puede consultar el registro de alice
    let snoop = DispatchRequest::poll(&alice.key, UserIdentity::user("bob"));
    assert!(matches!(h.machine.handle_request(snoop), Err(DispatchError::Authorization { .. })));
    let own = h.machine.handle_request(DispatchRequest::poll(&alice.key, UserIdentity::user("alice"))).unwrap();
    assert_eq!(own.status, JobStatus::Submitted);
}
