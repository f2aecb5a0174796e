
use std::sync::Arc;

use chrono::{Duration, Utc};
use dispatch_core::{BackendCallback, CallbackOutcome, DispatchClaim, DispatchError, DispatchRequest,
                    DispatchStateMachine, JobStatus, JobStore, NotificationEvent, NotificationOutcome,
                    OutputSnapshot, ProgressEntry, RecordMeta, RequestParameters, ScriptedBackend, StatusDocument,
                    UserIdentity};
use dispatch_policies::{RecordingChannel, ThrottleEngine, ThrottlePolicy};
use serde_json::json;
use test_support::{fresh_key, uuid_hex16, with_store};

fn create(store: &dyn JobStore, key: &dispatch_core::RecordKey) {
    let now = Utc::now();
    store.create(&RecordMeta::new(key.clone(), now), &StatusDocument::new(now)).unwrap();
}

#[test]
fn create_is_exclusive_and_documents_roundtrip() {
    with_store(|store| {
        let k = fresh_key(None);
        create(store, &k);
        let again = store.create(&RecordMeta::new(k.clone(), Utc::now()), &StatusDocument::new(Utc::now()));
        assert!(matches!(again, Err(DispatchError::AlreadyExists(_))));

        // sin snapshot de parámetros todavía
        assert!(matches!(store.read_parameters(&k), Err(DispatchError::StoreConsistency { .. })));
        let params = RequestParameters::new().with("instrument", "isgri").with("scw", json!(["1", "2"]));
        store.write_parameters(&k, &params).unwrap();
        assert_eq!(store.read_parameters(&k).unwrap(), params);

        let mut doc = store.read_status(&k).unwrap();
        doc.status = JobStatus::Submitted;
        doc.attempt = 1;
        doc.submitted_at = Some(doc.updated_at);
        store.write_status(&k, &doc).unwrap();
        assert_eq!(store.read_status(&k).unwrap().status, JobStatus::Submitted);

        let missing = fresh_key(None);
        assert!(matches!(store.read_meta(&missing), Err(DispatchError::NoRecordFound { .. })));
        assert!(matches!(store.write_status(&missing, &doc), Err(DispatchError::NoRecordFound { .. })));
        assert!(matches!(store.list_progress(&missing), Err(DispatchError::NoRecordFound { .. })));
    });
}

#[test]
fn output_rotates_and_logs_are_ordered() {
    with_store(|store| {
        let k = fresh_key(None);
        create(store, &k);
        assert!(store.read_output(&k).unwrap().is_none());
        let t0 = Utc::now();
        let first = OutputSnapshot { written_at: t0,
                                     output: json!({"image": "v1"}) };
        let second = OutputSnapshot { written_at: t0 + Duration::seconds(5),
                                      output: json!({"image": "v2"}) };
        store.write_output(&k, &first).unwrap();
        store.write_output(&k, &second).unwrap();
        assert_eq!(store.read_output(&k).unwrap().unwrap().output, second.output);
        let log = store.list_output_log(&k).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].output, first.output);

        for i in 0..3 {
            store.append_progress(&k,
                                  &ProgressEntry { attempt: 1,
                                                   at: t0 + Duration::seconds(i),
                                                   details: json!({"step": i}) })
                 .unwrap();
        }
        let steps: Vec<i64> = store.list_progress(&k)
                                   .unwrap()
                                   .iter()
                                   .map(|p| p.details["step"].as_i64().unwrap())
                                   .collect();
        assert_eq!(steps, vec![0, 1, 2]);

        let sent = NotificationEvent { status: JobStatus::Submitted,
                                       timestamp: t0,
                                       outcome: NotificationOutcome::Sent,
                                       reason: "first".into() };
        let suppressed = NotificationEvent { status: JobStatus::Submitted,
                                             timestamp: t0 + Duration::seconds(1),
                                             outcome: NotificationOutcome::Suppressed,
                                             reason: "interval".into() };
        store.append_history(&k, "email", &sent).unwrap();
        store.append_history(&k, "email", &suppressed).unwrap();
        assert_eq!(store.list_history_events(&k, "email").unwrap().len(), 2);
        assert_eq!(store.list_history(&k, "email", JobStatus::Submitted).unwrap().len(), 1);
        assert!(store.list_history(&k, "chat", JobStatus::Submitted).unwrap().is_empty());
    });
}

#[test]
fn claims_allow_a_single_live_holder() {
    with_store(|store| {
        let job = uuid_hex16();
        let a = fresh_key(Some(&job));
        let b = fresh_key(Some(&job));
        create(store, &a);
        create(store, &b);
        let mut found = store.records_for_job(&a.job_id).unwrap();
        found.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(found, expected);

        let mut doc = store.read_status(&a).unwrap();
        doc.status = JobStatus::Submitted;
        store.write_status(&a, &doc).unwrap();
        assert_eq!(store.claim_dispatch(&a).unwrap(), DispatchClaim::Granted);
        assert_eq!(store.claim_dispatch(&a).unwrap(), DispatchClaim::Granted);
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Held(a.clone()));

        store.release_dispatch(&b).unwrap();
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Held(a.clone()));

        doc.status = JobStatus::Failed;
        store.write_status(&a, &doc).unwrap();
        assert_eq!(store.claim_dispatch(&b).unwrap(), DispatchClaim::Granted);
        store.release_dispatch(&b).unwrap();
    });
}

#[test]
fn dispatch_lifecycle_on_postgres() {
    with_store(|store| {
        let store: Arc<dyn JobStore> = Arc::new(dispatch_persistence::PgJobStore::new(store.provider.clone()));
        let email = Arc::new(RecordingChannel::email());
        let engine = ThrottleEngine::new(ThrottlePolicy { done_threshold_secs: None,
                                                          ..ThrottlePolicy::default() }).with_channel(email.clone());
        let machine = DispatchStateMachine::builder(store.clone(), Arc::new(ScriptedBackend::new())).gate(Arc::new(engine))
                                                                                                     .build();
        let alice = UserIdentity::user("alice").with_email("alice@example.org");
        // parámetro único para no chocar con ejecuciones previas sobre la misma base
        let params = RequestParameters::new().with("instrument", "isgri").with("run", uuid_hex16());

        let resp = machine.handle_request(DispatchRequest::new(params, alice)).unwrap();
        assert_eq!(resp.status, JobStatus::Submitted);
        let done = BackendCallback::new(&resp.key, 1, JobStatus::Done, json!({"image": "mosaic.fits"}));
        assert!(matches!(machine.on_backend_status(done.clone()).unwrap(), CallbackOutcome::Applied { .. }));
        assert!(matches!(machine.on_backend_status(done).unwrap(), CallbackOutcome::DuplicateTerminal { .. }));

        assert_eq!(store.read_status(&resp.key).unwrap().status, JobStatus::Done);
        assert_eq!(store.read_output(&resp.key).unwrap().unwrap().output["image"], "mosaic.fits");
        assert_eq!(email.sent_statuses(), vec![JobStatus::Submitted, JobStatus::Done]);
    });
}
