
use std::sync::Arc;
use std::thread;

use chrono::Duration;
use dispatch_core::{BackendCallback, DispatchRequest, FileJobStore, InMemoryJobStore, JobStatus, RequestParameters,
                    ScriptedBackend, UserIdentity};
use serde_json::json;
use test_support::{harness, harness_with, image_params};

#[test]
fn anonymous_duplicates_alias_to_one_execution() {
    let h = harness();
    let params = RequestParameters::new().with("instrument", "x").with("product", "y");
    let a = h.machine.handle_request(DispatchRequest::new(params.clone(), UserIdentity::public())).unwrap();
    let b = h.machine.handle_request(DispatchRequest::new(params, UserIdentity::public())).unwrap();

    assert_eq!(a.key.job_id, b.key.job_id);
    assert_ne!(a.key.session_id, b.key.session_id);
    assert!(b.is_aliased());
    assert_eq!(b.served_by, a.key);
    assert_eq!(b.status, JobStatus::Submitted);
    assert_eq!(h.backend.submissions(), 1);
    assert_eq!(h.store.read_meta(&b.key).unwrap().alias_of, Some(a.key.clone()));

    h.machine
     .on_backend_status(BackendCallback::new(&a.key, 1, JobStatus::Done, json!({"plot": "lc.png"})))
     .unwrap();

    let b_done = h.machine.handle_request(DispatchRequest::poll(&b.key, UserIdentity::public())).unwrap();
    assert_eq!(b_done.status, JobStatus::Done);
    assert!(!b_done.is_aliased());
    assert_eq!(b_done.output, Some(json!({"plot": "lc.png"})));
    assert_eq!(h.store.read_meta(&b.key).unwrap().alias_of, None);
    assert_eq!(h.backend.submissions(), 1);
}

#[test]
fn concurrent_sessions_dispatch_at_most_once() {
    let h = harness();
    let handles: Vec<_> = (0..8).map(|_| {
                                    let machine = Arc::clone(&h.machine);
                                    thread::spawn(move || {
                                        machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public()))
                                               .unwrap()
                                    })
                                })
                                .collect();
    let responses: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(h.backend.submissions(), 1);
    let holder = responses[0].served_by.clone();
    assert!(responses.iter().all(|r| r.served_by == holder));

    h.machine
     .on_backend_status(BackendCallback::new(&holder, 1, JobStatus::Done, json!({"image": "shared"})))
     .unwrap();
    for r in &responses {
        let polled = h.machine.handle_request(DispatchRequest::poll(&r.key, UserIdentity::public())).unwrap();
        assert_eq!(polled.status, JobStatus::Done);
        assert_eq!(polled.output, Some(json!({"image": "shared"})));
    }
    assert_eq!(h.backend.submissions(), 1);
}

#[test]
fn stale_alias_triggers_resubmission_under_the_original_record() {
    let h = harness();
    let a = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    h.clock.advance(Duration::minutes(45));

    let b = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    assert_eq!(b.served_by, a.key);
    assert_eq!(b.status, JobStatus::Submitted);
    assert_eq!(b.attempt, 2);
    assert_eq!(h.backend.submissions(), 2);
    assert_eq!(h.store.read_status(&a.key).unwrap().attempt, 2);
    // el registro nuevo no se despachó por su cuenta
    assert_eq!(h.store.read_status(&b.key).unwrap().status, JobStatus::New);
}

#[test]
fn failed_source_is_not_reused() {
    let h = harness_with(Arc::new(InMemoryJobStore::new()),
                         ScriptedBackend::new().then_unreachable("timeout"));
    let a = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    assert_eq!(a.status, JobStatus::Failed);

    let b = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    assert!(!b.is_aliased());
    assert_eq!(b.status, JobStatus::Submitted);
    assert_eq!(h.backend.submissions(), 2);
}

#[test]
fn aliasing_works_on_the_filesystem_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileJobStore::open(dir.path()).unwrap());
    let h = harness_with(store, ScriptedBackend::new());

    let a = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    let b = h.machine.handle_request(DispatchRequest::new(image_params(), UserIdentity::public())).unwrap();
    assert_eq!(b.served_by, a.key);
    assert_eq!(h.backend.submissions(), 1);

    h.machine
     .on_backend_status(BackendCallback::new(&a.key, 1, JobStatus::Done, json!({"image": "fs"})))
     .unwrap();
    let b_done = h.machine.handle_request(DispatchRequest::poll(&b.key, UserIdentity::public())).unwrap();
    assert_eq!(b_done.output, Some(json!({"image": "fs"})));
}
