//! Runs requests through the complete processing pipeline.

use std::fs;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use bytes::Bytes;
use signserver::commons::crypto::cert::Extension;
use signserver::commons::crypto::cms::SignedDataInfo;
use signserver::commons::crypto::oid;
use signserver::commons::crypto::token::keystore;
use signserver::commons::crypto::tsp::{
    FailureInfo, MessageImprint, PkiStatus, TimeStampReq, TimeStampResp,
    TstInfoSummary,
};
use signserver::commons::error::Error;
use signserver::server::archive::{ArchivableKind, Archiver};
use signserver::server::context::{log_keys, RequestContext};
use signserver::server::keyusage::KeyUsageCounter;
use signserver::server::request::SignatureRequest;
use signserver::server::worker::{WorkerConfig, WorkerIdentifier, WorkerType};
use signserver::server::{Services, WorkerProcessCore, WorkerRegistry};
use signserver::test;


//------------ Helpers -------------------------------------------------------

fn keystore_props(dir: &Path, alias: &str) -> Vec<(String, String)> {
    vec![
        ("CRYPTOTOKEN".into(), "KEYSTORE".into()),
        ("KEYSTOREPATH".into(), dir.display().to_string()),
        ("KEYSTOREPASSWORD".into(), "foo123".into()),
        ("DEFAULTKEY".into(), alias.into()),
        ("AUTHTYPE".into(), "NOAUTH".into()),
    ]
}

fn config(base: Vec<(String, String)>, extra: &[(&str, &str)]) -> WorkerConfig {
    let mut config: WorkerConfig = base.into_iter().collect();
    for (key, value) in extra {
        config.set(key, *value);
    }
    config
}

fn core() -> WorkerProcessCore {
    WorkerProcessCore::new(
        Arc::new(WorkerRegistry::default()),
        Arc::new(Services::in_memory()),
    )
}

fn add_tsa(
    core: &WorkerProcessCore, dir: &Path, id: u32, name: &str,
    extra: &[(&str, &str)],
) {
    let (key, cert) = test::tsa_key_and_cert("CN=TSA,O=SignServer Test");
    keystore::write_entry(dir, "ts", &key, &[cert], "foo123").unwrap();
    let state = core.registry().add_worker(
        id, name, WorkerType::Timestamp,
        config(keystore_props(dir, "ts"), extra)
    ).unwrap();
    assert!(state.fatal_errors().is_empty(), "{:?}", state.fatal_errors());
}

fn add_cms(
    core: &WorkerProcessCore, dir: &Path, id: u32, extra: &[(&str, &str)]
) {
    let (key, cert) = test::plain_key_and_cert("CN=CMS,O=SignServer Test");
    keystore::write_entry(dir, "cms", &key, &[cert], "foo123").unwrap();
    core.registry().add_worker(
        id, "CMSSigner", WorkerType::Cms,
        config(keystore_props(dir, "cms"), extra)
    ).unwrap();
}

fn sha1_tsr() -> TimeStampReq {
    TimeStampReq::new(MessageImprint {
        hash_algorithm: oid::owned(oid::SHA1),
        hashed_message: Bytes::from(vec![0u8; 20]),
    })
}

fn tsr_with_policy(policy: &str) -> TimeStampReq {
    let mut tsr = sha1_tsr();
    tsr.req_policy = Some(oid::parse(policy).unwrap());
    tsr
}

fn process(
    core: &WorkerProcessCore, worker: impl Into<WorkerIdentifier>, data: Bytes,
) -> Result<Bytes, Error> {
    let mut context = RequestContext::new();
    core.process(
        &worker.into(), &SignatureRequest::new(1, data), &mut context
    ).map(|response| response.data().clone())
}

fn token_leases_balance(core: &WorkerProcessCore, id: u32) -> u64 {
    let state = core.registry().get(&WorkerIdentifier::Id(id)).unwrap();
    let (acquired, released) = state.token().unwrap().lease_counts();
    assert_eq!(acquired, released);
    acquired
}


//------------ Time-stamping -------------------------------------------------

#[test]
fn timestamp_with_default_config() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[("DEFAULTTSAPOLICYOID", "1.2.3.4")]);

    let resp = process(&core, "TSA", sha1_tsr().to_bytes()).unwrap();
    let resp = TimeStampResp::decode(resp).unwrap();
    assert_eq!(resp.status, PkiStatus::Granted);

    let token = SignedDataInfo::decode(resp.token.unwrap()).unwrap();
    let info = TstInfoSummary::decode(token.content.unwrap()).unwrap();
    assert_eq!(info.policy, oid::parse("1.2.3.4").unwrap());
    assert!(info.serial.len() >= 8 && info.serial.len() <= 21);
    assert_eq!(info.serial[0] & 0x80, 0);
    assert_eq!(&info.message_imprint.hashed_message[..], &[0u8; 20][..]);

    let state = core.registry().get(&WorkerIdentifier::Id(1)).unwrap();
    assert_eq!(state.stats().snapshot().completed, 1);
}

#[test]
fn extension_allow_list() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("ACCEPTEDEXTENSIONS", ""),
    ]);

    let mut with_ext = sha1_tsr();
    with_ext.extensions.push(Extension {
        oid: oid::parse("1.3.6.1.4.1.99.1").unwrap(),
        critical: false,
        value: Bytes::from_static(&[0x05, 0x00]),
    });
    let rejected = TimeStampResp::decode(
        process(&core, 1u32, with_ext.to_bytes()).unwrap()
    ).unwrap();
    assert_eq!(rejected.status, PkiStatus::Rejection);
    assert_eq!(rejected.fail_info, Some(FailureInfo::UnacceptedExtension));

    let granted = TimeStampResp::decode(
        process(&core, 1u32, sha1_tsr().to_bytes()).unwrap()
    ).unwrap();
    assert!(granted.status.is_granted());
}


//------------ CMS -----------------------------------------------------------

#[test]
fn cms_refuses_unaccepted_client_side_hash() {
    let dir = test::tmp_dir();
    let core = core();
    add_cms(&core, dir.path(), 2, &[
        ("CLIENTSIDEHASHING", "true"),
        ("ACCEPTED_HASH_DIGEST_ALGORITHMS", "SHA-256,SHA-512"),
    ]);

    let mut context = RequestContext::new()
        .with_metadata("USING_CLIENTSUPPLIED_HASH", "true")
        .with_metadata("CLIENTSIDE_HASHDIGESTALGORITHM", "SHA-1");
    let err = core.process(
        &"CMSSigner".into(),
        &SignatureRequest::new(1, Bytes::from(vec![1u8; 20])),
        &mut context,
    ).unwrap_err();
    assert!(err.is_illegal_request(), "{err}");
    assert!(!context.is_fulfilled());
    assert_eq!(token_leases_balance(&core, 2), 1);
}

#[test]
fn cms_detached_override_needs_permission() {
    let dir = test::tmp_dir();
    let core = core();
    add_cms(&core, dir.path(), 2, &[]);

    let mut context = RequestContext::new()
        .with_metadata("DETACHEDSIGNATURE", "true");
    let err = core.process(
        &WorkerIdentifier::Id(2), &SignatureRequest::new(1, "data"),
        &mut context,
    ).unwrap_err();
    assert!(err.is_illegal_request());

    let mut context = RequestContext::new()
        .with_metadata("DETACHEDSIGNATURE", "false");
    let signed = core.process(
        &WorkerIdentifier::Id(2), &SignatureRequest::new(2, "data"),
        &mut context,
    ).unwrap();
    let info = SignedDataInfo::decode(signed.data().clone()).unwrap();
    assert_eq!(info.content.as_deref(), Some(b"data".as_ref()));
}


//------------ Pipeline ------------------------------------------------------

#[test]
fn disabled_worker_is_offline_and_not_charged() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"),
        ("ACCOUNTER", "BALANCE"),
        ("ACCOUNT.alice", "1"),
        ("AUTHTYPE", "NOAUTH"),
    ]);
    let id = WorkerIdentifier::Id(1);
    core.registry().set_property(&id, "DISABLED", "TRUE").unwrap();
    core.registry().reload(&id).unwrap();

    let mut context = RequestContext::new()
        .with_credentials("alice", "secret");
    let err = core.process(
        &id, &SignatureRequest::new(1, sha1_tsr().to_bytes()), &mut context,
    ).unwrap_err();
    assert!(err.is_offline(), "{err}");

    let state = core.registry().get(&id).unwrap();
    assert_eq!(state.stats().snapshot().started, 0);
    assert_eq!(state.accounter().balance("alice"), Some(1));
    assert_eq!(token_leases_balance(&core, 1), 0);
}

#[test]
fn instances_are_released_on_every_path() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[("DEFAULTTSAPOLICYOID", "1.2.3")]);

    assert!(process(&core, 1u32, sha1_tsr().to_bytes()).is_ok());
    assert!(
        process(&core, 1u32, Bytes::new()).unwrap_err().is_illegal_request()
    );
    assert!(process(&core, 1u32, Bytes::from_static(b"garbage")).is_err());
    assert!(process(&core, 1u32, tsr_with_policy("1.9").to_bytes()).is_ok());

    assert_eq!(token_leases_balance(&core, 1), 4);
}

#[test]
fn key_usage_limit_is_enforced_concurrently() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("KEYUSAGELIMIT", "4"),
    ]);

    let handles: Vec<_> = (0..10).map(|_| {
        let core = core.clone();
        thread::spawn(move || process(&core, 1u32, sha1_tsr().to_bytes()))
    }).collect();
    let results: Vec<_> = handles.into_iter().map(|handle| {
        handle.join().unwrap()
    }).collect();

    assert_eq!(results.iter().filter(|res| res.is_ok()).count(), 4);
    for err in results.iter().filter_map(|res| res.as_ref().err()) {
        assert!(err.is_offline(), "{err}");
        assert!(err.to_string().contains("Key usage limit exceeded"));
    }
    assert_eq!(token_leases_balance(&core, 1), 10);
}

#[test]
fn unknown_worker() {
    let core = core();
    assert_eq!(
        process(&core, "nobody", Bytes::from_static(b"x")).unwrap_err(),
        Error::NoSuchWorker(WorkerIdentifier::Name("nobody".into()))
    );
}


//------------ Dispatching ---------------------------------------------------

#[test]
fn dispatch_by_policy() {
    let dir1 = test::tmp_dir();
    let dir2 = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir1.path(), 1, "TSA1", &[("DEFAULTTSAPOLICYOID", "1.2.3")]);
    add_tsa(&core, dir2.path(), 2, "TSA2", &[("DEFAULTTSAPOLICYOID", "1.2.4")]);
    core.registry().add_worker(
        3, "Dispatcher", WorkerType::Dispatcher,
        [
            ("MAPPINGS", "1.2.3:TSA1; 1.2.4:2"),
            ("AUTHTYPE", "NOAUTH"),
        ].into_iter().collect()
    ).unwrap();

    let policy_of = |policy: &str| {
        let resp = TimeStampResp::decode(
            process(&core, 3u32, tsr_with_policy(policy).to_bytes()).unwrap()
        ).unwrap();
        let token = SignedDataInfo::decode(resp.token.unwrap()).unwrap();
        TstInfoSummary::decode(token.content.unwrap()).unwrap().policy
    };
    assert_eq!(policy_of("1.2.3"), oid::parse("1.2.3").unwrap());
    assert_eq!(policy_of("1.2.4"), oid::parse("1.2.4").unwrap());

    let unknown = TimeStampResp::decode(
        process(&core, 3u32, tsr_with_policy("1.2.5").to_bytes()).unwrap()
    ).unwrap();
    assert_eq!(unknown.status, PkiStatus::Rejection);
    assert_eq!(unknown.fail_info, Some(FailureInfo::UnacceptedPolicy));

    assert_eq!(token_leases_balance(&core, 1), 1);
    assert_eq!(token_leases_balance(&core, 2), 1);
}

#[test]
fn dispatcher_refuses_same_context_twice() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[("DEFAULTTSAPOLICYOID", "1.2.3")]);
    core.registry().add_worker(
        3, "Dispatcher", WorkerType::Dispatcher,
        [("MAPPINGS", "1.2.3:TSA"), ("AUTHTYPE", "NOAUTH")]
            .into_iter().collect()
    ).unwrap();

    let request = SignatureRequest::new(1, tsr_with_policy("1.2.3").to_bytes());
    let mut context = RequestContext::new();
    let dispatcher = WorkerIdentifier::Id(3);
    assert!(core.process(&dispatcher, &request, &mut context).is_ok());
    let err = core.process(&dispatcher, &request, &mut context).unwrap_err();
    assert!(
        err.to_string().contains("Dispatcher called more than one time"),
        "{err}"
    );
    assert_eq!(token_leases_balance(&core, 1), 1);
}

#[test]
fn dispatch_loops_are_cut_off() {
    let core = core();
    core.registry().add_worker(
        3, "Loop", WorkerType::Dispatcher,
        [("MAPPINGS", "1.2.3:Loop"), ("AUTHTYPE", "NOAUTH")]
            .into_iter().collect()
    ).unwrap();

    let err = process(&core, 3u32, tsr_with_policy("1.2.3").to_bytes())
        .unwrap_err();
    assert!(err.to_string().contains("Request already dispatched"), "{err}");
}

#[test]
fn dispatcher_does_not_forward_to_dispatcher() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[("DEFAULTTSAPOLICYOID", "1.2.3")]);
    for (id, name, mapping) in [(3, "D1", "1.2.3:D2"), (4, "D2", "1.2.3:TSA")] {
        core.registry().add_worker(
            id, name, WorkerType::Dispatcher,
            [("MAPPINGS", mapping), ("AUTHTYPE", "NOAUTH")]
                .into_iter().collect()
        ).unwrap();
    }

    assert!(process(&core, "D2", tsr_with_policy("1.2.3").to_bytes()).is_ok());

    let err = process(&core, "D1", tsr_with_policy("1.2.3").to_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::SignServer(_)), "{err}");
    assert!(err.to_string().contains("Request already dispatched"), "{err}");
    assert_eq!(token_leases_balance(&core, 1), 1);
}


//------------ Archiving and logging -----------------------------------------

fn core_with_archiver(archiver: Archiver) -> WorkerProcessCore {
    WorkerProcessCore::new(
        Arc::new(WorkerRegistry::default()),
        Arc::new(Services::new(KeyUsageCounter::memory(), archiver)),
    )
}

#[test]
fn archive_ids_are_recorded() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("ARCHIVE", "TRUE"),
    ]);

    let mut context = RequestContext::new();
    let response = core.process(
        &WorkerIdentifier::Id(1),
        &SignatureRequest::new(1, sha1_tsr().to_bytes()),
        &mut context,
    ).unwrap();
    assert!(!response.archive_id().is_empty());
    assert_eq!(
        context.log().get(log_keys::ARCHIVE_IDS).as_deref(),
        Some(response.archive_id())
    );

    let items = core.services().archiver.items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].archivable.kind, ArchivableKind::Request);
    assert_eq!(items[1].archivable.kind, ArchivableKind::Response);
    for item in &items {
        assert_eq!(item.worker_id, 1);
        assert_eq!(item.transaction_id, context.transaction_id());
        assert_eq!(item.archivable.archive_id, response.archive_id());
    }
}

#[test]
fn archiving_failure_fails_the_request() {
    let dir = test::tmp_dir();
    let blocked = dir.path().join("archive");
    fs::write(&blocked, b"not a directory").unwrap();
    let core = core_with_archiver(Archiver::Disk(blocked));
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("ARCHIVE", "TRUE"),
    ]);

    assert_eq!(
        process(&core, 1u32, sha1_tsr().to_bytes()).unwrap_err(),
        Error::SignServer("Archiving failed. See server LOG.".into())
    );
    assert_eq!(token_leases_balance(&core, 1), 1);
}

#[test]
fn worker_log_failure_fails_the_request() {
    let keys = test::tmp_dir();
    let log_dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, keys.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"),
        ("WORKERLOGGER", "FILE"),
        ("LOGFILE", log_dir.path().to_str().unwrap()),
    ]);

    assert_eq!(
        process(&core, 1u32, sha1_tsr().to_bytes()).unwrap_err(),
        Error::SignServer("Logging failed".into())
    );
    assert_eq!(token_leases_balance(&core, 1), 1);
}


//------------ Charging, caching and statistics ------------------------------

#[test]
fn only_granted_time_stamps_are_charged() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"),
        ("ACCEPTEDPOLICIES", "1.2.3"),
        ("ACCOUNTER", "BALANCE"),
        ("ACCOUNT.alice", "5"),
        ("ARCHIVE", "TRUE"),
    ]);
    let charge = |tsr: TimeStampReq| {
        let mut context = RequestContext::new()
            .with_credentials("alice", "secret");
        let response = core.process(
            &WorkerIdentifier::Id(1),
            &SignatureRequest::new(1, tsr.to_bytes()),
            &mut context,
        ).unwrap();
        assert_eq!(
            context.log().get(log_keys::PURCHASED).is_some(),
            context.is_fulfilled()
        );
        TimeStampResp::decode(response.data().clone()).unwrap().status
    };
    let balance = || {
        core.registry().get(&WorkerIdentifier::Id(1)).unwrap()
            .accounter().balance("alice")
    };

    assert_eq!(charge(sha1_tsr()), PkiStatus::Granted);
    assert_eq!(balance(), Some(4));
    assert_eq!(charge(tsr_with_policy("1.9")), PkiStatus::Rejection);
    assert_eq!(balance(), Some(4));

    assert_eq!(core.services().archiver.items().len(), 4);
}

#[test]
fn cached_private_key_is_shared_until_reload() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("CACHE_PRIVATEKEY", "TRUE"),
    ]);

    for _ in 0..3 {
        assert!(process(&core, 1u32, sha1_tsr().to_bytes()).is_ok());
    }
    let before = core.registry().get(&WorkerIdentifier::Id(1)).unwrap();
    assert_eq!(before.cache().len(), 1);
    assert_eq!(token_leases_balance(&core, 1), 3);

    let token = before.token().unwrap();
    let first = token.acquire("ts", Some(before.cache())).unwrap();
    let second = token.acquire("ts", Some(before.cache())).unwrap();
    assert!(first.is_shared());
    assert!(Arc::ptr_eq(&first, &second));
    token.release(first);
    token.release(second);
    assert_eq!(before.cache().len(), 1);

    let after = core.registry().reload(&WorkerIdentifier::Id(1)).unwrap();
    assert!(after.cache().is_empty());
    assert!(process(&core, 1u32, sha1_tsr().to_bytes()).is_ok());
    assert_eq!(after.cache().len(), 1);
    assert_eq!(token_leases_balance(&core, 1), 1);
}

#[test]
fn key_usage_rejection_still_completes_the_event() {
    let dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, dir.path(), 1, "TSA", &[
        ("DEFAULTTSAPOLICYOID", "1.2.3"), ("KEYUSAGELIMIT", "1"),
    ]);

    assert!(process(&core, 1u32, sha1_tsr().to_bytes()).is_ok());
    let err = process(&core, 1u32, sha1_tsr().to_bytes()).unwrap_err();
    assert!(err.is_offline(), "{err}");
    assert!(err.to_string().contains("Key usage limit exceeded"), "{err}");

    let state = core.registry().get(&WorkerIdentifier::Id(1)).unwrap();
    let stats = state.stats().snapshot();
    assert_eq!(stats.started, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(token_leases_balance(&core, 1), 2);
}


//------------ Reloading -----------------------------------------------------

/// Reloading a worker whose keystore cannot be read yet must not hold up
/// requests to other workers.
#[cfg(unix)]
#[test]
fn reload_does_not_hold_up_other_workers() {
    let slow_dir = test::tmp_dir();
    let fast_dir = test::tmp_dir();
    let core = core();
    add_tsa(&core, slow_dir.path(), 1, "Slow", &[("DEFAULTTSAPOLICYOID", "1.2.3")]);
    add_tsa(&core, fast_dir.path(), 2, "Fast", &[("DEFAULTTSAPOLICYOID", "1.2.4")]);

    // Opening a FIFO for reading blocks until someone writes to it, so
    // activating the reloaded keystore hangs until we feed it.
    let pending = slow_dir.path().join("pending.json");
    assert!(
        std::process::Command::new("mkfifo").arg(&pending)
            .status().unwrap().success()
    );

    let reload = {
        let core = core.clone();
        thread::spawn(move || core.registry().reload(&WorkerIdentifier::Id(1)))
    };
    thread::sleep(Duration::from_millis(100));

    let (tx, rx) = mpsc::channel();
    {
        let core = core.clone();
        thread::spawn(move || {
            tx.send(process(&core, "Fast", sha1_tsr().to_bytes())).unwrap();
        });
    }
    let res = rx.recv_timeout(Duration::from_secs(10))
        .expect("request to other worker blocked by reload");
    assert!(res.is_ok(), "{:?}", res.err());
    assert!(!reload.is_finished());

    fs::write(&pending, fs::read(slow_dir.path().join("ts.json")).unwrap())
        .unwrap();
    let state = reload.join().unwrap().unwrap();
    assert_eq!(state.generation(), 1);
    assert!(state.fatal_errors().is_empty(), "{:?}", state.fatal_errors());
    assert_eq!(
        core.registry().get(&"Slow".into()).unwrap().generation(), 1
    );
}
