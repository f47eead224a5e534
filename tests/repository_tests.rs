//! Integration tests for the file-backed job store: durability, locking,
//! and corruption isolation.


use std::time::Duration;

use jobmill::model::JobId;
use jobmill::{JobStatus, MillError};
use test_harness::TestMill;

#[tokio::test]
async fn round_trip_survives_restart() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("roundtrip")).await.unwrap();
    mill.registry.split(id, 3).await.unwrap();
    mill.registry.submit(id).await.unwrap();

    let before = mill.registry.get(id).await.unwrap();
    let mill = mill.restart().await;
    let after = mill.registry.get(id).await.unwrap();

    assert_eq!(after.name, "roundtrip");
    assert_eq!(after.status, before.status);
    assert_eq!(after.subjobs.len(), 3);
    assert_eq!(
        after.backend.runtime_str("external_id"),
        before.backend.runtime_str("external_id")
    );
    // Parent links are rebuilt on load, not stored.
    assert!(after.subjobs.iter().all(|s| s.master == Some(id)));
}

#[tokio::test]
async fn leftover_tmp_file_never_shadows_the_record() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("durable")).await.unwrap();

    // A crash between temp write and rename leaves a stray .tmp behind.
    let tmp = mill
        .dir
        .path()
        .join("repo/jobs")
        .join(format!("{id}.json.tmp"));
    std::fs::write(&tmp, b"{ truncated garbage").unwrap();

    let mill = mill.restart().await;
    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.name, "durable");
    assert_eq!(job.status, JobStatus::New);
}

#[tokio::test]
async fn lock_contention_times_out_instead_of_hanging() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("locked")).await.unwrap();
    let repo = mill.registry.repository();

    let held = repo.lock(id).await.unwrap();
    let started = tokio::time::Instant::now();
    let err = repo.lock(id).await.unwrap_err();
    assert!(matches!(err, MillError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(250));

    drop(held);
    // Released locks are reacquirable immediately.
    let _relock = repo.lock(id).await.unwrap();
}

#[tokio::test]
async fn corrupt_record_is_isolated_from_the_rest() {
    let mill = TestMill::open().await;
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            mill.registry
                .add(mill.mock_job(&format!("job-{i}")))
                .await
                .unwrap(),
        );
    }

    let victim = ids[4];
    let record = mill
        .dir
        .path()
        .join("repo/jobs")
        .join(format!("{victim}.json"));
    std::fs::write(&record, b"{\"type\": \"Job\", \"ver").unwrap();

    let mill = mill.restart().await;
    let errors = mill.registry.load().await.unwrap();
    assert_eq!(mill.registry.len().await, 10);
    assert!(errors.iter().any(|e| e.path.contains(&victim.to_string())));

    // The victim is a placeholder stub; everyone else loaded clean.
    let stub = mill.registry.get(victim).await.unwrap();
    assert_eq!(stub.name, "unloadable");
    for id in ids.iter().filter(|i| **i != victim) {
        let job = mill.registry.get(*id).await.unwrap();
        assert_ne!(job.name, "unloadable");
    }
}

#[tokio::test]
async fn unknown_backend_tag_becomes_placeholder() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("exotic")).await.unwrap();

    let record = mill
        .dir
        .path()
        .join("repo/jobs")
        .join(format!("{id}.json"));
    let text = std::fs::read_to_string(&record).unwrap();
    std::fs::write(&record, text.replace("\"Mock\"", "\"Dirac\"")).unwrap();

    let mill = mill.restart().await;
    let errors = mill.registry.load().await.unwrap();
    assert!(!errors.is_empty());

    let job = mill.registry.get(id).await.unwrap();
    assert!(job.backend.is_placeholder());
    assert_eq!(job.backend.field_str("original_type"), Some("Dirac"));
    // The rest of the record is intact.
    assert_eq!(job.name, "exotic");
    assert!(!job.application.is_placeholder());
}

#[tokio::test]
async fn index_cache_is_rebuilt_from_records() {
    let mill = TestMill::open().await;
    for i in 0..3 {
        mill.registry
            .add(mill.mock_job(&format!("indexed-{i}")))
            .await
            .unwrap();
    }

    std::fs::remove_file(mill.dir.path().join("repo/index.json")).unwrap();
    let mill = mill.restart().await;

    let entries = mill.registry.list().await;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].id, JobId::new(0));
    assert_eq!(entries[2].name, "indexed-2");
}

#[tokio::test]
async fn read_only_repository_rejects_mutation() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("frozen")).await.unwrap();
    mill.registry.repository().set_read_only(true);

    let err = mill.registry.add(mill.mock_job("rejected")).await.unwrap_err();
    assert!(matches!(err, MillError::ReadOnly(_)));
    let err = mill.registry.submit(id).await.unwrap_err();
    assert!(matches!(err, MillError::ReadOnly(_)));

    mill.registry.repository().set_read_only(false);
    mill.registry.submit(id).await.unwrap();
}
