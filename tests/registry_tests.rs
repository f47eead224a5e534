//! Integration tests for the registry: id allocation, split/aggregate
//! behavior, submission flows, and concurrent mutation.


use std::sync::Arc;
use std::time::Duration;

use jobmill::model::FqId;
use jobmill::{JobId, JobStatus, MillError};
use test_harness::TestMill;

#[tokio::test]
async fn ids_are_sequential_and_survive_restart() {
    let mill = TestMill::open().await;
    for i in 0..3 {
        let id = mill
            .registry
            .add(mill.mock_job(&format!("seq-{i}")))
            .await
            .unwrap();
        assert_eq!(id, JobId::new(i));
    }
    mill.registry.remove(JobId::new(1)).await.unwrap();

    // The counter restores past the highest surviving id; removed ids are
    // never reused.
    let mill = mill.restart().await;
    let id = mill.registry.add(mill.mock_job("after")).await.unwrap();
    assert_eq!(id, JobId::new(3));
}

#[tokio::test]
async fn split_subjobs_inherit_descriptors() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("batch")).await.unwrap();
    mill.registry.split(id, 4).await.unwrap();

    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.subjobs.len(), 4);
    for (i, sub) in job.subjobs.iter().enumerate() {
        assert_eq!(sub.id.value(), i as u32);
        assert_eq!(sub.name, format!("batch.{i}"));
        assert_eq!(sub.status, JobStatus::New);
        assert_eq!(sub.application, job.application);
        assert_eq!(sub.master, Some(id));
    }

    // Splitting is only legal before submission.
    mill.registry.submit(id).await.unwrap();
    let err = mill.registry.split(id, 2).await.unwrap_err();
    assert!(matches!(err, MillError::IllegalTransition { .. }));
}

#[tokio::test]
async fn master_aggregate_follows_subjob_updates() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("agg")).await.unwrap();
    mill.registry.split(id, 3).await.unwrap();
    mill.registry.submit(id).await.unwrap();
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Running
    );

    for i in 0..3 {
        mill.registry
            .apply_status(FqId::subjob(id, i), JobStatus::Running, None)
            .await
            .unwrap();
    }
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Running
    );

    // One paused among running subjobs yields the composite.
    mill.registry
        .apply_status(FqId::subjob(id, 0), JobStatus::Paused, None)
        .await
        .unwrap();
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::RunningPaused
    );

    // The others complete: only a paused subjob left.
    for i in 1..3 {
        mill.registry
            .apply_status(FqId::subjob(id, i), JobStatus::Completed, None)
            .await
            .unwrap();
    }
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Paused
    );

    // Resume and finish the last one.
    mill.registry
        .apply_status(FqId::subjob(id, 0), JobStatus::Running, None)
        .await
        .unwrap();
    mill.registry
        .apply_status(FqId::subjob(id, 0), JobStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn stale_monitoring_update_cannot_resurrect_a_killed_job() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("doomed")).await.unwrap();
    mill.registry.submit(id).await.unwrap();
    mill.registry.kill(id).await.unwrap();
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Killed
    );

    // A monitoring result from before the kill arrives late.
    let transition = mill
        .registry
        .apply_status(FqId::master(id), JobStatus::Running, None)
        .await
        .unwrap();
    assert!(!transition.is_applied());
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Killed
    );
}

#[tokio::test]
async fn killing_a_split_job_reaches_every_subjob() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("tree")).await.unwrap();
    mill.registry.split(id, 3).await.unwrap();
    mill.registry.submit(id).await.unwrap();
    // One subjob already finished; kill must skip it.
    mill.registry
        .apply_status(FqId::subjob(id, 2), JobStatus::Completed, None)
        .await
        .unwrap();

    mill.registry.kill(id).await.unwrap();

    let killed = mill.mock.killed.lock().await;
    assert!(killed.contains(&FqId::subjob(id, 0)));
    assert!(killed.contains(&FqId::subjob(id, 1)));
    assert!(!killed.contains(&FqId::subjob(id, 2)));
    drop(killed);

    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.subjobs[0].status, JobStatus::Killed);
    assert_eq!(job.subjobs[1].status, JobStatus::Killed);
    assert_eq!(job.subjobs[2].status, JobStatus::Completed);
    assert!(job.status.is_terminal());
}

#[tokio::test]
async fn concurrent_writers_are_serialized() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("contended")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = Arc::clone(&mill.registry);
        handles.push(tokio::spawn(async move {
            registry
                .update_with(id, |job| {
                    job.resubmit_count += 1;
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Every increment landed; none was lost to interleaving.
    assert_eq!(mill.registry.get(id).await.unwrap().resubmit_count, 10);
    let mill = mill.restart().await;
    assert_eq!(mill.registry.get(id).await.unwrap().resubmit_count, 10);
}

#[tokio::test]
async fn failed_bulk_submission_reports_which_subjobs() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("partial")).await.unwrap();
    mill.registry.split(id, 4).await.unwrap();
    mill.mock.fail_submits_named("partial.2").await;

    let err = mill.registry.submit(id).await.unwrap_err();
    match err {
        MillError::IncompleteSubmission {
            failed,
            total,
            details,
            ..
        } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 4);
            assert!(details.contains(&format!("{id}.2")));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The failure is recorded on the subjob; its siblings went through.
    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.subjobs[2].status, JobStatus::Failed);
    assert!(job.subjobs[2].fail_reason.is_some());
    for i in [0usize, 1, 3] {
        assert_eq!(job.subjobs[i].status, JobStatus::Submitted);
    }
}

#[tokio::test]
async fn resubmit_resets_backend_identity_and_enforces_the_limit() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("flaky")).await.unwrap();
    mill.registry.submit(id).await.unwrap();
    assert!(mill
        .registry
        .get(id)
        .await
        .unwrap()
        .backend
        .runtime_str("external_id")
        .is_some());

    mill.registry
        .apply_status(FqId::master(id), JobStatus::Failed, None)
        .await
        .unwrap();

    let limit = mill.config.max_resubmits;
    for attempt in 1..=limit {
        mill.registry.resubmit(id).await.unwrap();
        let job = mill.registry.get(id).await.unwrap();
        assert_eq!(job.resubmit_count, attempt);
        assert_eq!(job.status, JobStatus::Submitted);
        mill.registry
            .apply_status(FqId::master(id), JobStatus::Failed, None)
            .await
            .unwrap();
    }

    let err = mill.registry.resubmit(id).await.unwrap_err();
    assert!(matches!(err, MillError::ResubmitLimit { .. }));
    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .fail_reason
        .as_deref()
        .is_some_and(|r| r.contains("limit")));
}

#[tokio::test]
async fn resubmitting_a_master_skips_completed_subjobs() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("mixed")).await.unwrap();
    mill.registry.split(id, 2).await.unwrap();
    mill.registry.submit(id).await.unwrap();

    mill.registry
        .apply_status(FqId::subjob(id, 0), JobStatus::Completed, None)
        .await
        .unwrap();
    mill.registry
        .apply_status(FqId::subjob(id, 1), JobStatus::Failed, None)
        .await
        .unwrap();
    assert_eq!(
        mill.registry.get(id).await.unwrap().status,
        JobStatus::Failed
    );

    mill.registry.resubmit(id).await.unwrap();

    // Only the failed subjob went back to the backend.
    let submitted = mill.mock.submitted.lock().await;
    let submissions = |fqid: FqId| submitted.iter().filter(|f| **f == fqid).count();
    assert_eq!(submissions(FqId::subjob(id, 0)), 1);
    assert_eq!(submissions(FqId::subjob(id, 1)), 2);
    drop(submitted);

    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.subjobs[0].status, JobStatus::Completed);
    let expected = format!("mock-{id}.0");
    assert_eq!(
        job.subjobs[0].backend.runtime_str("external_id"),
        Some(expected.as_str())
    );
    assert_eq!(job.subjobs[1].status, JobStatus::Submitted);
    assert!(!job.status.is_terminal());
}

#[tokio::test]
async fn descriptors_freeze_once_submission_starts() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("frozen")).await.unwrap();
    mill.registry.submit(id).await.unwrap();

    let replacement = mill.plugins.build("backends", "Mock").unwrap();
    let err = mill
        .registry
        .update_with(id, |job| job.set_backend(replacement))
        .await
        .unwrap_err();
    assert!(matches!(err, MillError::AttributeProtected { .. }));
}

#[tokio::test]
async fn remove_is_explicit_and_durable() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("ephemeral")).await.unwrap();
    assert_eq!(mill.registry.len().await, 1);

    mill.registry.remove(id).await.unwrap();
    assert!(matches!(
        mill.registry.get(id).await.unwrap_err(),
        MillError::JobNotFound(_)
    ));

    let mill = mill.restart().await;
    assert_eq!(mill.registry.len().await, 0);
    assert!(mill.registry.list().await.is_empty());
}

#[tokio::test]
async fn lock_contention_between_registries_surfaces_as_retryable() {
    // Two registry instances over the same repository directory, as with
    // two concurrent sessions.
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("shared")).await.unwrap();

    let held = mill.registry.repository().lock(id).await.unwrap();
    let err = mill
        .registry
        .update_with(id, |job| {
            job.resubmit_count += 1;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    drop(held);

    mill.registry
        .update_with(id, |job| {
            job.resubmit_count += 1;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(mill.registry.get(id).await.unwrap().resubmit_count, 1);
}

#[tokio::test]
async fn stale_lock_on_a_fresh_id_stalls_only_the_add() {
    let mill = TestMill::open().await;
    let id = mill.registry.add(mill.mock_job("bystander")).await.unwrap();

    // A crashed session left a lock file for the id the next add will
    // draw.
    let stale = mill.dir.path().join("repo").join("jobs").join("1.lock");
    tokio::fs::write(&stale, "dead-session").await.unwrap();

    let registry = Arc::clone(&mill.registry);
    let adding = {
        let registry = Arc::clone(&registry);
        let job = mill.mock_job("stalled");
        tokio::spawn(async move { registry.add(job).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // While the add polls the stale lock, other jobs stay writable.
    let start = std::time::Instant::now();
    registry
        .update_with(id, |job| {
            job.resubmit_count += 1;
            Ok(())
        })
        .await
        .unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(150),
        "registry blocked behind a contended add: {:?}",
        start.elapsed()
    );

    let err = adding.await.unwrap().unwrap_err();
    assert!(matches!(err, MillError::LockTimeout { .. }));

    // The burned id is skipped; allocation continues past it.
    tokio::fs::remove_file(&stale).await.unwrap();
    let next = mill.registry.add(mill.mock_job("after")).await.unwrap();
    assert_eq!(next, JobId::new(2));
}

#[tokio::test]
async fn submission_failure_records_the_reason() {
    let mill = TestMill::open().await;
    mill.mock.fail_submits_named("refused").await;
    let id = mill.registry.add(mill.mock_job("refused")).await.unwrap();

    let err = mill.registry.submit(id).await.unwrap_err();
    assert!(matches!(err, MillError::Backend { .. }));

    let job = mill.registry.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .fail_reason
        .as_deref()
        .is_some_and(|r| r.contains("refused")));

    // Resubmit is legal again from failed; the mock still refuses it.
    mill.registry.resubmit(id).await.unwrap_err();
}
