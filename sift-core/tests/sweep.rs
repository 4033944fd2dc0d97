mod support;

use std::sync::Arc;
use std::time::Duration;

use sift_core::control::{JobState, StatusTransition};
use sift_core::ledger::BatchStatus;
use sift_core::queue::JobQueue;
use sift_core::store::{CoordinationStore, StoreKeys};
use sift_core::{EntityId, JobId, QueueWorker, SiftError, SweepFilter, SweepRequest};
use tokio_util::sync::CancellationToken;

use support::{
    FaultyCorpus, Harness, Outage, ScriptedAnalyzer, corpus, flaky_orchestrator, test_config,
};

#[tokio::test]
async fn planning_is_idempotent_and_spares_running_batches() {
    let h = Harness::new(corpus(1..=237), ScriptedAnalyzer::new(), test_config(50));
    let ledger = h.orchestrator.ledger();

    let first = ledger.plan(237, 50).await.expect("plan");
    assert_eq!(first.len(), 5);
    assert_eq!(
        first.iter().map(|b| b.entity_offset).collect::<Vec<_>>(),
        vec![0, 50, 100, 150, 200]
    );
    assert_eq!(
        first.iter().map(|b| b.entity_count).collect::<Vec<_>>(),
        vec![50, 50, 50, 50, 37]
    );

    let second = ledger.plan(237, 50).await.expect("replan");
    assert_eq!(first, second);

    let job = h
        .orchestrator
        .start_batch(2, &SweepRequest::default())
        .await
        .expect("start batch 2")
        .expect("batch 2 has entities");

    // Same batch count, so the ledger (and the running batch) is untouched.
    let refreshed = ledger.plan(240, 50).await.expect("stats refresh");
    assert_eq!(refreshed[1].status, BatchStatus::Running);
    assert_eq!(refreshed[1].job_id, Some(job));

    // A different batch count cannot replace a ledger with a running batch.
    let kept = ledger.plan(400, 50).await.expect("refresh while running");
    assert_eq!(kept.len(), 5);
    assert_eq!(kept[1].status, BatchStatus::Running);
}

#[tokio::test]
async fn starting_a_running_batch_is_rejected() {
    let h = Harness::new(corpus(1..=10), ScriptedAnalyzer::new(), test_config(5));
    h.orchestrator
        .start_batch(1, &SweepRequest::default())
        .await
        .expect("first start");

    let err = h
        .orchestrator
        .start_batch(1, &SweepRequest::default())
        .await
        .expect_err("second start");
    assert!(matches!(err, SiftError::InvalidTransition { .. }));

    let err = h
        .orchestrator
        .ledger()
        .complete(2, 0)
        .await
        .expect_err("complete a pending batch");
    assert!(matches!(err, SiftError::InvalidTransition { .. }));
}

#[tokio::test]
async fn unchanged_entities_skip_the_analyzer() {
    let analyzer = ScriptedAnalyzer::new()
        .with_findings(1, 2)
        .with_findings(2, 0)
        .with_findings(3, 5);
    let h = Harness::new(corpus(1..=3), analyzer, test_config(10));

    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue");
    let first = h.run_next().await;
    assert_eq!(first.state, JobState::Complete);
    assert_eq!(first.found, 7);
    assert_eq!(first.skipped, 0);
    assert_eq!(h.analyzer.calls().len(), 3);

    h.orchestrator.reset_batches().await.expect("reset");
    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue again");
    let second = h.run_next().await;
    assert_eq!(second.state, JobState::Complete);
    assert_eq!(second.found, 7, "cached counts are carried into found");
    assert_eq!(second.skipped, 3);
    assert_eq!(second.processed, 3);
    assert_eq!(h.analyzer.calls().len(), 3, "analyzer not invoked again");

    h.orchestrator.reset_batches().await.expect("reset");
    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default().force_refresh(true))
        .await
        .expect("queue forced");
    let forced = h.run_next().await;
    assert_eq!(forced.skipped, 0);
    assert_eq!(h.analyzer.calls().len(), 6);
}

#[tokio::test]
async fn analyzer_failures_count_zero_and_are_not_cached() {
    let analyzer = ScriptedAnalyzer::new().failing_on(2);
    let h = Harness::new(corpus(1..=3), analyzer, test_config(10));

    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue");
    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Complete);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.found, 2);

    let cache = h.orchestrator.cache();
    assert!(cache.get(EntityId(1)).await.expect("get").is_some());
    assert!(cache.get(EntityId(2)).await.expect("get").is_none());
    assert!(cache.get(EntityId(3)).await.expect("get").is_some());
}

#[tokio::test]
async fn stop_is_honoured_after_the_in_flight_item() {
    let h = Harness::new(corpus(1..=10), ScriptedAnalyzer::new(), test_config(10));

    let job_id = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue")
        .expect("job");
    h.analyzer
        .stop_on_call(h.orchestrator.control().clone(), job_id, 3);

    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Stopped);
    assert_eq!(summary.processed, 3);

    let cache = h.orchestrator.cache();
    for id in 1..=3 {
        assert!(cache.get(EntityId(id)).await.expect("get").is_some());
    }
    for id in 4..=10 {
        assert!(
            cache.get(EntityId(id)).await.expect("get").is_none(),
            "entity {id} must not be cached"
        );
    }

    let status = h.orchestrator.get_job_status(job_id).await.expect("status");
    assert_eq!(status.status, JobState::Stopped);
    assert_eq!(status.processed, 3);

    let batch = h.orchestrator.ledger().get(1).await.expect("get").expect("batch 1");
    assert_eq!(batch.status, BatchStatus::Incomplete);

    // The stopped batch is the next one to run, and resumes from the cache.
    let again = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("requeue")
        .expect("job");
    assert_ne!(again, job_id);
    let resumed = h.run_next().await;
    assert_eq!(resumed.state, JobState::Complete);
    assert_eq!(resumed.skipped, 3);
    assert_eq!(h.analyzer.calls().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn cooldown_follows_every_second_item_but_not_the_last() {
    let mut config = test_config(10);
    config.sweep.cooldown_entities = 2;
    config.sweep.cooldown_secs = 30;
    let h = Harness::new(corpus(1..=5), ScriptedAnalyzer::new(), config);
    let mut transitions = h.orchestrator.control().subscribe();

    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue");
    let started = tokio::time::Instant::now();
    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Complete);

    let mut seen: Vec<StatusTransition> = Vec::new();
    while let Ok(transition) = transitions.try_recv() {
        seen.push(transition);
    }
    let into_cooldown = seen
        .iter()
        .filter(|t| t.from == JobState::Running && t.to == JobState::Cooldown)
        .count();
    let out_of_cooldown = seen
        .iter()
        .filter(|t| t.from == JobState::Cooldown && t.to == JobState::Running)
        .count();
    assert_eq!(into_cooldown, 2);
    assert_eq!(out_of_cooldown, 2);

    let offsets: Vec<u64> = h
        .analyzer
        .call_times()
        .iter()
        .map(|at| at.duration_since(started).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 0, 30, 30, 60]);
}

#[tokio::test(start_paused = true)]
async fn no_cooldown_after_the_final_item() {
    let mut config = test_config(10);
    config.sweep.cooldown_entities = 2;
    config.sweep.cooldown_secs = 30;
    let h = Harness::new(corpus(1..=4), ScriptedAnalyzer::new(), config);
    let mut transitions = h.orchestrator.control().subscribe();

    h.orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue");
    let started = tokio::time::Instant::now();
    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Complete);
    assert_eq!(summary.processed, 4);

    let mut cooldowns = 0;
    while let Ok(transition) = transitions.try_recv() {
        if transition.to == JobState::Cooldown {
            cooldowns += 1;
        }
    }
    // Items 2 and 4 both hit the interval; only the one with work after it
    // pays for it.
    assert_eq!(cooldowns, 1);
    assert_eq!(started.elapsed().as_secs(), 30);
}

#[tokio::test(start_paused = true)]
async fn runtime_ceiling_times_out_and_leaves_the_rest() {
    let mut config = test_config(10);
    config.sweep.max_runtime_mins = 1;
    let analyzer = ScriptedAnalyzer::new().with_delay(Duration::from_secs(40));
    let h = Harness::new(corpus(1..=5), analyzer, config);

    let job_id = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue")
        .expect("job");
    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Timeout);
    assert_eq!(summary.processed, 2);

    let status = h.orchestrator.get_job_status(job_id).await.expect("status");
    assert_eq!(status.status, JobState::Timeout);
    assert!(status.completed_at.is_some());

    let batch = h.orchestrator.ledger().get(1).await.expect("get").expect("batch");
    assert_eq!(batch.status, BatchStatus::Incomplete);
    assert!(batch.error.as_deref().unwrap_or_default().contains("runtime ceiling"));
}

#[tokio::test(start_paused = true)]
async fn paused_jobs_do_no_work_until_resumed() {
    let h = Harness::new(corpus(1..=3), ScriptedAnalyzer::new(), test_config(10));
    let job_id = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue")
        .expect("job");
    h.orchestrator.pause(job_id).await.expect("pause");

    let job = h.dequeue().await.expect("job");
    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .run_batch(&job, &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.analyzer.calls().is_empty());
    let status = h.orchestrator.get_job_status(job_id).await.expect("status");
    assert_eq!(status.status, JobState::Paused);

    h.orchestrator.resume(job_id).await.expect("resume");
    let summary = run.await.expect("join").expect("run");
    assert_eq!(summary.state, JobState::Complete);
    assert_eq!(h.analyzer.calls().len(), 3);

    let err = h.orchestrator.pause(job_id).await.expect_err("pause finished job");
    assert!(matches!(err, SiftError::InvalidTransition { .. }));
}

#[tokio::test]
async fn auto_continue_sweeps_every_batch_then_stops() {
    let h = Harness::new(corpus(1..=5), ScriptedAnalyzer::new(), test_config(2));

    let first = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default().auto_continue(true))
        .await
        .expect("queue");
    assert!(first.is_some());

    let worker = QueueWorker::new(h.orchestrator.clone(), Vec::new(), &h.config);
    let stats = worker
        .drain(CancellationToken::new())
        .await
        .expect("drain");
    assert_eq!(stats.jobs_run, 3);
    assert_eq!(stats.jobs_failed, 0);

    let enqueued = h.queue.enqueued().await;
    assert_eq!(enqueued.len(), 3, "no job beyond the last batch");
    assert_eq!(
        enqueued.iter().map(|j| j.batch_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let overview = h
        .orchestrator
        .get_batch_overview(&SweepFilter::all())
        .await
        .expect("overview");
    assert!(overview.all_complete);
    assert_eq!(overview.next_pending, None);
    assert_eq!(overview.total_entities, 5);
    assert_eq!(overview.batches.iter().map(|b| b.found).sum::<u64>(), 5);

    let done = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default().auto_continue(true))
        .await
        .expect("queue after completion");
    assert_eq!(done, None);

    // The worker deregistered on the way out.
    let keys = StoreKeys::new("test");
    let workers = h
        .store
        .keys_with_prefix(&keys.worker_prefix())
        .await
        .expect("keys");
    assert!(workers.is_empty());
}

#[tokio::test]
async fn filters_replan_the_ledger_over_the_filtered_set() {
    let h = Harness::new(corpus(1..=20), ScriptedAnalyzer::new(), test_config(5));

    let all = h
        .orchestrator
        .get_batch_overview(&SweepFilter::all())
        .await
        .expect("overview");
    assert_eq!(all.batches.len(), 4);

    let subset = SweepFilter::all().with_entities((1..=7).map(EntityId));
    let filtered = h
        .orchestrator
        .get_batch_overview(&subset)
        .await
        .expect("filtered overview");
    assert_eq!(filtered.total_entities, 7);
    assert_eq!(
        filtered.batches.iter().map(|b| b.entity_count).collect::<Vec<_>>(),
        vec![5, 2]
    );

    let job = h
        .orchestrator
        .start_batch(2, &SweepRequest::new(subset))
        .await
        .expect("start")
        .expect("job");
    let queued = h.dequeue().await.expect("queued job");
    assert_eq!(queued.job_id, job);
    assert_eq!(queued.entity_ids, vec![EntityId(6), EntityId(7)]);
}

#[tokio::test]
async fn unknown_jobs_are_reported_as_not_found() {
    let h = Harness::new(corpus(1..=1), ScriptedAnalyzer::new(), test_config(5));
    let err = h
        .orchestrator
        .get_job_status(JobId::new())
        .await
        .expect_err("missing job");
    assert!(matches!(err, SiftError::NotFound(_)));
}

#[tokio::test]
async fn sweeps_for_another_filter_wait_for_the_running_batch() {
    let h = Harness::new(corpus(1..=20), ScriptedAnalyzer::new(), test_config(5));
    let first = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue unfiltered")
        .expect("batch 1");

    // The running batch pins the unfiltered plan; its offsets must not be
    // applied to the subset's candidate list.
    let subset = SweepRequest::new(SweepFilter::all().with_entities((1..=7).map(EntityId)));
    let err = h
        .orchestrator
        .queue_batch_sweep(&subset)
        .await
        .expect_err("scope differs from the running plan");
    assert!(matches!(err, SiftError::ScopeMismatch { .. }), "{err:?}");
    let err = h
        .orchestrator
        .start_batch(2, &subset)
        .await
        .expect_err("explicit start is refused too");
    assert!(matches!(err, SiftError::ScopeMismatch { .. }), "{err:?}");

    assert_eq!(h.queue.enqueued().await.len(), 1);
    let batch = h.orchestrator.ledger().get(2).await.expect("get").expect("batch 2");
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.job_id, None);

    let summary = h.run_next().await;
    assert_eq!(summary.job_id, first);
    assert_eq!(summary.state, JobState::Complete);

    // With nothing running the ledger re-plans for the subset.
    h.orchestrator
        .queue_batch_sweep(&subset)
        .await
        .expect("queue subset")
        .expect("subset batch 1");
    let queued = h.dequeue().await.expect("subset job");
    assert_eq!(queued.batch_number, 1);
    assert_eq!(queued.entity_ids, (1..=5).map(EntityId).collect::<Vec<_>>());
}

#[tokio::test]
async fn batch_fatal_errors_fail_the_job_and_spare_other_batches() {
    let source = Arc::new(FaultyCorpus::new(corpus(1..=10)).failing_content(3));
    let h = Harness::with_sources(
        source.clone(),
        source,
        ScriptedAnalyzer::new(),
        test_config(5),
    );

    let job_id = h
        .orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue")
        .expect("job");
    let summary = h.run_next().await;
    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(summary.processed, 2);
    assert_eq!(h.analyzer.calls(), vec![EntityId(1), EntityId(2)]);

    let status = h.orchestrator.get_job_status(job_id).await.expect("status");
    assert_eq!(status.status, JobState::Failed);
    assert!(
        status
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("content database unavailable"),
        "{status:?}"
    );
    assert!(status.completed_at.is_some());

    let ledger = h.orchestrator.ledger();
    let failed = ledger.get(1).await.expect("get").expect("batch 1");
    assert_eq!(failed.status, BatchStatus::Incomplete);
    assert!(
        failed
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("content database unavailable")
    );
    let untouched = ledger.get(2).await.expect("get").expect("batch 2");
    assert_eq!(untouched.status, BatchStatus::Pending);
    assert_eq!(untouched.job_id, None);
    assert_eq!(untouched.error, None);
}

#[tokio::test]
async fn store_failures_reach_the_caller() {
    let config = test_config(10);
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (store, queue, orchestrator) =
        flaky_orchestrator(corpus(1..=4), analyzer.clone(), &config);

    let job_id = orchestrator
        .queue_batch_sweep(&SweepRequest::default())
        .await
        .expect("queue")
        .expect("job");
    let job = queue
        .dequeue(&[config.queue.default_queue.clone()])
        .await
        .expect("dequeue")
        .expect("queued job");

    let keys = StoreKeys::new("test");
    store.fail(keys.cache_entry(EntityId(2)), Outage::All);

    let err = orchestrator
        .run_batch(&job, &CancellationToken::new())
        .await
        .expect_err("store outage");
    assert!(matches!(err, SiftError::Store(_)), "{err:?}");
    assert_eq!(analyzer.calls(), vec![EntityId(1)]);

    // The rest of the store still works, so the run was settled on the way out.
    let status = orchestrator.get_job_status(job_id).await.expect("status");
    assert_eq!(status.status, JobState::Failed);
    let batch = orchestrator.ledger().get(1).await.expect("get").expect("batch");
    assert_eq!(batch.status, BatchStatus::Incomplete);

    store.recover();
    assert!(orchestrator.cache().get(EntityId(2)).await.expect("cache").is_none());
}
