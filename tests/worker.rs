//! Worker integration tests: a real job store and output directory, with a
//! scripted generation client and a form-feed page reader.

mod common;

use common::{document, Harness, ScriptedClient};
use page_explainer::intake;
use page_explainer::status;
use page_explainer::{BatchPolicy, JobState, OutputFormat, Upload, Worker, WorkerConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn submit(h: &Harness, name: &str, pages: &[&str]) -> String {
    tokio_test::assert_ok!(intake::submit(&h.ctx, Upload::new(name, document(pages))).await)
        .to_string()
}

fn contents(report: &status::StatusReport) -> Vec<String> {
    report
        .explanation
        .as_ref()
        .expect("explanation present")
        .iter()
        .map(|p| p.content.clone())
        .collect()
}

#[tokio::test]
async fn results_keep_page_order_when_calls_finish_in_reverse() {
    let h = Harness::new();
    let id = submit(&h, "deck.pptx", &["a", "b", "c", "d", "e"]).await;

    let report = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let status = status::query(&h.ctx, &id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Done);
    assert!(status.finish_time.is_some());
    assert_eq!(contents(&status), vec!["A", "B", "C", "D", "E"]);
    let numbers: Vec<usize> = status
        .explanation
        .unwrap()
        .iter()
        .map(|p| p.page_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn blank_page_becomes_its_number_without_a_call() {
    let h = Harness::new();
    let id = submit(&h, "slides.pdf", &["first", "   \n ", "third"]).await;

    Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;

    let status = status::query(&h.ctx, &id).await.unwrap().unwrap();
    assert_eq!(contents(&status), vec!["FIRST", "2", "THIRD"]);
    assert_eq!(h.client.calls(), 2);
}

#[tokio::test]
async fn document_without_pages_completes_with_empty_explanation() {
    let h = Harness::new();
    let id = submit(&h, "empty.pptx", &[]).await;

    let report = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 1);

    let status = status::query(&h.ctx, &id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Done);
    assert!(contents(&status).is_empty());
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn transport_failure_leaves_job_pending_without_output() {
    let h = Harness::new();
    let id = submit(&h, "deck.pptx", &["fine", "boom", "fine too"]).await;

    let report = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 1);

    let job = h.ctx.store.get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(job.completed_at.is_none());
    assert!(!h.ctx.outputs.path_for(&id, OutputFormat::Json).exists());

    // Still pending, so the next cycle tries again.
    let again = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(again.failed, 1);
}

#[tokio::test]
async fn partial_policy_keeps_successful_pages() {
    let h = Harness::build(ScriptedClient::new(), BatchPolicy::Partial);
    let id = submit(&h, "deck.pptx", &["fine", "boom", "last"]).await;

    Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;

    let status = status::query(&h.ctx, &id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Done);
    let pages = status.explanation.unwrap();
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[0].content, "FINE");
    assert!(pages[1].error.as_ref().is_some_and(|e| e.is_transport()));
    assert_eq!(pages[2].content, "LAST");
}

#[tokio::test]
async fn service_error_body_does_not_fail_the_batch() {
    let h = Harness::new();
    let id = submit(&h, "deck.pptx", &["ok", "quota please"]).await;

    let report = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 1);

    let pages = status::query(&h.ctx, &id)
        .await
        .unwrap()
        .unwrap()
        .explanation
        .unwrap();
    assert_eq!(pages[0].content, "OK");
    let err = pages[1].error.as_ref().expect("service error kept");
    assert!(!err.is_transport());
    assert!(err.to_string().contains("quota"));
}

#[tokio::test]
async fn one_broken_job_does_not_stop_the_others() {
    let h = Harness::new();
    let missing = submit(&h, "gone.pptx", &["x"]).await;
    let malformed = intake::submit(&h.ctx, Upload::new("bad.pdf", b"FAIL".to_vec()))
        .await
        .unwrap()
        .to_string();
    let good = submit(&h, "good.pptx", &["y"]).await;

    let job = h.ctx.store.get(&missing).unwrap().unwrap();
    std::fs::remove_file(h.ctx.upload_path(&job)).unwrap();

    let report = Worker::new(h.ctx.clone())
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 2);

    let state = |id: &str| h.ctx.store.get(id).unwrap().unwrap().state;
    assert_eq!(state(&missing), JobState::Pending);
    assert_eq!(state(&malformed), JobState::Pending);
    assert_eq!(state(&good), JobState::Done);
}

#[tokio::test]
async fn completing_a_job_twice_keeps_the_first_completion() {
    let h = Harness::new();
    let id = submit(&h, "deck.pptx", &["one"]).await;
    let worker = Worker::new(h.ctx.clone());

    let job = h.ctx.store.get(&id).unwrap().unwrap();
    worker.process_job(&job).await.unwrap();
    let first = h.ctx.store.get(&id).unwrap().unwrap().completed_at;
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    worker.process_job(&job).await.unwrap();
    let second = h.ctx.store.get(&id).unwrap().unwrap();
    assert_eq!(second.state, JobState::Done);
    assert_eq!(second.completed_at, first);
}

#[tokio::test]
async fn job_deleted_while_in_flight_leaves_no_output() {
    let h = Harness::new();
    let id = submit(&h, "deck.pptx", &["one", "two"]).await;
    let worker = Worker::new(h.ctx.clone());

    // The worker already holds the job when its record goes away.
    let job = h.ctx.store.get(&id).unwrap().unwrap();
    assert!(h.ctx.store.delete(&id).unwrap());

    worker.process_job(&job).await.unwrap();

    assert!(h.ctx.store.get(&id).unwrap().is_none());
    assert!(!h.ctx.outputs.path_for(&id, OutputFormat::Json).exists());
}

#[tokio::test]
async fn cancelled_cycle_starts_no_jobs() {
    let h = Harness::new();
    submit(&h, "a.pptx", &["a"]).await;
    submit(&h, "b.pptx", &["b"]).await;

    let token = CancellationToken::new();
    token.cancel();
    let report = Worker::new(h.ctx.clone()).run_cycle(&token).await;

    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn run_loop_stops_promptly_while_idle() {
    let h = Harness::new();
    let worker = Worker::with_config(
        h.ctx.clone(),
        WorkerConfig {
            poll_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        },
    );
    let token = CancellationToken::new();
    let handle = tokio::spawn(worker.run(token.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker stopped within the wait")
        .unwrap();
}

#[tokio::test]
async fn in_flight_job_finishes_within_grace() {
    let h = Harness::build(
        ScriptedClient::with_stall(Duration::from_millis(300)),
        BatchPolicy::AllOrNothing,
    );
    let id = submit(&h, "deck.pptx", &["slow"]).await;

    let worker = Worker::with_config(
        h.ctx.clone(),
        WorkerConfig {
            poll_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        },
    );
    let token = CancellationToken::new();
    let handle = tokio::spawn(worker.run(token.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.ctx.store.get(&id).unwrap().unwrap().state, JobState::Done);
}

#[tokio::test]
async fn in_flight_job_past_grace_is_abandoned_and_stays_pending() {
    let h = Harness::build(
        ScriptedClient::with_stall(Duration::from_secs(20)),
        BatchPolicy::AllOrNothing,
    );
    let id = submit(&h, "deck.pptx", &["stuck"]).await;

    let worker = Worker::with_config(
        h.ctx.clone(),
        WorkerConfig {
            poll_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(100),
        },
    );
    let token = CancellationToken::new();
    let handle = tokio::spawn(worker.run(token.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("abandoned after grace")
        .unwrap();

    let job = h.ctx.store.get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(!h.ctx.outputs.path_for(&id, OutputFormat::Json).exists());
}
