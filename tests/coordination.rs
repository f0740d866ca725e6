//! The coordinator and real servants working one queue set in-process.

mod common;

use std::sync::{Arc, Mutex};

use common::{counties, settings, spawn_servants};
use futures::future::join_all;
use nbm::{
    master::{Coordinator, PhasePlan},
    protocol::{Directive, Payload, TaskName},
    queue::QueueSet,
};

async fn shutdown(queues: &QueueSet, servants: Vec<tokio::task::JoinHandle<nbm::error::Result<()>>>) {
    for _ in 0..servants.len() {
        queues.directive.put(Directive::Shutdown).await.unwrap();
    }
    for joined in join_all(servants).await {
        joined.unwrap().unwrap();
    }
}

async fn assert_drained(queues: &QueueSet) {
    assert_eq!(queues.work.size().await.unwrap(), 0);
    assert_eq!(queues.result.size().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_item_completes_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), 3);
    let queues = QueueSet::local();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let servants = spawn_servants(3, &queues, &settings, &[], &seen);

    let mut coordinator = Coordinator::from_settings(queues.clone(), &settings);
    let outcome = coordinator
        .run_phase(PhasePlan::new(TaskName::ParseFbd, 2, counties(10)))
        .await
        .unwrap();

    assert!(outcome.succeeded);
    assert_eq!(outcome.completed, 10);
    assert_eq!(outcome.errors, 0);
    let mut files: Vec<_> = outcome
        .payloads
        .iter()
        .map(|p| match p {
            Payload::File(f) => f.clone(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    files.sort();
    files.dedup();
    assert_eq!(files.len(), 10);
    assert_eq!(seen.lock().unwrap().len(), 10);
    assert_drained(&queues).await;

    shutdown(&queues, servants).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_item_fails_the_phase() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), 3);
    let queues = QueueSet::local();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let servants = spawn_servants(3, &queues, &settings, &["01009"], &seen);

    let mut coordinator = Coordinator::from_settings(queues.clone(), &settings);
    let outcome = coordinator
        .run_phase(PhasePlan::new(TaskName::ParseFbd, 2, counties(10)))
        .await
        .unwrap();

    assert!(!outcome.succeeded);
    assert_eq!(outcome.errors, 1);
    assert!(seen.lock().unwrap().contains(&"01009".to_string()));
    assert_drained(&queues).await;

    // the same servants take the next phase cleanly
    let outcome = coordinator
        .run_phase(PhasePlan::new(TaskName::ParseFbd, 2, counties(4)))
        .await
        .unwrap();
    assert!(outcome.succeeded);
    assert_eq!(outcome.completed, 4);

    shutdown(&queues, servants).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waves_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), 2);
    let queues = QueueSet::local();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let servants = spawn_servants(2, &queues, &settings, &[], &seen);

    let mut items = counties(5);
    let first = items.remove(0);
    let mut coordinator = Coordinator::from_settings(queues.clone(), &settings);
    let outcome = coordinator
        .run_phase(PhasePlan::in_waves(TaskName::ParseFbd, 3, vec![vec![first], items]))
        .await
        .unwrap();

    assert!(outcome.succeeded);
    assert_eq!(outcome.completed, 5);
    assert_eq!(seen.lock().unwrap()[0], "01001");

    shutdown(&queues, servants).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn servants_refuse_a_foreign_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let ours = settings(dir.path(), 1);
    let other_dir = tempfile::tempdir().unwrap();
    let theirs = settings(other_dir.path(), 1);
    let queues = QueueSet::local();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let servants = spawn_servants(1, &queues, &theirs, &[], &seen);

    let mut coordinator = Coordinator::from_settings(queues.clone(), &ours);
    let outcome = coordinator
        .run_phase(PhasePlan::new(TaskName::ParseFbd, 2, counties(3)))
        .await
        .unwrap();

    assert!(!outcome.succeeded);
    assert_eq!(outcome.errors, 1);
    assert!(seen.lock().unwrap().is_empty());
    assert_drained(&queues).await;

    shutdown(&queues, servants).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_tasks_are_refused_with_every_lane_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), 2);
    let queues = QueueSet::local();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let servants = spawn_servants(2, &queues, &settings, &[], &seen);

    let mut coordinator = Coordinator::from_settings(queues.clone(), &settings);
    let outcome = coordinator
        .run_phase(PhasePlan::new(TaskName::TractSort, 4, counties(2)))
        .await
        .unwrap();

    assert!(!outcome.succeeded);
    assert!(outcome.errors >= 1);
    assert_drained(&queues).await;

    shutdown(&queues, servants).await;
}
