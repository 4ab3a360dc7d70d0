//! End-to-end tests of the poll loop against the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use laneq_core::{
    ClaimedJob, Client, CycleOutcome, Job, JobContext, JobId, NewJob, Payload, QueueConfig,
    QueueError, Resolution, Result, Status, Store, Worker, WorkerPool,
};
use laneq_memory::MemoryStore;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const HEARTBEAT: Duration = Duration::from_millis(10);

fn config() -> QueueConfig {
    QueueConfig::builder()
        .lanes(["a", "b"])
        .heartbeat(HEARTBEAT)
        .timeout(Duration::from_millis(100))
        .tries(2)
        .build()
        .unwrap()
}

fn new_worker<F, Fut>(
    store: &MemoryStore,
    handler: F,
) -> (Worker<MemoryStore, F, Fut>, CancellationToken)
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let root = CancellationToken::new();
    let worker = Worker::new(0, store.clone(), config(), handler, root.clone());
    (worker, root)
}

type BoxedRun = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Handler that signals it started, then waits for cancellation and fails.
fn wait_for_cancel(
    started: Arc<Notify>,
) -> impl Fn(JobContext, Payload) -> BoxedRun + Send + Sync + Clone + 'static {
    move |ctx: JobContext, _payload: Payload| {
        let started = started.clone();
        Box::pin(async move {
            started.notify_one();
            ctx.cancelled().await;
            false
        }) as BoxedRun
    }
}

/// Memory store that can fail status writes or report a status text no
/// `Status` parses from, the way a SQL store sees a foreign value.
#[derive(Clone, Default)]
struct FaultyStore {
    inner: MemoryStore,
    fail_status_writes: Arc<AtomicBool>,
    foreign_status: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Store for FaultyStore {
    async fn claim(
        &self,
        lanes: &[String],
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        self.inner.claim(lanes, now, stale_before).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Status>> {
        let foreign = self.foreign_status.lock().unwrap().clone();
        match foreign {
            Some(raw) => Err(QueueError::InvalidStatus(raw)),
            None => self.inner.heartbeat(id, now).await,
        }
    }

    async fn set_status(&self, id: &JobId, status: Status) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(QueueError::Store("connection reset".to_string()));
        }
        self.inner.set_status(id, status).await
    }

    async fn push_job(&self, job: NewJob) -> Result<()> {
        self.inner.push_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn request_cancel(&self, id: &JobId) -> Result<bool> {
        self.inner.request_cancel(id).await
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        self.inner.remove_job(id).await
    }

    async fn count_by_status(&self, status: Status) -> Result<usize> {
        self.inner.count_by_status(status).await
    }
}

/// Claim and abandon a job `times` times, as crashed workers would.
async fn interrupt(store: &MemoryStore, id: &JobId, times: usize) {
    let lanes = vec!["a".to_string()];
    for _ in 0..times {
        let now = Utc::now();
        store.claim(&lanes, now, now).await.unwrap().unwrap();
        store
            .set_heartbeat_at(id, now - TimeDelta::hours(1))
            .await
            .unwrap();
    }
}

async fn explode(_ctx: JobContext, _payload: Payload) -> bool {
    panic!("handler blew up")
}

async fn status_of(store: &MemoryStore, id: &JobId) -> Option<Status> {
    store.get_job(id).await.unwrap().map(|job| job.status)
}

#[tokio::test]
async fn test_higher_priority_lane_claimed_first() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());

    let t0 = Utc::now() - TimeDelta::seconds(1);
    let x = client
        .enqueue_job(NewJob::new("b", json!({"name": "x"})).created_at(t0))
        .await
        .unwrap();
    let y = NewJob::new("a", json!({"name": "y"})).created_at(t0 + TimeDelta::milliseconds(5));
    let y = client.enqueue_job(y).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |ctx: JobContext, payload: Payload| {
            let seen = seen.clone();
            async move {
                let name: String = payload.as_value()["payload"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push((ctx.id(), name));
                true
            }
        }
    };
    let (worker, _root) = new_worker(&store, handler);

    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(y, Resolution::Settled(Status::Succeeded))
    );
    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(x, Resolution::Settled(Status::Succeeded))
    );
    assert_eq!(worker.process_next().await, CycleOutcome::Idle);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(y, "y".to_string()), (x, "x".to_string())]);
}

#[tokio::test]
async fn test_success_and_failure_are_persisted() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let good = client.enqueue("a", json!({"ok": true})).await.unwrap();
    let bad = client.enqueue("b", json!({"ok": false})).await.unwrap();

    let handler = |_ctx: JobContext, payload: Payload| async move {
        payload.as_value()["payload"]["ok"].as_bool().unwrap_or(false)
    };
    let (worker, _root) = new_worker(&store, handler);

    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(good, Resolution::Settled(Status::Succeeded))
    );
    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(bad, Resolution::Settled(Status::Failed))
    );

    assert_eq!(status_of(&store, &good).await, Some(Status::Succeeded));
    assert_eq!(status_of(&store, &bad).await, Some(Status::Failed));
    assert_eq!(store.get_job(&bad).await.unwrap().unwrap().r#try, 1);
}

#[tokio::test]
async fn test_retry_budget_exhausted_fails_without_running() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    // Three earlier interrupted attempts: the next claim makes try = 4.
    interrupt(&store, &id, 3).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |_ctx: JobContext, _payload: Payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { true }
        }
    };
    let (worker, _root) = new_worker(&store, handler);

    assert_eq!(worker.process_next().await, CycleOutcome::FailedFast(id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.r#try, 4);
}

#[tokio::test]
async fn test_retry_budget_boundary_still_runs() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    // Two earlier attempts: try = 3, prior attempts = 2 = tries.
    interrupt(&store, &id, 2).await;

    let (worker, _root) = new_worker(&store, |_ctx: JobContext, _payload: Payload| async { true });
    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
}

#[tokio::test]
async fn test_cancel_request_stops_handler() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let (worker, _root) = new_worker(&store, wait_for_cancel(started.clone()));
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    assert!(client.cancel(&id).await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("handler was not cancelled")
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Cancelled))
    );
    assert_eq!(status_of(&store, &id).await, Some(Status::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_seen_within_heartbeats() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let cancelled_at = Arc::new(Mutex::new(None));
    let handler = {
        let cancelled_at = cancelled_at.clone();
        move |ctx: JobContext, _payload: Payload| {
            let cancelled_at = cancelled_at.clone();
            async move {
                ctx.cancelled().await;
                *cancelled_at.lock().unwrap() = Some(tokio::time::Instant::now());
                false
            }
        }
    };
    let (worker, _root) = new_worker(&store, handler);
    let cycle = tokio::spawn(async move { worker.process_next().await });

    // Halfway between two heartbeats.
    tokio::time::sleep(HEARTBEAT * 3 + HEARTBEAT / 2).await;
    let requested_at = tokio::time::Instant::now();
    client.cancel(&id).await.unwrap();
    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Cancelled))
    );

    let cancelled_at = cancelled_at.lock().unwrap().expect("handler never cancelled");
    let waited = cancelled_at.duration_since(requested_at);
    assert!(waited > Duration::ZERO);
    assert!(waited <= HEARTBEAT);
}

#[tokio::test(start_paused = true)]
async fn test_deleted_row_cancels_handler() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let (worker, _root) = new_worker(&store, wait_for_cancel(started.clone()));
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    assert!(client.delete(&id).await.unwrap());
    let deleted_at = tokio::time::Instant::now();

    let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("handler was not cancelled")
        .unwrap();
    assert!(deleted_at.elapsed() <= HEARTBEAT);
    assert_eq!(
        outcome,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Cancelled))
    );
    // The worker never recreates a deleted row.
    assert!(store.get_job(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_external_terminal_status_is_respected() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let (worker, _root) = new_worker(&store, wait_for_cancel(started.clone()));
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    client.set_status(&id, Status::Ignored).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("handler was not cancelled")
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Resolved(id, Resolution::Overridden(Status::Ignored))
    );
    assert_eq!(status_of(&store, &id).await, Some(Status::Ignored));
}

#[tokio::test]
async fn test_override_wins_even_when_handler_succeeds() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let handler = {
        let started = started.clone();
        move |ctx: JobContext, _payload: Payload| {
            let started = started.clone();
            async move {
                started.notify_one();
                ctx.cancelled().await;
                true
            }
        }
    };
    let (worker, _root) = new_worker(&store, handler);
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    client.set_status(&id, Status::Succeeded).await.unwrap();

    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Resolved(id, Resolution::Overridden(Status::Succeeded))
    );
}

#[tokio::test]
async fn test_shutdown_leaves_job_running_for_reclaim() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let (worker, root) = new_worker(&store, wait_for_cancel(started.clone()));
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    root.cancel();

    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Resolved(id, Resolution::Abandoned)
    );
    assert_eq!(status_of(&store, &id).await, Some(Status::Running));

    // Not claimable while the lease looks fresh.
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |ctx: JobContext, _payload: Payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            let attempt = ctx.attempt();
            async move { attempt == 2 }
        }
    };
    let (next_worker, _root) = new_worker(&store, handler);
    assert_eq!(next_worker.process_next().await, CycleOutcome::Idle);

    // Once the heartbeat is older than the timeout, another worker takes it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        next_worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_success_after_shutdown_is_persisted() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let handler = {
        let started = started.clone();
        move |ctx: JobContext, _payload: Payload| {
            let started = started.clone();
            async move {
                started.notify_one();
                ctx.cancelled().await;
                true
            }
        }
    };
    let (worker, root) = new_worker(&store, handler);
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    root.cancel();

    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
    assert_eq!(status_of(&store, &id).await, Some(Status::Succeeded));
}

#[tokio::test]
async fn test_store_outage_aborts_cycle() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let (worker, _root) = new_worker(&store, |_ctx: JobContext, _payload: Payload| async { true });

    store.set_unavailable(true);
    assert_eq!(worker.process_next().await, CycleOutcome::Aborted);

    store.set_unavailable(false);
    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
}

#[tokio::test]
async fn test_status_write_failure_leaves_job_for_reclaim() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    // The first attempt succeeds but the store goes down before it is recorded.
    let outage = store.clone();
    let handler = move |ctx: JobContext, _payload: Payload| {
        let outage = outage.clone();
        async move {
            if ctx.attempt() == 1 {
                outage.set_unavailable(true);
            }
            true
        }
    };
    let (worker, _root) = new_worker(&store, handler);

    assert_eq!(worker.process_next().await, CycleOutcome::Aborted);
    store.set_unavailable(false);
    assert_eq!(status_of(&store, &id).await, Some(Status::Running));

    // Lease still fresh.
    assert_eq!(worker.process_next().await, CycleOutcome::Idle);

    store
        .set_heartbeat_at(&id, Utc::now() - TimeDelta::hours(1))
        .await
        .unwrap();
    let succeed = |_ctx: JobContext, _payload: Payload| async { true };
    let (next_worker, _root) = new_worker(&store, succeed);
    assert_eq!(
        next_worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Succeeded);
    assert_eq!(job.r#try, 2);
}

#[tokio::test]
async fn test_fail_fast_write_failure_still_skips_handler() {
    let store = FaultyStore::default();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();
    interrupt(&store.inner, &id, 3).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |_ctx: JobContext, _payload: Payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { true }
        }
    };
    let worker = Worker::new(0, store.clone(), config(), handler, CancellationToken::new());

    store.fail_status_writes.store(true, Ordering::SeqCst);
    assert_eq!(worker.process_next().await, CycleOutcome::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Running);
    assert_eq!(job.r#try, 4);

    // Retried on the next claim once the lease is stale.
    store.fail_status_writes.store(false, Ordering::SeqCst);
    store
        .inner
        .set_heartbeat_at(&id, Utc::now() - TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(worker.process_next().await, CycleOutcome::FailedFast(id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_job(&id).await.unwrap().unwrap().status, Status::Failed);
}

#[tokio::test]
async fn test_unrecognized_status_is_left_alone() {
    let store = FaultyStore::default();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let started = Arc::new(Notify::new());
    let worker = Worker::new(
        0,
        store.clone(),
        config(),
        wait_for_cancel(started.clone()),
        CancellationToken::new(),
    );
    let cycle = tokio::spawn(async move { worker.process_next().await });

    started.notified().await;
    *store.foreign_status.lock().unwrap() = Some("paused".to_string());

    let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("handler was not cancelled")
        .unwrap();
    assert_eq!(outcome, CycleOutcome::Resolved(id, Resolution::Unrecognized));
    // Nothing was written over the foreign value.
    assert_eq!(status_of(&store.inner, &id).await, Some(Status::Running));
}

#[tokio::test]
async fn test_heartbeat_errors_do_not_cancel_job() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let outage = store.clone();
    let handler = move |ctx: JobContext, _payload: Payload| {
        let outage = outage.clone();
        async move {
            outage.set_unavailable(true);
            tokio::time::sleep(HEARTBEAT * 5).await;
            outage.set_unavailable(false);
            !ctx.is_cancelled()
        }
    };
    let (worker, _root) = new_worker(&store, handler);

    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Succeeded))
    );
}

#[tokio::test]
async fn test_handler_panic_fails_job() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let id = client.enqueue("a", json!({})).await.unwrap();

    let (worker, _root) = new_worker(&store, explode);

    assert_eq!(
        worker.process_next().await,
        CycleOutcome::Resolved(id, Resolution::Settled(Status::Failed))
    );
    assert_eq!(status_of(&store, &id).await, Some(Status::Failed));
}

#[tokio::test]
async fn test_run_loop_drains_queue_and_stops_on_cancel() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    for i in 0..5 {
        client.enqueue("a", json!({ "n": i })).await.unwrap();
    }

    let (worker, root) = new_worker(&store, |_ctx: JobContext, _payload: Payload| async { true });
    let worker = Arc::new(worker);
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.count(Status::Succeeded).await.unwrap() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "queue not drained");
        tokio::time::sleep(HEARTBEAT).await;
    }

    root.cancel();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_pool_runs_each_job_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let mut ids = Vec::new();
    for i in 0..20 {
        let lane = if i % 2 == 0 { "a" } else { "b" };
        ids.push(client.enqueue(lane, json!({ "n": i })).await.unwrap());
    }

    let runs: Arc<Mutex<HashMap<JobId, usize>>> = Arc::default();
    let handler = {
        let runs = runs.clone();
        move |ctx: JobContext, _payload: Payload| {
            let runs = runs.clone();
            async move {
                *runs.lock().unwrap().entry(ctx.id()).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                true
            }
        }
    };

    let pool = WorkerPool::builder()
        .store(store.clone())
        .config(config())
        .workers(4)
        .shutdown_timeout(Duration::from_secs(1))
        .handler(handler)
        .build()
        .unwrap();

    let shutdown_client = client.clone();
    pool.run_until(async move {
        loop {
            if shutdown_client.count(Status::Succeeded).await.unwrap_or(0) == 20 {
                break;
            }
            tokio::time::sleep(HEARTBEAT).await;
        }
    })
    .await
    .unwrap();

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|count| *count == 1));
    for id in &ids {
        assert_eq!(status_of(&store, id).await, Some(Status::Succeeded));
    }
}

#[tokio::test]
async fn test_pool_stops_when_token_cancelled() {
    let store = MemoryStore::new();
    let pool = WorkerPool::builder()
        .store(store)
        .config(config())
        .workers(2)
        .handler(|_ctx: JobContext, _payload: Payload| async { true })
        .build()
        .unwrap();

    let token = pool.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    tokio::time::timeout(Duration::from_secs(2), pool.run_until(std::future::pending()))
        .await
        .expect("pool did not stop")
        .unwrap();
}
