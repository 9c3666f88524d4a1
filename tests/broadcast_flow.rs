use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use accessd::broadcast::{
    BroadcastDispatcher, BroadcastJob, BroadcastPacing, BroadcastStore, MemoryBroadcastStore,
};
use accessd::directory::MemoryUserDirectory;
use accessd::notify::NotificationSink;

/// Sink that records deliveries and fails for a chosen set of recipients.
#[derive(Default)]
struct ScriptedSink {
    delivered: Mutex<Vec<i64>>,
    failing: HashSet<i64>,
    per_delivery_sleep: Option<Duration>,
}

#[async_trait]
impl NotificationSink for ScriptedSink {
    async fn deliver(&self, user_id: i64, _text: &str) -> Result<()> {
        if let Some(pause) = self.per_delivery_sleep {
            tokio::time::sleep(pause).await;
        }
        if self.failing.contains(&user_id) {
            return Err(anyhow!("recipient {user_id} unreachable"));
        }
        self.delivered.lock().unwrap().push(user_id);
        Ok(())
    }
}

fn fast_pacing() -> BroadcastPacing {
    BroadcastPacing {
        delay: Duration::from_millis(1),
        delivery_timeout: Duration::from_millis(200),
    }
}

fn dispatcher(
    users: Vec<i64>,
    sink: Arc<ScriptedSink>,
    store: Arc<MemoryBroadcastStore>,
    pacing: BroadcastPacing,
) -> Arc<BroadcastDispatcher> {
    Arc::new(BroadcastDispatcher::new(
        store,
        Arc::new(MemoryUserDirectory::with_users(users)),
        sink,
        pacing,
    ))
}

async fn wait_completed(dispatcher: &BroadcastDispatcher, job_id: Uuid) -> BroadcastJob {
    for _ in 0..200 {
        let job = dispatcher.status(job_id).await.unwrap().unwrap();
        if job.completed {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broadcast {job_id} did not complete in time");
}

async fn wait_stopped(dispatcher: &BroadcastDispatcher, job_id: Uuid) {
    for _ in 0..200 {
        if !dispatcher.is_running(job_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broadcast {job_id} runner did not stop in time");
}

#[tokio::test]
async fn broadcast_reaches_every_recipient_in_snapshot_order() {
    let sink = Arc::new(ScriptedSink::default());
    let store = Arc::new(MemoryBroadcastStore::new());
    let dispatcher = dispatcher(vec![10, 20, 30, 40, 50], sink.clone(), store, fast_pacing());

    let job_id = dispatcher
        .start("maintenance tonight".into(), Utc::now())
        .await
        .unwrap();
    let job = wait_completed(&dispatcher, job_id).await;

    assert_eq!(job.total_recipients, 5);
    assert_eq!(job.sent_count, 5);
    assert_eq!(job.failed_count, 0);
    assert_eq!(*sink.delivered.lock().unwrap(), vec![10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn per_recipient_failures_are_counted_and_never_abort_the_run() {
    let sink = Arc::new(ScriptedSink {
        failing: HashSet::from([20, 40]),
        ..Default::default()
    });
    let store = Arc::new(MemoryBroadcastStore::new());
    let dispatcher = dispatcher(vec![10, 20, 30, 40, 50], sink.clone(), store, fast_pacing());

    let job_id = dispatcher.start("hello".into(), Utc::now()).await.unwrap();
    let job = wait_completed(&dispatcher, job_id).await;

    assert_eq!(job.sent_count, 3);
    assert_eq!(job.failed_count, 2);
    assert!(job.completed);
    assert_eq!(*sink.delivered.lock().unwrap(), vec![10, 30, 50]);
}

#[tokio::test]
async fn slow_deliveries_time_out_as_failures() {
    let sink = Arc::new(ScriptedSink {
        per_delivery_sleep: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let store = Arc::new(MemoryBroadcastStore::new());
    let pacing = BroadcastPacing {
        delay: Duration::from_millis(1),
        delivery_timeout: Duration::from_millis(20),
    };
    let dispatcher = dispatcher(vec![1, 2], sink.clone(), store, pacing);

    let job_id = dispatcher.start("slow".into(), Utc::now()).await.unwrap();
    let job = wait_completed(&dispatcher, job_id).await;

    assert_eq!(job.sent_count, 0);
    assert_eq!(job.failed_count, 2);
}

#[tokio::test]
async fn resume_picks_up_at_the_persisted_offset_without_duplicates() {
    let recipients: Vec<i64> = (1..=6).collect();
    let sink = Arc::new(ScriptedSink::default());
    let store = Arc::new(MemoryBroadcastStore::new());

    // A job interrupted after three attempts: two delivered, one failed.
    let job = BroadcastJob {
        job_id: Uuid::new_v4(),
        message: "resumed".into(),
        recipients: recipients.clone(),
        total_recipients: recipients.len() as i64,
        sent_count: 2,
        failed_count: 1,
        completed: false,
        created_at: Utc::now(),
    };
    store.create(job.clone()).await.unwrap();

    let dispatcher = dispatcher(recipients, sink.clone(), store, fast_pacing());
    dispatcher.resume(job.job_id).await.unwrap();
    let finished = wait_completed(&dispatcher, job.job_id).await;

    // Only recipients 4..6 were attempted on this run.
    assert_eq!(*sink.delivered.lock().unwrap(), vec![4, 5, 6]);
    assert_eq!(finished.sent_count, 5);
    assert_eq!(finished.failed_count, 1);
}

#[tokio::test]
async fn resuming_a_completed_job_delivers_nothing() {
    let sink = Arc::new(ScriptedSink::default());
    let store = Arc::new(MemoryBroadcastStore::new());
    let job = BroadcastJob {
        job_id: Uuid::new_v4(),
        message: "done".into(),
        recipients: vec![1, 2, 3],
        total_recipients: 3,
        sent_count: 3,
        failed_count: 0,
        completed: true,
        created_at: Utc::now(),
    };
    store.create(job.clone()).await.unwrap();

    let dispatcher = dispatcher(vec![1, 2, 3], sink.clone(), store, fast_pacing());
    let returned = dispatcher.resume(job.job_id).await.unwrap();

    assert!(returned.completed);
    assert!(!dispatcher.is_running(job.job_id));
    assert!(sink.delivered.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_then_resume_attempts_each_recipient_exactly_once() {
    let recipients: Vec<i64> = (1..=20).collect();
    let sink = Arc::new(ScriptedSink::default());
    let store = Arc::new(MemoryBroadcastStore::new());
    let pacing = BroadcastPacing {
        delay: Duration::from_millis(20),
        delivery_timeout: Duration::from_millis(200),
    };
    let dispatcher = dispatcher(recipients.clone(), sink.clone(), store, pacing);

    let job_id = dispatcher.start("big one".into(), Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatcher.cancel(job_id);
    wait_stopped(&dispatcher, job_id).await;

    // The checkpoint is consistent whenever the cancel landed.
    let paused = dispatcher.status(job_id).await.unwrap().unwrap();
    assert_eq!(
        paused.sent_count + paused.failed_count,
        sink.delivered.lock().unwrap().len() as i64
    );

    if !paused.completed {
        dispatcher.resume(job_id).await.unwrap();
    }
    let finished = wait_completed(&dispatcher, job_id).await;
    assert_eq!(finished.sent_count, 20);
    assert_eq!(finished.failed_count, 0);

    // No recipient was attempted twice across the two runs.
    let delivered = sink.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 20);
    assert_eq!(delivered.iter().collect::<HashSet<_>>().len(), 20);
}
