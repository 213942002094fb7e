//! Integration tests for running host futures on the scheduler's pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use futures::channel::oneshot;
use futures::task::{Spawn, SpawnExt};
use workq::{Error, ExecutorAdapter, Scheduler, WorkOptions};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

fn adapter(consumers: usize) -> ExecutorAdapter {
    let scheduler = Scheduler::builder()
        .consumer_count(consumers)
        .build()
        .expect("scheduler should start");
    ExecutorAdapter::new(Arc::new(scheduler))
}

fn thread_name() -> String {
    thread::current().name().unwrap_or_default().to_string()
}

#[tokio::test]
async fn spawned_future_runs_on_a_consumer() {
    let adapter = adapter(2);
    let ran_on = Arc::new(Mutex::new(String::new()));

    let slot = Arc::clone(&ran_on);
    let handle = adapter
        .spawn(async move {
            *slot.lock().unwrap() = thread_name();
        })
        .unwrap();

    tokio::time::timeout(JOIN_TIMEOUT, handle.join())
        .await
        .expect("task should finish")
        .unwrap();
    assert!(handle.is_finished());
    assert!(ran_on.lock().unwrap().starts_with("workq-consumer-"));
}

#[tokio::test]
async fn woken_future_is_polled_again_on_the_pool() {
    let adapter = adapter(1);
    let (tx, rx) = oneshot::channel::<u32>();
    let received = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&received);
    let handle = adapter
        .spawn(async move {
            let value = rx.await.unwrap_or_default();
            sink.store(value as usize, Ordering::SeqCst);
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    tx.send(17).unwrap();

    tokio::time::timeout(JOIN_TIMEOUT, handle.join())
        .await
        .expect("task should finish")
        .unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 17);
}

#[tokio::test]
async fn panicking_future_faults_its_handle() {
    let adapter = adapter(1);
    let handle = adapter
        .spawn(async {
            panic!("host continuation blew up");
        })
        .unwrap();

    match tokio::time::timeout(JOIN_TIMEOUT, handle.join()).await.unwrap() {
        Err(Error::ExecutionFault { message, .. }) => {
            assert!(message.contains("host continuation blew up"))
        }
        other => panic!("expected ExecutionFault, got {other:?}"),
    }
    assert_eq!(adapter.scheduler().live_consumers(), 1);
}

#[test]
fn fresh_task_runs_inline_on_the_calling_thread() {
    let adapter = adapter(1);
    let ran_on = Arc::new(Mutex::new(String::new()));

    let slot = Arc::clone(&ran_on);
    let task = adapter.task(async move {
        *slot.lock().unwrap() = thread_name();
    });

    assert!(adapter.try_run_inline(&task, false).unwrap());
    assert!(task.is_finished());
    assert_eq!(*ran_on.lock().unwrap(), thread_name());
    // Nothing left to run.
    assert!(!adapter.try_run_inline(&task, false).unwrap());
}

#[test]
fn queued_task_runs_inline_without_being_enqueued_twice() {
    let adapter = adapter(1);
    let scheduler = Arc::clone(adapter.scheduler());

    let (release, hold) = mpsc::channel::<()>();
    scheduler
        .enqueue_with_options(
            move || {
                let _ = hold.recv();
            },
            WorkOptions::new(),
        )
        .unwrap();
    // Let the only consumer pick up the blocker.
    thread::sleep(Duration::from_millis(50));

    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    let task = adapter.task(async move {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    adapter.on_new_async_work_requested(&task).unwrap();
    // A second request while queued is a no-op.
    adapter.on_new_async_work_requested(&task).unwrap();

    let queued = task.queued_work().expect("poll item should be queued");
    assert!(adapter.scheduled_tasks().contains(&queued));
    assert_eq!(scheduler.pending(), 1);

    assert!(adapter.try_run_inline(&task, true).unwrap());
    assert!(task.is_finished());

    release.send(()).unwrap();
    assert!(scheduler.wait_idle(JOIN_TIMEOUT));
    assert_eq!(polls.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_task_runs_inline_at_full_capacity() {
    let scheduler = Scheduler::builder()
        .consumer_count(1)
        .max_queue_items(2)
        .build()
        .unwrap();
    let adapter = ExecutorAdapter::new(Arc::new(scheduler));

    let (release, hold) = mpsc::channel::<()>();
    adapter
        .scheduler()
        .enqueue(move || {
            let _ = hold.recv();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    let task = adapter.task(async {});
    adapter.on_new_async_work_requested(&task).unwrap();
    assert!(adapter.spawn(async {}).is_err());

    // The queued poll already holds its slot; running it inline adds no load.
    assert!(adapter.try_run_inline(&task, true).unwrap());
    assert!(task.is_finished());

    release.send(()).unwrap();
    assert!(adapter.scheduler().wait_idle(JOIN_TIMEOUT));
}

#[test]
fn inline_run_of_an_unqueued_task_with_the_queued_flag_does_nothing() {
    let adapter = adapter(1);
    let task = adapter.task(async {});
    assert!(!adapter.try_run_inline(&task, true).unwrap());
    assert!(!task.is_finished());
}

#[tokio::test]
async fn poll_item_expiring_in_the_queue_cancels_the_task() {
    let scheduler = Scheduler::builder()
        .consumer_count(1)
        .due_time_secs(1)
        .build()
        .unwrap();
    let adapter = ExecutorAdapter::new(Arc::new(scheduler));

    let (release, hold) = mpsc::channel::<()>();
    adapter
        .scheduler()
        .enqueue(move || {
            let _ = hold.recv_timeout(Duration::from_millis(1500));
        })
        .unwrap();

    let handle = adapter.spawn(async {}).unwrap();
    let err = tokio::time::timeout(JOIN_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancellation(), "{err}");
    drop(release);
}

#[test]
fn disposed_scheduler_refuses_host_work() {
    let adapter = adapter(1);
    adapter.scheduler().dispose();

    assert!(matches!(adapter.spawn(async {}), Err(Error::Disposed(_))));
    assert!(adapter.status().is_err());
}

#[tokio::test]
async fn works_as_a_futures_spawner() {
    let adapter = adapter(2);
    assert!(adapter.status().is_ok());

    let (tx, rx) = oneshot::channel();
    SpawnExt::spawn(&adapter, async move {
        let _ = tx.send(thread_name());
    })
    .unwrap();

    let name = tokio::time::timeout(JOIN_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(name.starts_with("workq-consumer-"));
}
