mod common;

use std::time::Duration;

use hubsync_core::prelude::*;
use hubsync_pg::PgTaskQueue;
use serial_test::serial;

fn config(max_attempts: u32) -> TaskQueueConfig {
    TaskQueueConfig {
        max_attempts,
        retry: Backoff::new(Duration::ZERO, Duration::ZERO),
    }
}

#[tokio::test]
#[serial]
async fn test_tasks_are_leased_in_enqueue_order() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::setup(&pool).await;
    let queue = PgTaskQueue::new(pool.clone(), config(3));

    let first = queue.enqueue(BackfillTask::reconcile(vec![1, 2])).await.unwrap();
    let second = queue.enqueue(BackfillTask::reconcile(vec![3])).await.unwrap();

    let leased = queue.dequeue().await.unwrap().expect("a ready task");
    assert_eq!(leased.id, first);
    assert_eq!(leased.task, BackfillTask::reconcile(vec![1, 2]));
    assert_eq!(leased.attempts, 0);
    assert_eq!(queue.dequeue().await.unwrap().map(|t| t.id), Some(second));
    assert!(queue.dequeue().await.unwrap().is_none());

    queue.ack(first).await.unwrap();
    assert_eq!(queue.count("done").await.unwrap(), 1);
    assert_eq!(queue.count("leased").await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn test_ack_requires_a_lease() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::setup(&pool).await;
    let queue = PgTaskQueue::new(pool.clone(), config(3));

    let id = queue.enqueue(BackfillTask::reconcile(vec![1])).await.unwrap();
    let err = queue.ack(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains("not leased"));
}

#[tokio::test]
#[serial]
async fn test_failed_tasks_retry_then_die() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::setup(&pool).await;
    let queue = PgTaskQueue::new(pool.clone(), config(2));

    let id = queue.enqueue(BackfillTask::reconcile(vec![1])).await.unwrap();

    let leased = queue.dequeue().await.unwrap().unwrap();
    queue.nack(leased.id, "hub unavailable").await.unwrap();
    assert_eq!(queue.count("ready").await.unwrap(), 1);

    let retried = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.attempts, 1);
    queue.nack(retried.id, "1 of 1 fids failed").await.unwrap();

    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.count("dead").await.unwrap(), 1);
    let (attempts, last_error): (i32, Option<String>) =
        sqlx::query_as("SELECT attempts, last_error FROM hubsync_tasks WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(attempts, 2);
    assert_eq!(last_error.as_deref(), Some("1 of 1 fids failed"));
}

#[tokio::test]
#[serial]
async fn test_stale_leases_are_requeued() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::setup(&pool).await;
    let queue = PgTaskQueue::new(pool.clone(), config(3));

    let id = queue.enqueue(BackfillTask::reconcile(vec![1])).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    assert_eq!(
        queue.requeue_stale(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(queue.dequeue().await.unwrap().map(|t| t.id), Some(id));
}
