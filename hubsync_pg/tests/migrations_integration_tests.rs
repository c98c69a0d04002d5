mod common;

use hubsync_pg::migrations::Migrator;
use serial_test::serial;
use sqlx::PgPool;

async fn teardown(pool: &PgPool) {
    for table in [
        "hubsync_tasks",
        "hubsync_checkpoints",
        "hubsync_stream_entries",
        "hubsync_username_proofs",
        "hubsync_onchain_events",
        "hubsync_messages",
        "hubsync_hub_events",
        "_hubsync_migrations",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
            .execute(pool)
            .await
            .expect("Failed to drop table");
    }
}

#[tokio::test]
#[serial]
async fn test_migrator_starts_at_version_zero() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let version = migrator
        .current_version()
        .await
        .expect("Should get version");
    assert_eq!(version, 0);
    assert_eq!(migrator.pending().await.expect("Should list").len(), 3);

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_runs_all_migrations() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.run().await.expect("Should run migrations");
    assert_eq!(applied, 3);
    assert_eq!(migrator.current_version().await.unwrap(), 3);

    for table in [
        "hubsync_hub_events",
        "hubsync_messages",
        "hubsync_onchain_events",
        "hubsync_username_proofs",
        "hubsync_stream_entries",
        "hubsync_checkpoints",
        "hubsync_tasks",
    ] {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .expect("Failed to query information_schema");
        assert_eq!(count, 1, "{} should exist", table);
    }

    let history = migrator.applied().await.expect("Should list applied");
    let versions: Vec<i64> = history.iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_is_idempotent() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    assert_eq!(migrator.run().await.unwrap(), 3);
    assert_eq!(migrator.run().await.unwrap(), 0);
    assert!(migrator.pending().await.unwrap().is_empty());

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_username_proofs_keep_their_timestamp_in_proof_timestamp() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    teardown(&pool).await;

    Migrator::new(pool.clone()).run().await.unwrap();
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM information_schema.columns
        WHERE table_name = 'hubsync_username_proofs' AND column_name = 'proof_timestamp'
        "#,
    )
    .fetch_one(&pool)
    .await
    .expect("Failed to query information_schema");
    assert_eq!(count, 1);

    teardown(&pool).await;
}
