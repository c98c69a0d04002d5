#![allow(dead_code)]

use hubsync_core::prelude::*;
use hubsync_pg::Migrator;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Connects to `DATABASE_URL`. Returns `None` when it is not set so the suite can run
/// without a database.
pub async fn get_pg_pool() -> Option<PgPool> {
    init_logs();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        log::warn!("DATABASE_URL is not set, skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
        .expect("Failed to create Postgres pool");
    Some(pool)
}

/// Migrates the schema and empties every hubsync table.
pub async fn setup(pool: &PgPool) {
    Migrator::new(pool.clone())
        .run()
        .await
        .expect("Failed to run migrations");
    sqlx::query(
        r#"
        TRUNCATE hubsync_hub_events, hubsync_messages, hubsync_onchain_events,
            hubsync_username_proofs, hubsync_stream_entries, hubsync_checkpoints,
            hubsync_tasks
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to truncate tables");
}

pub fn cast(fid: u64, hash: u8) -> Message {
    Message {
        hash: MessageHash::from(vec![fid as u8, hash]),
        fid,
        message_type: MessageType::CastAdd,
        timestamp: 1_000 + hash as u32,
        body: serde_json::json!({ "text": format!("cast {}", hash) }),
    }
}

pub fn proof(name: &str, fid: u64, timestamp: i64) -> UserNameProof {
    UserNameProof {
        name: name.to_string(),
        fid,
        owner: HexBytes(vec![0xab; 20]),
        proof_type: UserNameType::Fname,
        timestamp,
        signature: HexBytes(vec![0x01]),
    }
}
