//! Idempotency records in PostgreSQL.
//!
//! The atomic claim is `INSERT .. ON CONFLICT DO NOTHING`: the row's
//! primary key serializes concurrent writers, so exactly one `begin`
//! inserts and wins.

use crate::core_types::UserId;
use crate::idempotency::{Begin, IdempotencyError, IdempotencyStore, StoredResult};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

const STATE_IN_FLIGHT: i16 = 0;
const STATE_DONE: i16 = 1;

pub struct PgIdempotencyStore {
    pool: PgPool,
    ttl_secs: i64,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, ttl_secs: i64) -> Self {
        Self { pool, ttl_secs }
    }

    async fn try_claim(&self, key: &str, user_id: UserId) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_tb (key, user_id, state, expires_at)
            VALUES ($1, $2, $3, NOW() + $4 * INTERVAL '1 second')
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(user_id as i64)
        .bind(STATE_IN_FLIGHT)
        .bind(self.ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reclaim an expired key. CAS on `expires_at` so only one caller
    /// takes over.
    async fn try_reclaim(&self, key: &str, user_id: UserId) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_tb
            SET user_id = $2, state = $3, payload = NULL, status_code = NULL,
                expires_at = NOW() + $4 * INTERVAL '1 second'
            WHERE key = $1 AND expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(user_id as i64)
        .bind(STATE_IN_FLIGHT)
        .bind(self.ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(&self, key: &str, user_id: UserId) -> Result<Begin, IdempotencyError> {
        if self.try_claim(key, user_id).await? {
            return Ok(Begin::Fresh);
        }

        let row = sqlx::query(
            r#"
            SELECT state, payload, status_code, expires_at <= NOW() AS expired
            FROM idempotency_tb
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            // Deleted between the claim and the read; claim again.
            return if self.try_claim(key, user_id).await? {
                Ok(Begin::Fresh)
            } else {
                Ok(Begin::InFlight)
            };
        };

        if row.get::<bool, _>("expired") {
            return if self.try_reclaim(key, user_id).await? {
                Ok(Begin::Fresh)
            } else {
                Ok(Begin::InFlight)
            };
        }

        match row.get::<i16, _>("state") {
            STATE_DONE => Ok(Begin::Replay(StoredResult {
                payload: row.get::<serde_json::Value, _>("payload"),
                status_code: row.get::<i16, _>("status_code") as u16,
            })),
            _ => Ok(Begin::InFlight),
        }
    }

    async fn complete(&self, key: &str, result: StoredResult) -> Result<(), IdempotencyError> {
        // At most one outcome per key: only the in-flight row is written.
        sqlx::query(
            r#"
            UPDATE idempotency_tb
            SET state = $2, payload = $3, status_code = $4
            WHERE key = $1 AND state = $5
            "#,
        )
        .bind(key)
        .bind(STATE_DONE)
        .bind(&result.payload)
        .bind(result.status_code as i16)
        .bind(STATE_IN_FLIGHT)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
