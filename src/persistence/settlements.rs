//! Settlement records in PostgreSQL, so confirmation tracking survives a
//! process restart.

use crate::core_types::TxId;
use crate::settlement::{SettlementError, SettlementRecord, SettlementState, SettlementStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<SettlementRecord, SettlementError> {
        let state_id: i16 = row.get("state");
        Ok(SettlementRecord {
            tx_id: row.get::<TxId, _>("tx_id"),
            chain_id: row.get::<i32, _>("chain_id") as u32,
            tx_hash: row.get("tx_hash"),
            state: SettlementState::from_id(state_id).ok_or_else(|| {
                SettlementError::Unavailable(format!("unknown settlement state id {state_id}"))
            })?,
            confirmations: row.get::<i32, _>("confirmations") as u32,
            registered_at: row.get::<DateTime<Utc>, _>("registered_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    async fn upsert(&self, record: &SettlementRecord) -> Result<(), SettlementError> {
        sqlx::query(
            r#"
            INSERT INTO settlements_tb
                (tx_id, chain_id, tx_hash, state, confirmations, registered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tx_id) DO UPDATE
            SET tx_hash = EXCLUDED.tx_hash,
                state = EXCLUDED.state,
                confirmations = EXCLUDED.confirmations,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.tx_id)
        .bind(record.chain_id as i32)
        .bind(&record.tx_hash)
        .bind(record.state.id())
        .bind(record.confirmations as i32)
        .bind(record.registered_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, tx_id: TxId) -> Result<Option<SettlementRecord>, SettlementError> {
        let row = sqlx::query(
            r#"
            SELECT tx_id, chain_id, tx_hash, state, confirmations, registered_at, updated_at
            FROM settlements_tb
            WHERE tx_id = $1
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn load_active(&self) -> Result<Vec<SettlementRecord>, SettlementError> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, chain_id, tx_hash, state, confirmations, registered_at, updated_at
            FROM settlements_tb
            WHERE state NOT IN ($1, $2, $3)
            ORDER BY registered_at ASC
            "#,
        )
        .bind(SettlementState::Finalized.id())
        .bind(SettlementState::Reverted.id())
        .bind(SettlementState::TimedOut.id())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_upsert_get_and_resume() {
        let store = PgSettlementStore::new(test_pool().await);
        let mut record = SettlementRecord::new(uuid::Uuid::new_v4(), 1, Some("0xabc".into()));
        store.upsert(&record).await.unwrap();

        let loaded = store.get(record.tx_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SettlementState::Pending);
        assert_eq!(loaded.tx_hash.as_deref(), Some("0xabc"));

        let active = store.load_active().await.unwrap();
        assert!(active.iter().any(|r| r.tx_id == record.tx_id));

        record.state = SettlementState::Finalized;
        record.confirmations = 12;
        record.updated_at = Utc::now();
        store.upsert(&record).await.unwrap();

        let active = store.load_active().await.unwrap();
        assert!(!active.iter().any(|r| r.tx_id == record.tx_id));
    }
}
