//! Transaction rows in PostgreSQL.

use crate::core_types::{CurrencyPair, TxId};
use crate::error::CoreError;
use crate::executor::TransactionStore;
use crate::transaction::{Side, Transaction, TxKind, TxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_tx(row: &sqlx::postgres::PgRow) -> Result<Transaction, CoreError> {
        let kind_id: i16 = row.get("kind");
        let status_id: i16 = row.get("status");
        let side_id: Option<i16> = row.get("side");
        let base: String = row.get("base");
        let quote: String = row.get("quote");
        Ok(Transaction {
            id: row.get::<TxId, _>("id"),
            user_id: row.get::<i64, _>("user_id") as u64,
            kind: TxKind::from_id(kind_id)
                .ok_or_else(|| CoreError::Internal(format!("unknown kind id {kind_id}")))?,
            side: match side_id {
                Some(1) => Some(Side::Buy),
                Some(2) => Some(Side::Sell),
                Some(other) => {
                    return Err(CoreError::Internal(format!("unknown side id {other}")));
                }
                None => None,
            },
            pair: CurrencyPair::new(&base, &quote),
            amount: row.get::<Decimal, _>("amount"),
            counter_amount: row.get::<Option<Decimal>, _>("counter_amount"),
            limit_price: row.get::<Option<Decimal>, _>("limit_price"),
            chain_id: row.get::<Option<i32>, _>("chain_id").map(|c| c as u32),
            status: TxStatus::from_id(status_id)
                .ok_or_else(|| CoreError::Internal(format!("unknown status id {status_id}")))?,
            external_ref: row.get("external_ref"),
            idempotency_key: row.get("idempotency_key"),
            failure_reason: row.get("failure_reason"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }

    fn side_id(side: Option<Side>) -> Option<i16> {
        side.map(|s| match s {
            Side::Buy => 1,
            Side::Sell => 2,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, kind, side, base, quote, amount, counter_amount,
           limit_price, chain_id, status, external_ref, idempotency_key,
           failure_reason, created_at, updated_at
    FROM transactions_tb
"#;

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, tx: &Transaction) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions_tb
                (id, user_id, kind, side, base, quote, amount, counter_amount,
                 limit_price, chain_id, status, external_ref, idempotency_key,
                 failure_reason, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(tx.id)
        .bind(tx.user_id as i64)
        .bind(tx.kind.id())
        .bind(Self::side_id(tx.side))
        .bind(&tx.pair.base)
        .bind(&tx.pair.quote)
        .bind(tx.amount)
        .bind(tx.counter_amount)
        .bind(tx.limit_price)
        .bind(tx.chain_id.map(|c| c as i32))
        .bind(tx.status.id())
        .bind(&tx.external_ref)
        .bind(&tx.idempotency_key)
        .bind(&tx.failure_reason)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: TxId) -> Result<Option<Transaction>, CoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tx).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE idempotency_key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tx).transpose()
    }

    async fn persist(&self, tx: &Transaction) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = $2, counter_amount = $3, chain_id = $4,
                external_ref = $5, failure_reason = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(tx.id)
        .bind(tx.status.id())
        .bind(tx.counter_amount)
        .bind(tx.chain_id.map(|c| c as i32))
        .bind(&tx.external_ref)
        .bind(&tx.failure_reason)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(tx.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;
    use rust_decimal_macros::dec;

    fn sample() -> Transaction {
        let mut tx = Transaction::new(
            42,
            TxKind::Swap,
            None,
            CurrencyPair::new("USDC", "ETH"),
            dec!(50),
        );
        tx.idempotency_key = Some(uuid::Uuid::new_v4().to_string());
        tx.chain_id = Some(1);
        tx
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_insert_get_roundtrip() {
        let store = PgTransactionStore::new(test_pool().await);
        let tx = sample();
        store.insert(&tx).await.unwrap();

        let loaded = store.get(tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, tx.id);
        assert_eq!(loaded.user_id, 42);
        assert_eq!(loaded.kind, TxKind::Swap);
        assert_eq!(loaded.amount, dec!(50));
        assert_eq!(loaded.status, TxStatus::Pending);

        let by_key = store
            .find_by_idempotency_key(tx.idempotency_key.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, tx.id);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_duplicate_idempotency_key_rejected_by_constraint() {
        let store = PgTransactionStore::new(test_pool().await);
        let tx = sample();
        store.insert(&tx).await.unwrap();

        let mut dup = sample();
        dup.idempotency_key = tx.idempotency_key.clone();
        assert!(store.insert(&dup).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_persist_updates_status() {
        let store = PgTransactionStore::new(test_pool().await);
        let mut tx = sample();
        store.insert(&tx).await.unwrap();

        tx.status = TxStatus::Failed;
        tx.failure_reason = Some("EXECUTION_FAILED: boom".into());
        tx.updated_at = Utc::now();
        store.persist(&tx).await.unwrap();

        let loaded = store.get(tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TxStatus::Failed);
        assert!(loaded.failure_reason.is_some());
    }
}
