use anyhow::Result;
use sqlx::PgPool;

const CREATE_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transactions_tb (
    id UUID PRIMARY KEY,
    user_id BIGINT NOT NULL,
    kind SMALLINT NOT NULL,
    side SMALLINT,
    base VARCHAR(16) NOT NULL,
    quote VARCHAR(16) NOT NULL,
    amount NUMERIC(30, 12) NOT NULL,
    counter_amount NUMERIC(30, 12),
    limit_price NUMERIC(30, 12),
    chain_id INTEGER,
    status SMALLINT NOT NULL,
    external_ref TEXT,
    idempotency_key VARCHAR(64) UNIQUE,
    failure_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TRANSACTIONS_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS transactions_user_idx
    ON transactions_tb (user_id, created_at DESC)
"#;

const CREATE_IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_tb (
    key VARCHAR(64) PRIMARY KEY,
    user_id BIGINT NOT NULL,
    state SMALLINT NOT NULL,
    payload JSONB,
    status_code SMALLINT,
    expires_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_SETTLEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS settlements_tb (
    tx_id UUID PRIMARY KEY,
    chain_id INTEGER NOT NULL,
    tx_hash TEXT,
    state SMALLINT NOT NULL,
    confirmations INTEGER NOT NULL DEFAULT 0,
    registered_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

/// Create every table and index this crate needs. Idempotent.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");
    sqlx::query(CREATE_TRANSACTIONS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_TRANSACTIONS_USER_INDEX).execute(pool).await?;
    sqlx::query(CREATE_IDEMPOTENCY_TABLE).execute(pool).await?;
    sqlx::query(CREATE_SETTLEMENTS_TABLE).execute(pool).await?;
    Ok(())
}
