//! Idempotency Store
//!
//! Durable key -> result cache preventing duplicate side effects from
//! retried requests. Client retries on network failure are an expected
//! path, not an exceptional one; this store is the primary defense and
//! sits in front of everything else in the pipeline.
//!
//! # Contract
//!
//! - `begin` is atomic with respect to concurrent callers holding the
//!   same key: exactly one caller receives [`Begin::Fresh`]; the rest see
//!   [`Begin::InFlight`] until the winner completes, then
//!   [`Begin::Replay`] with the winner's stored result.
//! - Records expire after a TTL (default 24h); expired keys are absent.
//! - If the store is unreachable the caller must fail closed: duplicate
//!   financial execution is worse than unavailability.

use crate::core_types::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        IdempotencyError::Unavailable(e.to_string())
    }
}

/// Result payload stored per key. Both successes and failures are cached
/// so a retry replays the original outcome either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub payload: serde_json::Value,
    pub status_code: u16,
}

/// Outcome of `begin`.
#[derive(Debug, Clone)]
pub enum Begin {
    /// This caller owns the key; it must eventually call `complete`.
    Fresh,
    /// Another caller already finished; here is its stored result.
    Replay(StoredResult),
    /// Another caller holds the key but has not completed yet.
    InFlight,
}

/// Derive a deterministic idempotency key from the semantic content of a
/// request. Two requests with identical semantic fields map to one key.
pub fn derive_key(user_id: UserId, semantic_fields: &[&str]) -> String {
    let mut canon = format!("u={}", user_id);
    for field in semantic_fields {
        canon.push('|');
        canon.push_str(field);
    }
    format!("{:x}", md5::compute(canon.as_bytes()))
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim a key or learn its prior outcome.
    async fn begin(&self, key: &str, user_id: UserId) -> Result<Begin, IdempotencyError>;

    /// Record the final outcome for a key claimed with `Fresh`.
    async fn complete(
        &self,
        key: &str,
        result: StoredResult,
    ) -> Result<(), IdempotencyError>;
}

#[derive(Debug, Clone)]
enum RecordState {
    InFlight,
    Done(StoredResult),
}

#[derive(Debug, Clone)]
struct Record {
    state: RecordState,
    expires_at: DateTime<Utc>,
}

/// In-memory idempotency store backed by a concurrent map. The entry API
/// makes the claim atomic: exactly one concurrent `begin` inserts.
pub struct MemoryIdempotencyStore {
    records: DashMap<String, Record>,
    ttl: Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::seconds(ttl_secs),
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        // 24h, matching the configured default.
        Self::new(86_400)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(&self, key: &str, _user_id: UserId) -> Result<Begin, IdempotencyError> {
        let now = Utc::now();
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Record {
                    state: RecordState::InFlight,
                    expires_at: now + self.ttl,
                });
                Ok(Begin::Fresh)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at <= now {
                    // Expired keys are treated as absent.
                    slot.insert(Record {
                        state: RecordState::InFlight,
                        expires_at: now + self.ttl,
                    });
                    return Ok(Begin::Fresh);
                }
                match &slot.get().state {
                    RecordState::InFlight => Ok(Begin::InFlight),
                    RecordState::Done(result) => Ok(Begin::Replay(result.clone())),
                }
            }
        }
    }

    async fn complete(
        &self,
        key: &str,
        result: StoredResult,
    ) -> Result<(), IdempotencyError> {
        if let Some(mut record) = self.records.get_mut(key) {
            // A key is written at most once per outcome.
            if matches!(record.state, RecordState::InFlight) {
                record.state = RecordState::Done(result);
            }
        }
        Ok(())
    }
}
