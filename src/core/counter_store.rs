//! Shared counter storage for fixed-window rate limiting.
//!
//! The limiter never mutates a record in place. It reads the current record,
//! decides, and publishes the next record with [`CounterStore::compare_and_set`],
//! retrying when another caller got there first. Every backend must make that
//! compare-and-set atomic for its own sharing scope:
//!
//! - [`MemoryCounterStore`]: one process, sharded locks from `dashmap`
//! - [`RedisCounterStore`]: any number of processes, a server-side Lua script
//!
//! Shared stores hold records in one canonical JSON form,
//! `{"count":N,"window_start":MILLIS}`. Anything else (other spellings,
//! fractions, out of range numbers) is reported as absent, and a
//! compare-and-set expecting "absent" may overwrite it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::WafResult;

/// Largest `window_start` magnitude a shared store accepts (year 9999).
pub const MAX_STORED_MILLIS: i64 = 253_402_300_799_999;

/// Per-key request count within the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,
}

impl WindowRecord {
    /// First request of a new window.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Canonical encoding used by shared stores.
    pub fn encode(&self) -> WafResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Inverse of [`encode`](Self::encode). Any other text is `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        let record: Self = serde_json::from_str(raw).ok()?;
        let in_range = record.window_start.timestamp_millis().abs() <= MAX_STORED_MILLIS;
        (in_range && record.encode().ok()? == raw).then_some(record)
    }

    pub fn incremented(&self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            window_start: self.window_start,
        }
    }

    /// Whether the window that started at `window_start` has run out.
    ///
    /// A start in the future (clock skew between processes) counts as live.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start >= window
    }

    /// Time left in the window, never less than one millisecond.
    pub fn remaining(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        let left = self.resets_at(window) - now;
        left.max(Duration::milliseconds(1))
    }

    /// End of the window, saturating at the last representable instant.
    pub fn resets_at(&self, window: Duration) -> DateTime<Utc> {
        self.window_start
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Atomic storage for [`WindowRecord`]s.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Current record for `key`. Missing and undecodable records are `None`.
    async fn get(&self, key: &str) -> WafResult<Option<WindowRecord>>;

    /// Replace the record for `key` with `new` if it still equals `expected`.
    ///
    /// `expected == None` succeeds only when no valid record exists. `ttl` is a
    /// hint for backends that expire keys on their own.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&WindowRecord>,
        new: &WindowRecord,
        ttl: Duration,
    ) -> WafResult<bool>;

    /// Drop the record for `key`.
    async fn remove(&self, key: &str) -> WafResult<()>;

    /// Drop records whose window ran out and return how many went.
    ///
    /// Stores that expire keys on their own keep the default.
    async fn purge_expired(&self, _now: DateTime<Utc>, _window: Duration) -> WafResult<usize> {
        Ok(0)
    }
}

/// In-process store. Contention is per shard, never global.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    records: DashMap<String, WindowRecord>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> WafResult<Option<WindowRecord>> {
        Ok(self.records.get(key).map(|r| *r.value()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&WindowRecord>,
        new: &WindowRecord,
        _ttl: Duration,
    ) -> WafResult<bool> {
        // The entry guard holds the shard lock for the whole compare and write.
        let swapped = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get()) {
                    entry.insert(*new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(*new);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn remove(&self, key: &str) -> WafResult<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, window: Duration) -> WafResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now, window));
        Ok(before.saturating_sub(self.records.len()))
    }
}

// Mirrors `WindowRecord::decode`: only the canonical encoding is a record.
// With an expectation, the stored text must equal its encoding byte for byte.
const CAS_SCRIPT: &str = r#"
local function is_record(raw)
  local count, start = string.match(raw, '^{"count":(%d+),"window_start":(%-?%d+)}$')
  if not count or start == '-0' then
    return false
  end
  local digits = string.gsub(start, '^%-', '')
  if #count > 10 or #digits > 15 then
    return false
  end
  if (#count > 1 and string.sub(count, 1, 1) == '0')
     or (#digits > 1 and string.sub(digits, 1, 1) == '0') then
    return false
  end
  return tonumber(count) <= 4294967295 and tonumber(digits) <= tonumber(ARGV[4])
end

local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current and is_record(current) then
    return 0
  end
elseif current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Redis-backed store shared by every process pointing at the same server.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    cas: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis. Keys are namespaced with `key_prefix`.
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> WafResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> WafResult<Option<WindowRecord>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.key(key)).await?;

        // Undecodable values read as absent; the next write replaces them.
        Ok(raw.as_deref().and_then(WindowRecord::decode))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&WindowRecord>,
        new: &WindowRecord,
        ttl: Duration,
    ) -> WafResult<bool> {
        let expected = match expected {
            Some(record) => record.encode()?,
            None => String::new(),
        };
        let payload = new.encode()?;
        let ttl_ms = ttl.num_milliseconds().max(1);

        let mut conn = self.connection.clone();
        let swapped: i32 = self
            .cas
            .key(self.key(key))
            .arg(expected)
            .arg(payload)
            .arg(ttl_ms)
            .arg(MAX_STORED_MILLIS)
            .invoke_async(&mut conn)
            .await?;

        Ok(swapped == 1)
    }

    async fn remove(&self, key: &str) -> WafResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }
}
