use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use thiserror::Error;
use tokio::time::timeout;

/// Enumeration of errors for operations against the shared set store.
/// Errors can originate from redis and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: &'static str,
        error: redis::RedisError,
    },
    #[error("{command} command timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A key-addressed set and counter store shared by every task of a run.
///
/// Every operation must be atomic on the store side: callers never take locks of their own.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add `value` to `set`. Returns whether it was newly added.
    async fn add_member(&self, set: &str, value: &str) -> StoreResult<bool>;

    /// Add every value to `set` in one round-trip. Returns how many were newly added.
    async fn add_members(&self, set: &str, values: &[String]) -> StoreResult<u64>;

    /// Atomically remove and return up to `count` members of `set`.
    async fn pop_members(&self, set: &str, count: usize) -> StoreResult<Vec<String>>;

    async fn cardinality(&self, set: &str) -> StoreResult<u64>;

    async fn members(&self, set: &str) -> StoreResult<Vec<String>>;

    /// Remove `key` entirely, whether it holds a set or a counter.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Increment `counter` by one and return the new value.
    async fn increment(&self, counter: &str) -> StoreResult<u64>;

    async fn set_counter(&self, counter: &str, value: u64) -> StoreResult<()>;

    /// Read `counter`, where a missing counter reads as zero.
    async fn counter(&self, counter: &str) -> StoreResult<u64>;
}

/// A `Store` backed by redis sets (SADD, SPOP, SCARD, SMEMBERS) and integer keys (INCR, SET, GET).
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to the redis server at `addr`. Every command is bounded by `timeout`.
    pub async fn new(addr: &str, timeout: Duration) -> StoreResult<RedisStore> {
        let client = redis::Client::open(addr).map_err(|error| StoreError::CommandError {
            command: "CONNECT",
            error,
        })?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|error| StoreError::CommandError {
                command: "CONNECT",
                error,
            })?;

        Ok(RedisStore {
            connection,
            timeout,
        })
    }

    async fn run<T, F>(&self, command: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|error| StoreError::CommandError { command, error }),
            Err(_) => Err(StoreError::Timeout {
                command,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn add_member(&self, set: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let added: u64 = self.run("SADD", conn.sadd(set, value)).await?;

        Ok(added > 0)
    }

    async fn add_members(&self, set: &str, values: &[String]) -> StoreResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        self.run("SADD", conn.sadd(set, values)).await
    }

    async fn pop_members(&self, set: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        // SPOP with a count is a single atomic command, concurrent callers never see the same member.
        let mut cmd = redis::cmd("SPOP");
        cmd.arg(set).arg(count);

        self.run("SPOP", cmd.query_async(&mut conn)).await
    }

    async fn cardinality(&self, set: &str) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        self.run("SCARD", conn.scard(set)).await
    }

    async fn members(&self, set: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        self.run("SMEMBERS", conn.smembers(set)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _removed: u64 = self.run("DEL", conn.del(key)).await?;

        Ok(())
    }

    async fn increment(&self, counter: &str) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        self.run("INCR", conn.incr(counter, 1)).await
    }

    async fn set_counter(&self, counter: &str, value: u64) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.run::<(), _>("SET", conn.set(counter, value)).await
    }

    async fn counter(&self, counter: &str) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = self.run("GET", conn.get(counter)).await?;

        Ok(value.unwrap_or(0))
    }
}

/// An in-memory `Store` with the same atomicity as redis, used in tests.
///
/// Failures can be injected to simulate an unreachable server.
#[derive(Default)]
pub struct MockStore {
    sets: Mutex<HashMap<String, HashSet<String>>>,
    counters: Mutex<HashMap<String, u64>>,
    failures: AtomicUsize,
    unavailable: AtomicBool,
}

impl MockStore {
    pub fn new() -> MockStore {
        MockStore::default()
    }

    /// Make the next `count` operations fail, whatever they are.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make every operation fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, command: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} rejected", command)));
        }

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("{} failed", command)));
        }

        Ok(())
    }

    fn lock_sets(&self) -> StoreResult<MutexGuard<'_, HashMap<String, HashSet<String>>>> {
        self.sets
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned set lock".to_owned()))
    }

    fn lock_counters(&self) -> StoreResult<MutexGuard<'_, HashMap<String, u64>>> {
        self.counters
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned counter lock".to_owned()))
    }

    fn with_sets<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut HashMap<String, HashSet<String>>) -> T,
    ) -> StoreResult<T> {
        self.check(command)?;

        let mut sets = self.lock_sets()?;
        Ok(f(&mut sets))
    }

    fn with_counters<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut HashMap<String, u64>) -> T,
    ) -> StoreResult<T> {
        self.check(command)?;

        let mut counters = self.lock_counters()?;
        Ok(f(&mut counters))
    }
}

#[async_trait]
impl Store for MockStore {
    async fn add_member(&self, set: &str, value: &str) -> StoreResult<bool> {
        self.with_sets("SADD", |sets| {
            sets.entry(set.to_owned())
                .or_default()
                .insert(value.to_owned())
        })
    }

    async fn add_members(&self, set: &str, values: &[String]) -> StoreResult<u64> {
        self.with_sets("SADD", |sets| {
            let members = sets.entry(set.to_owned()).or_default();
            values
                .iter()
                .filter(|value| members.insert((*value).clone()))
                .count() as u64
        })
    }

    async fn pop_members(&self, set: &str, count: usize) -> StoreResult<Vec<String>> {
        self.with_sets("SPOP", |sets| {
            let Some(members) = sets.get_mut(set) else {
                return Vec::new();
            };

            let popped: Vec<String> = members.iter().take(count).cloned().collect();
            for member in &popped {
                members.remove(member);
            }
            if members.is_empty() {
                sets.remove(set);
            }

            popped
        })
    }

    async fn cardinality(&self, set: &str) -> StoreResult<u64> {
        self.with_sets("SCARD", |sets| {
            sets.get(set).map_or(0, |members| members.len() as u64)
        })
    }

    async fn members(&self, set: &str) -> StoreResult<Vec<String>> {
        self.with_sets("SMEMBERS", |sets| {
            sets.get(set)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check("DEL")?;
        self.lock_sets()?.remove(key);
        self.lock_counters()?.remove(key);

        Ok(())
    }

    async fn increment(&self, counter: &str) -> StoreResult<u64> {
        self.with_counters("INCR", |counters| {
            let value = counters.entry(counter.to_owned()).or_insert(0);
            *value += 1;
            *value
        })
    }

    async fn set_counter(&self, counter: &str, value: u64) -> StoreResult<()> {
        self.with_counters("SET", |counters| {
            counters.insert(counter.to_owned(), value);
        })
    }

    async fn counter(&self, counter: &str) -> StoreResult<u64> {
        self.with_counters("GET", |counters| {
            counters.get(counter).copied().unwrap_or(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_add_member_is_idempotent() {
        let store = MockStore::new();

        assert!(store.add_member("cities", "Delhi").await.unwrap());
        assert!(!store.add_member("cities", "Delhi").await.unwrap());
        assert_eq!(store.cardinality("cities").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_members_removes_what_it_returns() {
        let store = MockStore::new();
        let values: Vec<String> = (0..10).map(|i| format!("1100{:02}", i)).collect();
        assert_eq!(store.add_members("pincodes", &values).await.unwrap(), 10);

        let first = store.pop_members("pincodes", 4).await.unwrap();
        let second = store.pop_members("pincodes", 4).await.unwrap();
        let third = store.pop_members("pincodes", 4).await.unwrap();
        let fourth = store.pop_members("pincodes", 4).await.unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_eq!(third.len(), 2);
        assert!(fourth.is_empty());
        assert_eq!(store.cardinality("pincodes").await.unwrap(), 0);

        let mut all: Vec<String> = [first, second, third].concat();
        all.sort();
        assert_eq!(all, values);
    }

    #[tokio::test]
    async fn test_delete_clears_sets_and_counters() {
        let store = MockStore::new();
        store.add_member("cities", "Delhi").await.unwrap();
        store.set_counter("api_counter", 42).await.unwrap();

        store.delete("cities").await.unwrap();
        store.delete("api_counter").await.unwrap();

        assert_eq!(store.cardinality("cities").await.unwrap(), 0);
        assert_eq!(store.counter("api_counter").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_one_operation() {
        let store = MockStore::new();
        store.add_member("cities", "Delhi").await.unwrap();
        store.set_counter("cities", 7).await.unwrap();

        store.fail_next(1);
        assert!(store.delete("cities").await.is_err());
        assert_eq!(store.cardinality("cities").await.unwrap(), 1);

        store.fail_next(1);
        assert!(store.delete("cities").await.is_err());
        store.delete("cities").await.unwrap();
        assert_eq!(store.cardinality("cities").await.unwrap(), 0);
        assert_eq!(store.counter("cities").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_counts_from_zero() {
        let store = MockStore::new();

        assert_eq!(store.increment("api_counter").await.unwrap(), 1);
        assert_eq!(store.increment("api_counter").await.unwrap(), 2);
        store.set_counter("api_counter", 0).await.unwrap();
        assert_eq!(store.increment("api_counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MockStore::new();
        store.fail_next(2);

        assert!(matches!(
            store.cardinality("pincodes").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.cardinality("pincodes").await.is_err());
        assert!(store.cardinality("pincodes").await.is_ok());

        store.set_unavailable(true);
        assert!(store.increment("api_counter").await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.increment("api_counter").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_keep_one_copy() {
        let store = Arc::new(MockStore::new());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        store.add_member("cities", "Delhi").await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.members("cities").await.unwrap(), vec!["Delhi"]);
    }
}
