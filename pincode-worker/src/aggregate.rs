use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pincode_common::retry::RetryPolicy;
use pincode_common::store::Store;

use crate::error::{with_retries, ScanError};

/// The deduplicated set of locations discovered by a run, kept in the shared store.
///
/// Adding relies on the store's idempotent set insert, so workers add concurrently without
/// coordinating. Values confirmed by the store are also recorded locally, which is what gets
/// reported if the store goes away before the final read.
pub struct AggregationStore {
    store: Arc<dyn Store>,
    key: String,
    retry_policy: RetryPolicy,
    confirmed: Mutex<HashSet<String>>,
}

impl AggregationStore {
    pub fn new(store: Arc<dyn Store>, key: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            key: key.to_owned(),
            retry_policy,
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    /// Insert a location. Returns whether it was new to the set.
    pub async fn add(&self, location: &str) -> Result<bool, ScanError> {
        let added = with_retries(&self.retry_policy, "SADD", || {
            self.store.add_member(&self.key, location)
        })
        .await?;

        self.confirmed
            .lock()
            .expect("confirmed locations lock poisoned")
            .insert(location.to_owned());

        Ok(added)
    }

    pub async fn members(&self) -> Result<Vec<String>, ScanError> {
        with_retries(&self.retry_policy, "SMEMBERS", || {
            self.store.members(&self.key)
        })
        .await
    }

    pub async fn count(&self) -> Result<u64, ScanError> {
        with_retries(&self.retry_policy, "SCARD", || {
            self.store.cardinality(&self.key)
        })
        .await
    }

    pub async fn reset(&self) -> Result<(), ScanError> {
        with_retries(&self.retry_policy, "DEL", || self.store.delete(&self.key)).await?;

        self.confirmed
            .lock()
            .expect("confirmed locations lock poisoned")
            .clear();

        Ok(())
    }

    /// Locations this process saw the store accept, without a round-trip.
    pub fn confirmed(&self) -> Vec<String> {
        self.confirmed
            .lock()
            .expect("confirmed locations lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Total number of lookups attempted, kept as a counter in the shared store.
pub struct LookupCounter {
    store: Arc<dyn Store>,
    key: String,
    retry_policy: RetryPolicy,
}

impl LookupCounter {
    pub fn new(store: Arc<dyn Store>, key: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            key: key.to_owned(),
            retry_policy,
        }
    }

    pub async fn increment(&self) -> Result<u64, ScanError> {
        with_retries(&self.retry_policy, "INCR", || self.store.increment(&self.key)).await
    }

    pub async fn reset(&self) -> Result<(), ScanError> {
        with_retries(&self.retry_policy, "SET", || {
            self.store.set_counter(&self.key, 0)
        })
        .await
    }

    pub async fn value(&self) -> Result<u64, ScanError> {
        with_retries(&self.retry_policy, "GET", || self.store.counter(&self.key)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time;

    use pincode_common::store::{MockStore, Store};

    use super::*;

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_attempts(2)
            .provide()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_adds_are_idempotent() {
        let store = Arc::new(MockStore::new());
        let locations = Arc::new(AggregationStore::new(store, "cities", retry_policy()));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let locations = locations.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        locations.add("Delhi").await.unwrap();
                        locations
                            .add(if i % 2 == 0 { "Bangalore" } else { "Mumbai" })
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut members = locations.members().await.unwrap();
        members.sort();
        assert_eq!(members, vec!["Bangalore", "Delhi", "Mumbai"]);
        assert_eq!(locations.count().await.unwrap(), 3);

        let mut confirmed = locations.confirmed();
        confirmed.sort();
        assert_eq!(confirmed, members);
    }

    #[tokio::test]
    async fn test_add_reports_new_members() {
        let locations = AggregationStore::new(Arc::new(MockStore::new()), "cities", retry_policy());

        assert!(locations.add("Delhi").await.unwrap());
        assert!(!locations.add("Delhi").await.unwrap());

        locations.reset().await.unwrap();
        assert_eq!(locations.count().await.unwrap(), 0);
        assert!(locations.confirmed().is_empty());
        assert!(locations.add("Delhi").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_add_is_not_confirmed() {
        let store = Arc::new(MockStore::new());
        let locations = AggregationStore::new(store.clone(), "cities", retry_policy());

        store.set_unavailable(true);
        assert!(matches!(
            locations.add("Delhi").await,
            Err(ScanError::StorageUnavailable { .. })
        ));
        assert!(locations.confirmed().is_empty());
    }

    #[test]
    #[should_panic(expected = "confirmed locations lock poisoned")]
    fn test_poisoned_confirmations_are_not_dropped_silently() {
        let locations = AggregationStore::new(Arc::new(MockStore::new()), "cities", retry_policy());

        std::thread::scope(|scope| {
            let poisoner = scope.spawn(|| {
                let _held = locations.confirmed.lock().unwrap();
                panic!("worker died holding the lock");
            });
            assert!(poisoner.join().is_err());
        });

        locations.confirmed();
    }

    #[tokio::test]
    async fn test_lookup_counter() {
        let store = Arc::new(MockStore::new());
        let counter = LookupCounter::new(store.clone(), "api_counter", retry_policy());
        store.set_counter("api_counter", 17).await.unwrap();

        counter.reset().await.unwrap();
        assert_eq!(counter.value().await.unwrap(), 0);
        assert_eq!(counter.increment().await.unwrap(), 1);
        assert_eq!(counter.increment().await.unwrap(), 2);
        assert_eq!(counter.value().await.unwrap(), 2);
    }
}
