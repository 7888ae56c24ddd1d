use std::num::NonZeroUsize;
use std::sync::Arc;

use pincode_common::retry::RetryPolicy;
use pincode_common::store::Store;

use crate::error::{with_retries, ScanError};

/// Maximum number of pincodes sent to the store in a single push.
const PUSH_CHUNK_SIZE: usize = 1000;

/// Pincodes handed out to a single worker by one atomic pop.
pub type Batch = Vec<String>;

/// Number of batches needed to drain `pending` pincodes, `ceil(pending / batch_size)`.
pub fn partitions(pending: u64, batch_size: NonZeroUsize) -> u64 {
    pending.div_ceil(batch_size.get() as u64)
}

/// The set of pincodes still waiting to be looked up, kept in the shared store.
///
/// The pending set is a store set, so pushing a pincode twice keeps one copy and popping
/// relies on the store's atomic remove-N: concurrent callers never get the same pincode.
pub struct WorkQueue {
    store: Arc<dyn Store>,
    key: String,
    retry_policy: RetryPolicy,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>, key: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            key: key.to_owned(),
            retry_policy,
        }
    }

    /// Add pincodes to the pending set. Returns how many were not already pending.
    pub async fn push(&self, pincodes: &[String]) -> Result<u64, ScanError> {
        let mut added = 0;

        for chunk in pincodes.chunks(PUSH_CHUNK_SIZE) {
            added += with_retries(&self.retry_policy, "SADD", || {
                self.store.add_members(&self.key, chunk)
            })
            .await?;
        }

        Ok(added)
    }

    /// Atomically remove and return up to `max_count` pending pincodes.
    pub async fn pop_batch(&self, max_count: usize) -> Result<Batch, ScanError> {
        with_retries(&self.retry_policy, "SPOP", || {
            self.store.pop_members(&self.key, max_count)
        })
        .await
    }

    pub async fn size(&self) -> Result<u64, ScanError> {
        with_retries(&self.retry_policy, "SCARD", || {
            self.store.cardinality(&self.key)
        })
        .await
    }

    /// Drop every pending pincode, e.g. left over by a previous run.
    pub async fn reset(&self) -> Result<(), ScanError> {
        with_retries(&self.retry_policy, "DEL", || self.store.delete(&self.key)).await
    }
}
