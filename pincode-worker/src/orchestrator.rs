//! Drives a scan: pops batches off the pending set, admits a worker per batch through the
//! gate, and joins them all before reading back the aggregated locations.
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time;

use pincode_common::retry::RetryPolicy;
use pincode_common::store::Store;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{AggregationStore, LookupCounter};
use crate::error::ScanError;
use crate::gate::{AdmissionGate, RateLimit};
use crate::lookup::{LocationField, Lookup};
use crate::queue::{partitions, WorkQueue};
use crate::worker::{BatchOutcome, KeyFailure, Worker};

/// Names of the store keys a scan works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Set of pincodes waiting to be looked up.
    pub pending: String,
    /// Set of discovered locations.
    pub locations: String,
    /// Counter of lookups attempted.
    pub lookups: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self {
            pending: "pincodes".to_owned(),
            locations: "cities".to_owned(),
            lookups: "api_counter".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub batch_size: NonZeroUsize,
    pub max_concurrency: NonZeroUsize,
    pub rate_limit: Option<RateLimit>,
    pub field: LocationField,
    pub keys: StoreKeys,
    pub retry_policy: RetryPolicy,
}

impl ScanOptions {
    pub fn new(batch_size: NonZeroUsize, max_concurrency: NonZeroUsize) -> Self {
        Self {
            batch_size,
            max_concurrency,
            rate_limit: None,
            field: LocationField::default(),
            keys: StoreKeys::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// The result of a scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Every location discovered, sorted.
    pub locations: Vec<String>,
    /// Lookups attempted.
    pub lookups: u64,
    pub failures: Vec<KeyFailure>,
    /// Batches the pending set was split into when the scan started.
    pub partitions: u64,
    /// Batches actually handed to workers.
    pub batches: u64,
    /// Whether the scan stopped early because it was cancelled.
    pub cancelled: bool,
    pub elapsed: time::Duration,
}

impl ScanReport {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.lookups += outcome.attempted;
        self.failures.extend(outcome.failures);
    }
}

/// A scan that could not complete because the shared store became unreachable.
#[derive(Error, Debug)]
#[error("scan aborted: {error}")]
pub struct ScanAborted {
    #[source]
    pub error: ScanError,
    /// What had been gathered before the scan stopped.
    pub partial: ScanReport,
}

pub struct Orchestrator {
    queue: WorkQueue,
    locations: Arc<AggregationStore>,
    lookups: Arc<LookupCounter>,
    gate: Arc<AdmissionGate>,
    worker: Arc<Worker>,
    batch_size: NonZeroUsize,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, lookup: Arc<dyn Lookup>, options: ScanOptions) -> Self {
        let retry_policy = options.retry_policy;
        let queue = WorkQueue::new(store.clone(), &options.keys.pending, retry_policy.clone());
        let locations = Arc::new(AggregationStore::new(
            store.clone(),
            &options.keys.locations,
            retry_policy.clone(),
        ));
        let lookups = Arc::new(LookupCounter::new(
            store,
            &options.keys.lookups,
            retry_policy,
        ));
        let gate = Arc::new(AdmissionGate::new(
            options.max_concurrency,
            options.rate_limit,
        ));
        let worker = Arc::new(Worker::new(
            lookup,
            locations.clone(),
            lookups.clone(),
            gate.clone(),
            options.field,
        ));

        Self {
            queue,
            locations,
            lookups,
            gate,
            worker,
            batch_size: options.batch_size,
        }
    }

    /// Clear the state left in the store by a previous run.
    ///
    /// With `keep_pending`, pincodes a previous run did not get to stay queued.
    pub async fn reset(&self, keep_pending: bool) -> Result<(), ScanError> {
        if !keep_pending {
            self.queue.reset().await?;
        }
        self.locations.reset().await?;
        self.lookups.reset().await
    }

    /// Queue pincodes for the next scan. Returns how many were not already pending.
    pub async fn load(&self, pincodes: &[String]) -> Result<u64, ScanError> {
        self.queue.push(pincodes).await
    }

    /// Look up every pending pincode.
    ///
    /// Cancelling `cancel` stops new batches from being handed out; batches already admitted
    /// run to completion and the report covers what they did.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ScanReport, ScanAborted> {
        let start = tokio::time::Instant::now();
        let mut report = ScanReport::default();

        let pending = match self.queue.size().await {
            Ok(pending) => pending,
            Err(error) => return Err(self.abort(error, report, start)),
        };
        report.partitions = partitions(pending, self.batch_size);
        info!(
            pending,
            partitions = report.partitions,
            batch_size = self.batch_size.get(),
            max_concurrency = self.gate.capacity(),
            "starting scan"
        );

        // Cancelled by the caller, or by a worker that lost the store.
        let halt = cancel.child_token();
        let mut fatal: Option<ScanError> = None;
        let mut tasks = JoinSet::new();

        for partition in 0..report.partitions {
            if halt.is_cancelled() {
                break;
            }

            let batch = match self.queue.pop_batch(self.batch_size.get()).await {
                Ok(batch) => batch,
                Err(error) => {
                    fatal = Some(error);
                    break;
                }
            };
            if batch.is_empty() {
                info!(partition, "pending set drained before the last partition");
                break;
            }

            // Halting wins over a free permit, no batch is issued once cancelled.
            let token = tokio::select! {
                biased;
                _ = halt.cancelled() => {
                    // Popped but never handed out: put it back so it is not lost.
                    if let Err(error) = self.queue.push(&batch).await {
                        error!(pincodes = ?batch, "failed to requeue batch: {}", error);
                    }
                    break;
                }
                token = self.gate.acquire() => token,
            };

            report.batches += 1;
            metrics::counter!("pincode_batches_total").increment(1);

            let worker = self.worker.clone();
            let gate = self.gate.clone();
            let on_store_failure = halt.clone();
            tasks.spawn(async move {
                let outcome = worker.process(batch).await;
                gate.release(token);
                if outcome.error.is_some() {
                    on_store_failure.cancel();
                }
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut outcome) => {
                    if let Some(error) = outcome.error.take() {
                        error!("worker stopped on a store failure: {}", error);
                        if fatal.is_none() {
                            fatal = Some(error);
                        }
                    }
                    report.absorb(outcome);
                }
                Err(join_error) => error!("worker task failed: {}", join_error),
            }
        }

        report.cancelled = cancel.is_cancelled();
        if report.cancelled {
            warn!(batches = report.batches, "scan cancelled");
        }

        if let Some(error) = fatal {
            return Err(self.abort(error, report, start));
        }

        let final_read = async {
            let locations = self.locations.members().await?;
            let lookups = self.lookups.value().await?;
            Ok::<_, ScanError>((locations, lookups))
        };
        match final_read.await {
            Ok((mut locations, lookups)) => {
                locations.sort();
                report.locations = locations;
                report.lookups = lookups;
            }
            Err(error) => return Err(self.abort(error, report, start)),
        }

        report.elapsed = start.elapsed();
        info!(
            locations = report.locations.len(),
            lookups = report.lookups,
            failures = report.failures.len(),
            elapsed = ?report.elapsed,
            "scan finished"
        );

        Ok(report)
    }

    /// Build the partial report of a scan that lost the store.
    fn abort(
        &self,
        error: ScanError,
        mut report: ScanReport,
        start: tokio::time::Instant,
    ) -> ScanAborted {
        let mut locations = self.locations.confirmed();
        locations.sort();
        report.locations = locations;
        report.elapsed = start.elapsed();
        error!(
            locations = report.locations.len(),
            lookups = report.lookups,
            "scan aborted: {}",
            error
        );

        ScanAborted {
            error,
            partial: report,
        }
    }
}
