use std::sync::Arc;

use tracing::{debug, warn};

use crate::aggregate::{AggregationStore, LookupCounter};
use crate::error::{FailureKind, LookupError, ScanError};
use crate::gate::AdmissionGate;
use crate::lookup::{LocationField, Lookup};
use crate::queue::Batch;

/// A pincode whose lookup failed, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub pincode: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl KeyFailure {
    fn new(pincode: String, error: &LookupError) -> Self {
        Self {
            pincode,
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// What a worker did with one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Lookups attempted and counted, successful or not.
    pub attempted: u64,
    pub failures: Vec<KeyFailure>,
    /// Set when the shared store became unreachable; the rest of the batch was not looked up.
    pub error: Option<ScanError>,
}

/// Looks up the pincodes of a batch one after the other and aggregates their locations.
pub struct Worker {
    lookup: Arc<dyn Lookup>,
    locations: Arc<AggregationStore>,
    lookups: Arc<LookupCounter>,
    gate: Arc<AdmissionGate>,
    field: LocationField,
}

impl Worker {
    pub fn new(
        lookup: Arc<dyn Lookup>,
        locations: Arc<AggregationStore>,
        lookups: Arc<LookupCounter>,
        gate: Arc<AdmissionGate>,
        field: LocationField,
    ) -> Self {
        Self {
            lookup,
            locations,
            lookups,
            gate,
            field,
        }
    }

    /// Process every pincode of `batch` in order.
    ///
    /// A failed lookup is recorded and skipped. Only a store failure stops the batch early.
    pub async fn process(&self, batch: Batch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for pincode in batch {
            if let Err(error) = self.process_pincode(pincode, &mut outcome).await {
                outcome.error = Some(error);
                break;
            }
        }

        outcome
    }

    async fn process_pincode(
        &self,
        pincode: String,
        outcome: &mut BatchOutcome,
    ) -> Result<(), ScanError> {
        self.gate.throttle().await;

        let now = tokio::time::Instant::now();
        let result = self.lookup.lookup(&pincode).await;
        metrics::histogram!("pincode_lookup_duration_seconds")
            .record(now.elapsed().as_secs_f64());

        match result {
            Ok(offices) => {
                metrics::counter!("pincode_lookups_total", "outcome" => "success").increment(1);
                debug!(pincode = %pincode, records = offices.len(), "lookup succeeded");

                for office in &offices {
                    if let Some(location) = self.field.extract(office) {
                        if self.locations.add(location).await? {
                            debug!(location, "new location");
                        }
                    }
                }
            }
            Err(error) => {
                warn!(pincode = %pincode, kind = error.kind().as_str(), "lookup failed: {}", error);
                metrics::counter!("pincode_lookups_total", "outcome" => error.kind().as_str())
                    .increment(1);
                // Recorded before counting, so the key is reported even if the store goes away.
                outcome.failures.push(KeyFailure::new(pincode, &error));
            }
        }

        self.lookups.increment().await?;
        outcome.attempted += 1;

        Ok(())
    }
}
