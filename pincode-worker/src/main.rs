//! Resolve a file of pincodes into the set of locations they belong to.
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pincode_common::metrics::{serve, setup_metrics_router};
use pincode_common::store::RedisStore;
use pincode_worker::config::{Args, Config};
use pincode_worker::error::ScanError;
use pincode_worker::input::read_pincodes;
use pincode_worker::lookup::HttpLookupClient;
use pincode_worker::orchestrator::{Orchestrator, ScanReport};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::init_from_env()
        .expect("Invalid configuration:")
        .with_args(&args);

    match run(config, args.keep_pending).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, keep_pending: bool) -> Result<(), ScanError> {
    let options = config.scan_options()?;

    if config.export_prometheus {
        let router = setup_metrics_router()
            .map_err(|error| ScanError::InvalidConfig(format!("metrics recorder: {}", error)))?;
        let bind = config.bind();
        tokio::task::spawn(async move {
            if let Err(error) = serve(router, &bind).await {
                error!("failed to serve metrics on {}: {}", bind, error);
            }
        });
    }

    let store = options
        .retry_policy
        .run("CONNECT", || {
            RedisStore::new(&config.redis_url, config.store_timeout.0)
        })
        .await
        .map_err(|exhausted| ScanError::StorageUnavailable {
            operation: "CONNECT",
            attempts: exhausted.attempts,
            source: exhausted.error,
        })?;
    let lookup = HttpLookupClient::new(config.lookup_endpoint.as_str(), config.request_timeout.0)
        .map_err(|error| ScanError::InvalidConfig(format!("lookup client: {}", error)))?;

    let orchestrator = Orchestrator::new(Arc::new(store), Arc::new(lookup), options);
    orchestrator.reset(keep_pending).await?;

    let pincodes = read_pincodes(&config.input_path)?;
    let queued = orchestrator.load(&pincodes).await?;
    info!(
        read = pincodes.len(),
        queued,
        input = %config.input_path.display(),
        "loaded pincodes"
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for in-flight batches to finish");
            on_interrupt.cancel();
        }
    });

    match orchestrator.run(cancel).await {
        Ok(report) => {
            log_report(&report);
            Ok(())
        }
        Err(aborted) => {
            warn!("reporting partial results gathered before the abort");
            log_report(&aborted.partial);
            Err(aborted.error)
        }
    }
}

fn log_report(report: &ScanReport) {
    info!(
        locations = report.locations.len(),
        lookups = report.lookups,
        batches = report.batches,
        cancelled = report.cancelled,
        elapsed = ?report.elapsed,
        "scan report"
    );
    info!("locations: {:?}", report.locations);

    if !report.failures.is_empty() {
        let pincodes: Vec<&str> = report
            .failures
            .iter()
            .map(|failure| failure.pincode.as_str())
            .collect();
        warn!(
            failed = report.failures.len(),
            "lookups failed for: {:?}", pincodes
        );
    }
}
