use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use clap::Parser;
use envconfig::Envconfig;
use pincode_common::retry::RetryPolicy;

use crate::error::ScanError;
use crate::gate::RateLimit;
use crate::lookup::LocationField;
use crate::orchestrator::{ScanOptions, StoreKeys};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "500")]
    pub store_timeout: EnvMsDuration,

    #[envconfig(default = "https://api.postalpincode.in/pincode")]
    pub lookup_endpoint: NonEmptyString,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "2")]
    pub max_concurrency: usize,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    /// Lookups allowed per `rate_interval`. Unlimited when unset.
    pub rate_limit: Option<u32>,

    #[envconfig(default = "1000")]
    pub rate_interval: EnvMsDuration,

    /// Lookups allowed in a burst. Defaults to `rate_limit`.
    pub rate_burst: Option<u32>,

    #[envconfig(default = "pincodes.txt")]
    pub input_path: PathBuf,

    #[envconfig(default = "Block")]
    pub extract_field: LocationField,

    #[envconfig(default = "pincodes")]
    pub pending_key: NonEmptyString,

    #[envconfig(default = "cities")]
    pub locations_key: NonEmptyString,

    #[envconfig(default = "api_counter")]
    pub lookup_counter_key: NonEmptyString,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Override configuration values with the flags given on the command line.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(max_concurrency) = args.max_concurrency {
            self.max_concurrency = max_concurrency;
        }
        if let Some(batch_size) = args.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(rate_limit) = args.rate_limit {
            self.rate_limit = Some(rate_limit);
        }
        if let Some(input) = &args.input {
            self.input_path = input.clone();
        }
        if let Some(field) = args.extract_field {
            self.extract_field = field;
        }
        self
    }

    /// Validate the configuration into the options of a scan.
    pub fn scan_options(&self) -> Result<ScanOptions, ScanError> {
        let batch_size = NonZeroUsize::new(self.batch_size)
            .ok_or_else(|| ScanError::InvalidConfig("batch size must be at least 1".to_owned()))?;
        let max_concurrency = NonZeroUsize::new(self.max_concurrency).ok_or_else(|| {
            ScanError::InvalidConfig("max concurrency must be at least 1".to_owned())
        })?;

        let rate_limit = match self.rate_limit {
            None => None,
            Some(requests) => {
                let requests = NonZeroU32::new(requests).ok_or_else(|| {
                    ScanError::InvalidConfig("rate limit must be at least 1".to_owned())
                })?;
                let burst = match self.rate_burst {
                    None => requests,
                    Some(burst) => NonZeroU32::new(burst).ok_or_else(|| {
                        ScanError::InvalidConfig("rate burst must be at least 1".to_owned())
                    })?,
                };
                if self.rate_interval.0.is_zero() {
                    return Err(ScanError::InvalidConfig(
                        "rate interval must be positive".to_owned(),
                    ));
                }

                Some(RateLimit {
                    requests,
                    interval: self.rate_interval.0,
                    burst,
                })
            }
        };

        Ok(ScanOptions {
            batch_size,
            max_concurrency,
            rate_limit,
            field: self.extract_field,
            keys: StoreKeys {
                pending: self.pending_key.as_str().to_owned(),
                locations: self.locations_key.as_str().to_owned(),
                lookups: self.lookup_counter_key.as_str().to_owned(),
            },
            retry_policy: self.retry_policy.provide(),
        })
    }
}

/// Resolve every pincode in a file into the deduplicated set of locations it covers.
///
/// Flags override the equivalent environment variables.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Maximum number of batches looked up concurrently
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Number of pincodes handed to a worker at once
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Maximum number of lookups per rate interval (RATE_INTERVAL, 1s by default)
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// File listing the pincodes to look up
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// PostOffice field aggregated as the location, e.g. Block or District
    #[arg(long)]
    pub extract_field: Option<LocationField>,

    /// Keep pincodes left pending by a previous run instead of clearing them
    #[arg(long, default_value = "false")]
    pub keep_pending: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "5")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::init_from_hashmap(&vars).expect("invalid test configuration")
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        let options = config.scan_options().unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.input_path, PathBuf::from("pincodes.txt"));
        assert_eq!(options.batch_size.get(), 100);
        assert_eq!(options.max_concurrency.get(), 2);
        assert_eq!(options.rate_limit, None);
        assert_eq!(options.field, LocationField::Block);
        assert_eq!(options.keys, StoreKeys::default());
        assert_eq!(options.retry_policy.max_attempts, 5);
        assert_eq!(
            options.retry_policy.maximum_interval,
            Some(time::Duration::from_secs(5))
        );
    }

    #[test]
    fn test_rate_limit() {
        let options = config(&[("RATE_LIMIT", "10"), ("RATE_INTERVAL", "60000")])
            .scan_options()
            .unwrap();
        let rate_limit = options.rate_limit.expect("rate limit is set");

        assert_eq!(rate_limit.requests.get(), 10);
        assert_eq!(rate_limit.burst.get(), 10);
        assert_eq!(rate_limit.interval, time::Duration::from_secs(60));

        let options = config(&[("RATE_LIMIT", "10"), ("RATE_BURST", "1")])
            .scan_options()
            .unwrap();
        assert_eq!(options.rate_limit.unwrap().burst.get(), 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("BATCH_SIZE", "0")],
            [("MAX_CONCURRENCY", "0")],
            [("RATE_LIMIT", "0")],
        ] {
            assert!(matches!(
                config(&vars).scan_options(),
                Err(ScanError::InvalidConfig(_))
            ));
        }

        assert!(matches!(
            config(&[("RATE_LIMIT", "5"), ("RATE_INTERVAL", "0")]).scan_options(),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_args_override_environment() {
        let args = Args::parse_from([
            "pincode-worker",
            "--max-concurrency",
            "16",
            "--batch-size",
            "500",
            "--rate-limit",
            "20",
            "--input",
            "/data/pincodes.txt",
            "--extract-field",
            "district",
        ]);
        let config = config(&[("MAX_CONCURRENCY", "4"), ("BATCH_SIZE", "50")]).with_args(&args);
        let options = config.scan_options().unwrap();

        assert_eq!(options.max_concurrency.get(), 16);
        assert_eq!(options.batch_size.get(), 500);
        assert_eq!(options.rate_limit.unwrap().requests.get(), 20);
        assert_eq!(options.field, LocationField::District);
        assert_eq!(config.input_path, PathBuf::from("/data/pincodes.txt"));
        assert!(!args.keep_pending);
    }

    #[test]
    fn test_missing_args_keep_environment() {
        let config = config(&[("BATCH_SIZE", "50")]).with_args(&Args::default());

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_parse_env_ms_duration() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>().unwrap().0,
            time::Duration::from_millis(1500)
        );
        assert_eq!(
            "1.5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
        assert_eq!(
            "".parse::<NonEmptyString>().unwrap_err(),
            StringIsEmptyError
        );
    }
}
