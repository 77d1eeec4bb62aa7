use crate::error::{HarmonizeError, Result};
use crate::pipeline::ingestion::rate_limiter::Limits;
use crate::pipeline::ingestion::retry::RetryPolicy;
use crate::pipeline::processing::normalize::GeographyPolicy;
use crate::types::Provider;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "harmonizer.toml";

/// Upstream services with their own request budget.
const LIMITED_SERVICES: [&str; 3] = ["census", "fred", "ipums"];

/// Optional on-disk configuration. Every key can also be set through the
/// environment, which takes precedence.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub census_api_key: Option<String>,
    pub fred_api_key: Option<String>,
    pub ipums_api_key: Option<String>,
    pub output_directory: Option<PathBuf>,
    pub request_timeout_seconds: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub requests_per_minute: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub ipums_poll_interval_seconds: Option<u64>,
    pub ipums_poll_timeout_seconds: Option<u64>,
    pub registry_dir: Option<PathBuf>,
    pub nhgis_directory: Option<PathBuf>,
    pub unknown_geography: Option<String>,
    pub metrics_addr: Option<String>,
    /// Per-service overrides, e.g. `[limits.census]`.
    #[serde(default)]
    pub limits: BTreeMap<String, FileLimits>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileLimits {
    pub max_concurrency: Option<usize>,
    pub requests_per_minute: Option<u64>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HarmonizeError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub census: Option<String>,
    pub fred: Option<String>,
    pub ipums: Option<String>,
}

impl ApiKeys {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::CensusAcs | Provider::CensusDecennial => self.census.as_deref(),
            Provider::Fred => self.fred.as_deref(),
            Provider::Ipums | Provider::Nhgis => self.ipums.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_keys: ApiKeys,
    pub output_dir: PathBuf,
    pub request_timeout: Duration,
    /// Defaults for services without their own limits.
    pub max_concurrency: usize,
    pub requests_per_minute: Option<u64>,
    pub service_limits: BTreeMap<String, Limits>,
    pub retry: RetryPolicy,
    pub ipums_poll_interval: Duration,
    pub ipums_poll_timeout: Duration,
    pub registry_dir: Option<PathBuf>,
    /// Local NHGIS tables, one CSV per census year.
    pub nhgis_dir: PathBuf,
    pub geography_policy: GeographyPolicy,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: ApiKeys::default(),
            output_dir: PathBuf::from("data"),
            request_timeout: Duration::from_secs(30),
            max_concurrency: 4,
            requests_per_minute: None,
            service_limits: BTreeMap::new(),
            retry: RetryPolicy::default(),
            ipums_poll_interval: Duration::from_secs(10),
            ipums_poll_timeout: Duration::from_secs(300),
            registry_dir: None,
            nhgis_dir: PathBuf::from("data").join("nhgis_historical"),
            geography_policy: GeographyPolicy::Skip,
            metrics_addr: None,
        }
    }
}

impl Settings {
    /// Request budget of one upstream service.
    pub fn limits_for(&self, service: &str) -> Limits {
        self.service_limits.get(service).cloned().unwrap_or(Limits {
            requests_per_min: self.requests_per_minute,
            concurrency: Some(self.max_concurrency),
        })
    }

    /// Load `.env`, the optional TOML file, then environment overrides.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let explicit = std::env::var("HARMONIZER_CONFIG").ok().map(PathBuf::from);
        let file = match explicit {
            Some(path) => FileConfig::from_path(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                FileConfig::from_path(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => FileConfig::default(),
        };

        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Merge a file config with an environment lookup. Blank variables count
    /// as unset.
    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let defaults = Settings::default();

        let api_keys = ApiKeys {
            census: var("CENSUS_API_KEY").or(file.census_api_key),
            fred: var("FRED_API_KEY").or(file.fred_api_key),
            ipums: var("IPUMS_API_KEY").or(file.ipums_api_key),
        };

        let output_dir = var("OUTPUT_DIRECTORY")
            .map(PathBuf::from)
            .or(file.output_directory)
            .unwrap_or(defaults.output_dir);

        let timeout_secs = parse_var(&var, "REQUEST_TIMEOUT_SECONDS")?
            .or(file.request_timeout_seconds)
            .unwrap_or(defaults.request_timeout.as_secs());
        if timeout_secs == 0 {
            return Err(HarmonizeError::Config(
                "REQUEST_TIMEOUT_SECONDS must be greater than zero".into(),
            ));
        }

        let max_concurrency = parse_var(&var, "MAX_CONCURRENCY")?
            .or(file.max_concurrency)
            .unwrap_or(defaults.max_concurrency)
            .max(1);

        let requests_per_minute = parse_var(&var, "REQUESTS_PER_MINUTE")?
            .or(file.requests_per_minute)
            .filter(|rpm| *rpm > 0);

        let mut service_limits = BTreeMap::new();
        for service in LIMITED_SERVICES {
            let prefix = service.to_ascii_uppercase();
            let overrides = file.limits.get(service).cloned().unwrap_or_default();
            let concurrency = parse_var(&var, &format!("{prefix}_MAX_CONCURRENCY"))?
                .or(overrides.max_concurrency)
                .unwrap_or(max_concurrency)
                .max(1);
            let rpm = parse_var(&var, &format!("{prefix}_REQUESTS_PER_MINUTE"))?
                .or(overrides.requests_per_minute)
                .or(requests_per_minute)
                .filter(|rpm| *rpm > 0);
            service_limits.insert(
                service.to_string(),
                Limits {
                    requests_per_min: rpm,
                    concurrency: Some(concurrency),
                },
            );
        }

        let retry = RetryPolicy {
            max_attempts: parse_var::<u32, _>(&var, "MAX_RETRIES")?
                .or(file.max_retries)
                .unwrap_or(defaults.retry.max_attempts)
                .max(1),
            base_delay: parse_var(&var, "RETRY_BASE_DELAY_MS")?
                .or(file.retry_base_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: defaults.retry.max_delay,
        };

        let ipums_poll_interval = parse_var(&var, "IPUMS_POLL_INTERVAL_SECONDS")?
            .or(file.ipums_poll_interval_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.ipums_poll_interval);
        let ipums_poll_timeout = parse_var(&var, "IPUMS_POLL_TIMEOUT_SECONDS")?
            .or(file.ipums_poll_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.ipums_poll_timeout);

        let registry_dir = var("REGISTRY_DIR").map(PathBuf::from).or(file.registry_dir);
        let nhgis_dir = var("NHGIS_DIRECTORY")
            .map(PathBuf::from)
            .or(file.nhgis_directory)
            .unwrap_or_else(|| output_dir.join("nhgis_historical"));

        let geography_policy = match var("UNKNOWN_GEOGRAPHY").or(file.unknown_geography) {
            Some(raw) => raw.parse::<GeographyPolicy>().map_err(HarmonizeError::Config)?,
            None => defaults.geography_policy,
        };

        let metrics_addr = match var("METRICS_ADDR").or(file.metrics_addr) {
            Some(raw) => Some(raw.parse::<SocketAddr>().map_err(|e| {
                HarmonizeError::Config(format!("invalid METRICS_ADDR '{raw}': {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            api_keys,
            output_dir,
            request_timeout: Duration::from_secs(timeout_secs),
            max_concurrency,
            requests_per_minute,
            service_limits,
            retry,
            ipums_poll_interval,
            ipums_poll_timeout,
            registry_dir,
            nhgis_dir,
            geography_policy,
            metrics_addr,
        })
    }
}

fn parse_var<T, F>(var: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| HarmonizeError::Config(format!("invalid {key} '{raw}': {e}"))),
        None => Ok(None),
    }
}
