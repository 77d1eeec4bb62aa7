//! Source adapters: one implementation per provider API, parameterized by
//! [`AdapterConfig`]. Every requested period yields exactly one outcome.

pub mod census;
pub mod extract;
pub mod fred;
pub mod ipums;
pub mod nhgis;

pub use census::CensusAdapter;
pub use fred::FredAdapter;
pub use ipums::IpumsAdapter;
pub use nhgis::NhgisAdapter;

use super::client::ProviderClients;
use crate::config::ApiKeys;
use crate::error::{HarmonizeError, Result};
use crate::idempotency::{compute_query_id, redact_query};
use crate::registry::AdapterConfig;
use crate::types::{FetchedPayload, GeographyLevel, Provenance, Provider, TimePeriod};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub type PeriodOutcome = (TimePeriod, Result<FetchedPayload>);

/// Run-wide state shared by every adapter.
pub struct FetchContext {
    pub clients: ProviderClients,
    pub api_keys: ApiKeys,
    pub run_id: Uuid,
    /// Where in-flight asynchronous extracts are tracked between runs.
    pub extracts_dir: PathBuf,
    /// Local NHGIS tables, one CSV per census year.
    pub nhgis_dir: PathBuf,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl FetchContext {
    pub(crate) fn provenance(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        period: TimePeriod,
        url: &str,
    ) -> Provenance {
        let query = redact_query(url);
        let query_id = compute_query_id(config.provider, &config.id, level, period, &query);
        Provenance {
            provider: config.provider,
            adapter: config.id.clone(),
            query,
            query_id,
            fetched_at: Utc::now(),
            run_id: self.run_id,
        }
    }

    pub(crate) fn require_key(&self, provider: Provider) -> Result<&str> {
        self.api_keys.for_provider(provider).ok_or_else(|| {
            HarmonizeError::Config(format!("{} API key is not configured", provider))
        })
    }
}

/// Fetches the periods of one config that already passed the capability check.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch_supported(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome>;

    /// Called once a period's payload is committed to its table. Adapters
    /// that keep resumable state release it here, so a failed write can be
    /// retried from the already fetched data.
    async fn acknowledge(&self, _config: &AdapterConfig, _period: TimePeriod) -> Result<()> {
        Ok(())
    }
}

/// Dispatches configs to the adapter implementing their provider.
pub struct AdapterSet {
    adapters: HashMap<Provider, Arc<dyn SourceAdapter>>,
}

impl AdapterSet {
    pub fn new(ctx: Arc<FetchContext>) -> Self {
        let mut set = Self {
            adapters: HashMap::new(),
        };
        let census: Arc<dyn SourceAdapter> = Arc::new(CensusAdapter::new(ctx.clone()));
        set.register(Provider::CensusAcs, census.clone());
        set.register(Provider::CensusDecennial, census);
        set.register(Provider::Fred, Arc::new(FredAdapter::new(ctx.clone())));
        set.register(Provider::Ipums, Arc::new(IpumsAdapter::new(ctx.clone())));
        set.register(Provider::Nhgis, Arc::new(NhgisAdapter::new(ctx)));
        set
    }

    fn register(&mut self, provider: Provider, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    /// Release any resumable state kept for a period whose payload is now
    /// stored.
    pub async fn acknowledge(&self, config: &AdapterConfig, period: TimePeriod) -> Result<()> {
        match self.adapters.get(&config.provider) {
            Some(adapter) => adapter.acknowledge(config, period).await,
            None => Ok(()),
        }
    }

    /// One outcome per requested period, in request order. Unsupported
    /// (level, period) pairs fail with a capability error and never reach
    /// the network.
    #[instrument(skip(self, config, periods), fields(adapter = %config.id))]
    pub async fn fetch(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome> {
        let mut requested: Vec<TimePeriod> = Vec::with_capacity(periods.len());
        for period in periods {
            if !requested.contains(period) {
                requested.push(*period);
            }
        }

        let supported: Vec<TimePeriod> = requested
            .iter()
            .copied()
            .filter(|p| config.supports(level, *p))
            .collect();

        let mut fetched: HashMap<TimePeriod, Result<FetchedPayload>> = HashMap::new();
        if !supported.is_empty() {
            match self.adapters.get(&config.provider) {
                Some(adapter) => {
                    info!("Fetching {} {}-level periods for {}", supported.len(), level, config.id);
                    for (period, outcome) in adapter.fetch_supported(config, level, &supported).await {
                        fetched.entry(period).or_insert(outcome);
                    }
                }
                None => {
                    for period in &supported {
                        fetched.insert(
                            *period,
                            Err(HarmonizeError::Config(format!(
                                "no adapter registered for provider {}",
                                config.provider
                            ))),
                        );
                    }
                }
            }
        }

        requested
            .into_iter()
            .map(|period| {
                if !config.supports(level, period) {
                    return (
                        period,
                        Err(HarmonizeError::Capability {
                            provider: config.provider,
                            level,
                            period,
                        }),
                    );
                }
                let outcome = fetched.remove(&period).unwrap_or_else(|| {
                    warn!("{} returned no outcome for {}", config.id, period);
                    Err(HarmonizeError::schema(
                        config.provider,
                        format!("no outcome produced for period {period}"),
                    ))
                });
                (period, outcome)
            })
            .collect()
    }
}
