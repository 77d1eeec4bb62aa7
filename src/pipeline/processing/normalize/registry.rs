use std::collections::HashMap;

use super::normalizers::{CensusNormalizer, FredNormalizer, IpumsNormalizer, NhgisNormalizer, SourceNormalizer};
use super::RawRow;
use crate::error::{HarmonizeError, Result};
use crate::registry::AdapterConfig;
use crate::types::{FetchedPayload, Provider};

/// Registry of provider-specific payload readers
pub struct NormalizationRegistry {
    normalizers: HashMap<Provider, Box<dyn SourceNormalizer>>,
}

impl NormalizationRegistry {
    /// Create a registry with a reader for every built-in provider
    pub fn new() -> Self {
        let mut registry = Self {
            normalizers: HashMap::new(),
        };

        registry.register(Provider::CensusAcs, Box::new(CensusNormalizer::new()));
        registry.register(Provider::CensusDecennial, Box::new(CensusNormalizer::new()));
        registry.register(Provider::Fred, Box::new(FredNormalizer::new()));
        registry.register(Provider::Ipums, Box::new(IpumsNormalizer::new()));
        registry.register(Provider::Nhgis, Box::new(NhgisNormalizer::new()));

        registry
    }

    fn register(&mut self, provider: Provider, normalizer: Box<dyn SourceNormalizer>) {
        self.normalizers.insert(provider, normalizer);
    }

    pub fn get_normalizer(&self, provider: Provider) -> Option<&dyn SourceNormalizer> {
        self.normalizers.get(&provider).map(|n| n.as_ref())
    }

    /// Read a payload with the reader registered for the config's provider
    pub fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>> {
        match self.get_normalizer(config.provider) {
            Some(normalizer) => normalizer.read(config, payload),
            None => Err(HarmonizeError::Config(format!(
                "No normalizer registered for provider: {}",
                config.provider
            ))),
        }
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.normalizers.keys().copied().collect();
        providers.sort();
        providers
    }
}

impl Default for NormalizationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
