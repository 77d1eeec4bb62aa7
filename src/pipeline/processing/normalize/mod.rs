//! Record normalization: provider payloads to [`CanonicalRecord`]s.
//!
//! Provider-specific readers (see [`normalizers`]) only turn a payload into
//! [`RawRow`]s. Geography resolution, unit scaling and the unknown-geography
//! policy are applied here, once, for every provider.

pub mod normalizers;
pub mod registry;

pub use registry::NormalizationRegistry;

use crate::error::{HarmonizeError, Result};
use crate::geography::{resolve_county, resolve_state, STATES};
use crate::metrics;
use crate::registry::AdapterConfig;
use crate::types::{
    CanonicalRecord, FetchedPayload, FieldValue, GeographyId, GeographyLevel, Provenance, TimePeriod,
};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// What to do with a place encoding missing from the lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeographyPolicy {
    /// Drop the row with a warning and report the encoding.
    #[default]
    Skip,
    /// Fail the whole period.
    Abort,
}

impl FromStr for GeographyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(GeographyPolicy::Skip),
            "abort" => Ok(GeographyPolicy::Abort),
            other => Err(format!("unknown geography policy '{other}' (expected skip or abort)")),
        }
    }
}

impl fmt::Display for GeographyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeographyPolicy::Skip => f.write_str("skip"),
            GeographyPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Place encoding as the provider reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawGeography {
    State(String),
    County { state: String, county: String },
}

impl fmt::Display for RawGeography {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawGeography::State(code) => f.write_str(code),
            RawGeography::County { state, county } => write!(f, "{state}:{county}"),
        }
    }
}

/// One provider row before geography resolution and scaling. `values` follow
/// the adapter's field order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub geography: RawGeography,
    pub name: Option<String>,
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<CanonicalRecord>,
    /// Encodings dropped under [`GeographyPolicy::Skip`].
    pub skipped_geographies: Vec<String>,
}

pub struct RecordNormalizer {
    readers: NormalizationRegistry,
    policy: GeographyPolicy,
}

impl RecordNormalizer {
    pub fn new(policy: GeographyPolicy) -> Self {
        Self {
            readers: NormalizationRegistry::new(),
            policy,
        }
    }

    pub fn policy(&self) -> GeographyPolicy {
        self.policy
    }

    pub fn normalize(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Normalized> {
        let rows = self.readers.read(config, payload)?;
        let mut normalized = Normalized::default();

        for row in rows {
            let (geography_id, geography_name) = match resolve(&row, payload.level) {
                Ok(resolved) => resolved,
                Err(err @ HarmonizeError::UnknownGeography { .. }) => match self.policy {
                    GeographyPolicy::Abort => return Err(err),
                    GeographyPolicy::Skip => {
                        warn!(
                            "Skipping unknown geography '{}' from {} {}",
                            row.geography, config.id, payload.time_period
                        );
                        metrics::normalize::geography_skipped(config.provider);
                        normalized.skipped_geographies.push(row.geography.to_string());
                        continue;
                    }
                },
                Err(err) => return Err(err),
            };

            let values = config
                .fields
                .iter()
                .map(|field| {
                    let raw = row
                        .values
                        .iter()
                        .find(|v| v.column == field.column)
                        .and_then(|v| v.value);
                    FieldValue::new(field.column.clone(), raw.map(|v| v * config.scale_factor))
                })
                .collect();

            normalized.records.push(CanonicalRecord {
                metric_family: config.metric_family.clone(),
                geography_id,
                geography_name,
                time_period: payload.time_period,
                values,
                derived: Vec::new(),
                provenance: payload.provenance.clone(),
            });
        }
        Ok(normalized)
    }

    /// Rows recording that the provider has no data for a period: one per
    /// expected geography, every value null.
    pub fn null_records(
        &self,
        config: &AdapterConfig,
        period: TimePeriod,
        provenance: &Provenance,
    ) -> Result<Vec<CanonicalRecord>> {
        let places: Vec<(GeographyId, String)> = match &config.geographies {
            Some(encodings) => encodings
                .iter()
                .map(|e| resolve_state(e).map(|s| (s.id(), s.name.to_string())))
                .collect::<Result<_>>()?,
            None => STATES.iter().map(|s| (s.id(), s.name.to_string())).collect(),
        };

        Ok(places
            .into_iter()
            .map(|(geography_id, geography_name)| CanonicalRecord {
                metric_family: config.metric_family.clone(),
                geography_id,
                geography_name,
                time_period: period,
                values: config
                    .fields
                    .iter()
                    .map(|f| FieldValue::new(f.column.clone(), None))
                    .collect(),
                derived: Vec::new(),
                provenance: provenance.clone(),
            })
            .collect())
    }
}

fn resolve(row: &RawRow, level: GeographyLevel) -> Result<(GeographyId, String)> {
    match (&row.geography, level) {
        (RawGeography::State(code), GeographyLevel::State) => {
            let state = resolve_state(code)?;
            Ok((state.id(), state.name.to_string()))
        }
        (RawGeography::County { state, county }, GeographyLevel::County) => {
            let (state, id) = resolve_county(state, county)?;
            let name = row
                .name
                .clone()
                .unwrap_or_else(|| format!("{}, {}", id, state.name));
            Ok((id, name))
        }
        (geography, level) => Err(HarmonizeError::UnknownGeography {
            encoding: format!("{geography} at {level} level"),
        }),
    }
}
