//! Declarative adapter configuration.
//!
//! One [`AdapterConfig`] describes everything that differs between metric
//! families served by the same provider: the query template, how provider
//! fields map onto canonical columns, the unit scale, and which
//! (geography level, period) combinations the provider can serve.

pub mod adapter_loader;
pub mod family;

pub use adapter_loader::AdapterRegistry;
pub use family::FamilyDefinition;

use crate::constants::is_reserved_column;
use crate::error::{HarmonizeError, Result};
use crate::types::{GeographyLevel, MetricFamily, Provider, TimePeriod};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FieldMapping {
    /// Variable name as the provider reports it.
    pub source: String,
    /// Canonical column name in the family table.
    pub column: String,
}

/// `(sum(numerator) - sum(less)) / denominator`, written to `column`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DerivedSpec {
    pub column: String,
    pub numerator: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub less: Vec<String>,
    pub denominator: String,
}

impl DerivedSpec {
    pub fn inputs(&self) -> impl Iterator<Item = &String> {
        self.numerator
            .iter()
            .chain(self.less.iter())
            .chain(std::iter::once(&self.denominator))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CapabilityRule {
    pub levels: Vec<GeographyLevel>,
    pub from: i32,
    pub to: i32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PeriodRange {
    pub from: i32,
    pub to: i32,
    #[serde(default = "default_step")]
    pub step: i32,
}

fn default_step() -> i32 {
    1
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IpumsFilter {
    pub variable: String,
    pub equals: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryTemplate {
    /// `{base}/{year}/{dataset}?get=NAME,{fields}&for={level}:*`
    Census { dataset: String },
    /// One series, fetched for the whole period span at once.
    Fred {
        series_id: String,
        /// Place encoding the series describes.
        geography: String,
        #[serde(default = "default_frequency")]
        frequency: String,
        #[serde(default = "default_aggregation")]
        aggregation_method: String,
        #[serde(default = "default_units")]
        units: String,
    },
    /// Microdata extract aggregated to places by summing a weight.
    Ipums {
        collection: String,
        /// Sample name per census year.
        #[serde(with = "sample_years")]
        samples: BTreeMap<i32, String>,
        variables: Vec<String>,
        filter: Option<IpumsFilter>,
        weight: String,
        geography_variable: String,
    },
    /// Tabular NHGIS downloads kept on local disk, one CSV per year. The
    /// file for a year is the one whose name contains the year.
    Nhgis {
        /// Candidate place columns, first match wins (names or FIPS codes).
        geography_columns: Vec<String>,
        #[serde(default = "default_nhgis_extension")]
        extension: String,
    },
}

/// JSON object keys are always strings, and an internally tagged enum
/// buffers its content before the variant is known, so integer keys must
/// be parsed by hand.
mod sample_years {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<i32, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(year, sample)| {
                year.trim()
                    .parse::<i32>()
                    .map(|year| (year, sample))
                    .map_err(|_| D::Error::custom(format!("sample year '{year}' is not a number")))
            })
            .collect()
    }

    pub fn serialize<S>(samples: &BTreeMap<i32, String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(samples.iter().map(|(year, sample)| (year.to_string(), sample)))
    }
}

fn default_nhgis_extension() -> String {
    "csv".to_string()
}

fn default_frequency() -> String {
    "a".to_string()
}

fn default_aggregation() -> String {
    "avg".to_string()
}

fn default_units() -> String {
    "lin".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AdapterConfig {
    pub id: String,
    pub provider: Provider,
    pub metric_family: MetricFamily,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub query: QueryTemplate,
    pub fields: Vec<FieldMapping>,
    #[serde(default)]
    pub derived: Vec<DerivedSpec>,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    pub capabilities: Vec<CapabilityRule>,
    pub periods: PeriodRange,
    #[serde(default = "default_levels")]
    pub levels: Vec<GeographyLevel>,
    /// Places expected in every period; used to record no-data rows.
    #[serde(default)]
    pub geographies: Option<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_levels() -> Vec<GeographyLevel> {
    vec![GeographyLevel::State]
}

impl AdapterConfig {
    /// Whether the provider can serve this level for this period. Checked
    /// before any request is issued.
    pub fn supports(&self, level: GeographyLevel, period: TimePeriod) -> bool {
        let declared = self.capabilities.iter().any(|rule| {
            rule.levels.contains(&level) && (rule.from..=rule.to).contains(&period.year())
        });
        let sampled = match &self.query {
            QueryTemplate::Ipums { samples, .. } => samples.contains_key(&period.year()),
            _ => true,
        };
        declared && sampled
    }

    pub fn configured_periods(&self) -> Vec<TimePeriod> {
        let step = self.periods.step.max(1);
        (self.periods.from..=self.periods.to)
            .step_by(step as usize)
            .map(TimePeriod)
            .collect()
    }

    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    pub fn derived_columns(&self) -> Vec<String> {
        self.derived.iter().map(|d| d.column.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(HarmonizeError::Config(format!("adapter '{}': {}", self.id, message)));

        if self.id.trim().is_empty() {
            return Err(HarmonizeError::Config("adapter id must not be empty".into()));
        }
        if self.fields.is_empty() {
            return fail("at least one field mapping is required".into());
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if is_reserved_column(&field.column) {
                return fail(format!("column '{}' is reserved", field.column));
            }
            if !seen.insert(field.column.as_str()) {
                return fail(format!("column '{}' is mapped twice", field.column));
            }
        }
        let mut derived_seen = HashSet::new();
        for derived in &self.derived {
            if derived.numerator.is_empty() {
                return fail(format!("derived column '{}' has no numerator", derived.column));
            }
            for input in derived.inputs() {
                if !seen.contains(input.as_str()) {
                    return fail(format!("derived input '{}' is not a mapped column", input));
                }
            }
            if seen.contains(derived.column.as_str())
                || is_reserved_column(&derived.column)
                || !derived_seen.insert(derived.column.as_str())
            {
                return fail(format!("derived column '{}' collides with another column", derived.column));
            }
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return fail(format!("scale_factor must be positive, got {}", self.scale_factor));
        }
        if self.periods.from > self.periods.to {
            return fail("periods.from is after periods.to".into());
        }
        if self.levels.is_empty() {
            return fail("at least one geography level is required".into());
        }
        let provider_matches = matches!(
            (&self.query, self.provider),
            (QueryTemplate::Census { .. }, Provider::CensusAcs)
                | (QueryTemplate::Census { .. }, Provider::CensusDecennial)
                | (QueryTemplate::Fred { .. }, Provider::Fred)
                | (QueryTemplate::Ipums { .. }, Provider::Ipums)
                | (QueryTemplate::Nhgis { .. }, Provider::Nhgis)
        );
        if !provider_matches {
            return fail(format!("query template does not match provider {}", self.provider));
        }
        if let QueryTemplate::Nhgis { geography_columns, .. } = &self.query {
            if geography_columns.is_empty() {
                return fail("NHGIS adapters need at least one geography column".into());
            }
        }
        Ok(())
    }

    /// Every column this adapter writes must be declared by its family, so
    /// all adapters of one family share a single table schema.
    pub fn validate_against(&self, family: &FamilyDefinition) -> Result<()> {
        for column in self.columns() {
            if !family.columns.contains(&column) {
                return Err(HarmonizeError::Config(format!(
                    "adapter '{}': column '{}' is not declared by family '{}' (expected one of: {})",
                    self.id,
                    column,
                    family.name,
                    family.columns.join(", ")
                )));
            }
        }
        for column in self.derived_columns() {
            if !family.derived.contains(&column) {
                return Err(HarmonizeError::Config(format!(
                    "adapter '{}': derived column '{}' is not declared by family '{}'",
                    self.id, column, family.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poverty() -> AdapterConfig {
        AdapterRegistry::builtin()
            .unwrap()
            .get("acs5_poverty")
            .cloned()
            .unwrap()
    }

    #[test]
    fn capability_rules_gate_level_and_period() {
        let config = poverty();
        assert!(config.supports(GeographyLevel::State, TimePeriod(2018)));
        assert!(!config.supports(GeographyLevel::County, TimePeriod(2018)));
        assert!(!config.supports(GeographyLevel::State, TimePeriod(1990)));
    }

    #[test]
    fn ipums_periods_require_a_sample() {
        let registry = AdapterRegistry::builtin().unwrap();
        let config = registry.get("ipums_population").unwrap();
        assert!(config.supports(GeographyLevel::State, TimePeriod(1970)));
        assert!(!config.supports(GeographyLevel::State, TimePeriod(1975)));
        assert_eq!(
            config.configured_periods(),
            vec![TimePeriod(1960), TimePeriod(1970), TimePeriod(1980)]
        );
    }

    #[test]
    fn derived_inputs_must_be_mapped_columns() {
        let mut config = poverty();
        config.derived = vec![DerivedSpec {
            column: "rate".into(),
            numerator: vec!["below_poverty".into()],
            less: Vec::new(),
            denominator: "households".into(),
        }];
        assert!(matches!(config.validate(), Err(HarmonizeError::Config(_))));

        let mut config = poverty();
        config.derived[0].less = vec!["children".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_columns_must_be_distinct() {
        let mut config = poverty();
        let again = config.derived[0].clone();
        config.derived.push(again);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn sample_years_parse_from_string_keys() {
        let config: AdapterConfig = serde_json::from_str(
            r#"{
                "id": "ipums_test",
                "provider": "ipums",
                "metric_family": "population",
                "query": {
                    "kind": "ipums",
                    "collection": "usa",
                    "samples": {"1960": "us1960b", " 1970 ": "us1970a"},
                    "variables": ["BPLD", "STATEFIP", "PERWT"],
                    "filter": {"variable": "BPLD", "equals": 11000},
                    "weight": "PERWT",
                    "geography_variable": "STATEFIP"
                },
                "fields": [{"source": "PERWT", "column": "puerto_rican"}],
                "capabilities": [{"levels": ["state"], "from": 1960, "to": 1980}],
                "periods": {"from": 1960, "to": 1970, "step": 10}
            }"#,
        )
        .unwrap();
        match &config.query {
            QueryTemplate::Ipums { samples, filter, .. } => {
                assert_eq!(samples.get(&1960).map(String::as_str), Some("us1960b"));
                assert_eq!(samples.get(&1970).map(String::as_str), Some("us1970a"));
                assert_eq!(filter.as_ref().map(|f| f.equals), Some(11000.0));
            }
            other => panic!("unexpected query {other:?}"),
        }

        let written = serde_json::to_value(&config).unwrap();
        assert_eq!(written["query"]["samples"]["1960"], "us1960b");
    }

    #[test]
    fn non_numeric_sample_years_are_rejected() {
        let err = serde_json::from_str::<QueryTemplate>(
            r#"{"kind": "ipums", "collection": "usa", "samples": {"sixties": "us1960b"},
                "variables": [], "filter": null, "weight": "PERWT", "geography_variable": "STATEFIP"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sixties"));
    }

    #[test]
    fn columns_outside_the_family_are_rejected() {
        let registry = AdapterRegistry::builtin().unwrap();
        let family = registry.family(&MetricFamily::new("population").unwrap()).unwrap();

        let mut config = registry.get("ipums_population").cloned().unwrap();
        assert!(config.validate_against(family).is_ok());
        config.fields[0].column = "puerto_rican_born".into();
        let err = config.validate_against(family).unwrap_err();
        assert!(err.to_string().contains("puerto_rican_born"));
    }

    #[test]
    fn reserved_and_duplicate_columns_are_rejected() {
        let mut config = poverty();
        config.fields[0].column = "time_period".into();
        assert!(config.validate().is_err());

        let mut config = poverty();
        config.fields[1].column = config.fields[0].column.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn columns_follow_declared_order() {
        let config = poverty();
        assert_eq!(config.columns(), vec!["below_poverty", "universe"]);
        assert_eq!(config.derived_columns(), vec!["poverty_rate"]);
    }
}
