use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upstream statistical APIs. Declaration order is the tie-breaker used when
/// two observations were fetched at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    CensusAcs,
    CensusDecennial,
    Ipums,
    Fred,
    Nhgis,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::CensusAcs,
        Provider::CensusDecennial,
        Provider::Ipums,
        Provider::Fred,
        Provider::Nhgis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::CensusAcs => "census_acs",
            Provider::CensusDecennial => "census_decennial",
            Provider::Ipums => "ipums",
            Provider::Fred => "fred",
            Provider::Nhgis => "nhgis",
        }
    }

    /// Upstream service behind the provider. Both Census datasets are served
    /// by the same API and share its request budget.
    pub fn service(&self) -> &'static str {
        match self {
            Provider::CensusAcs | Provider::CensusDecennial => "census",
            Provider::Ipums => "ipums",
            Provider::Fred => "fred",
            Provider::Nhgis => "nhgis",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| format!("unknown provider '{s}'"))
    }
}

/// A named category of observation sharing one canonical schema. Families
/// are declared in the registry, so any lowercase identifier is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricFamily(String);

impl MetricFamily {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(MetricFamily(name))
        } else {
            Err(format!(
                "invalid metric family '{name}': expected a lowercase identifier such as 'housing_rent'"
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for MetricFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricFamily::new(s.trim())
    }
}

impl TryFrom<String> for MetricFamily {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MetricFamily::new(value)
    }
}

impl From<MetricFamily> for String {
    fn from(family: MetricFamily) -> Self {
        family.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeographyLevel {
    State,
    County,
}

impl GeographyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeographyLevel::State => "state",
            GeographyLevel::County => "county",
        }
    }
}

impl fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeographyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "state" => Ok(GeographyLevel::State),
            "county" => Ok(GeographyLevel::County),
            other => Err(format!("unknown geography level '{other}'")),
        }
    }
}

/// Measurement window, expressed as a calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimePeriod(pub i32);

impl TimePeriod {
    pub fn year(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i32>()
            .map(TimePeriod)
            .map_err(|_| format!("invalid time period '{s}'"))
    }
}

/// Canonical place identifier: 2-digit state FIPS or 5-digit county FIPS.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeographyId(String);

impl GeographyId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        GeographyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeographyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named raw value. `None` means the provider reported no usable number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub column: String,
    pub value: Option<f64>,
}

impl FieldValue {
    pub fn new(column: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// Which adapter and query produced an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: Provider,
    pub adapter: String,
    pub query: String,
    pub query_id: String,
    pub fetched_at: DateTime<Utc>,
    pub run_id: Uuid,
}

/// Composite identity of a row within a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub metric_family: MetricFamily,
    pub geography_id: GeographyId,
    pub time_period: TimePeriod,
}

/// One normalized observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub metric_family: MetricFamily,
    pub geography_id: GeographyId,
    pub geography_name: String,
    pub time_period: TimePeriod,
    pub values: Vec<FieldValue>,
    /// Ratios computed from `values`, one per derived rule of the adapter.
    #[serde(default)]
    pub derived: Vec<FieldValue>,
    pub provenance: Provenance,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            metric_family: self.metric_family.clone(),
            geography_id: self.geography_id.clone(),
            time_period: self.time_period,
        }
    }

    /// Value of a named column; absent columns and nulls both read as `None`.
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|v| v.column == column)
            .and_then(|v| v.value)
    }

    pub fn derived(&self, column: &str) -> Option<f64> {
        self.derived
            .iter()
            .find(|v| v.column == column)
            .and_then(|v| v.value)
    }

    /// First derived value, if the adapter declares any rule.
    pub fn derived_value(&self) -> Option<f64> {
        self.derived.first().and_then(|v| v.value)
    }

    /// The value used to rank rows for presentation.
    pub fn primary_value(&self) -> Option<f64> {
        self.derived_value()
            .or_else(|| self.values.iter().find_map(|v| v.value))
    }

    /// Replace the derived values, producing a new record.
    pub fn with_derived(mut self, derived: Vec<FieldValue>) -> Self {
        self.derived = derived;
        self
    }
}

/// Provider response body as handed from an adapter to a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Json(serde_json::Value),
    Csv(String),
}

/// A successful fetch for exactly one time period.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub time_period: TimePeriod,
    pub level: GeographyLevel,
    pub body: RawPayload,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_strings() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("census".parse::<Provider>().is_err());
        assert_eq!(Provider::CensusAcs.service(), Provider::CensusDecennial.service());
    }

    #[test]
    fn families_are_open_lowercase_identifiers() {
        let family: MetricFamily = "health_insurance".parse().unwrap();
        assert_eq!(family.as_str(), "health_insurance");
        assert_eq!(MetricFamily::new("commuting2").unwrap().to_string(), "commuting2");
        for bad in ["", "Poverty", "2020_rate", "housing-rent", "../etc"] {
            assert!(MetricFamily::new(bad).is_err(), "{bad} should be rejected");
        }

        let parsed: MetricFamily = serde_json::from_str("\"language\"").unwrap();
        assert_eq!(parsed.as_str(), "language");
        assert!(serde_json::from_str::<MetricFamily>("\"Language\"").is_err());
    }

    #[test]
    fn primary_value_prefers_derived() {
        let provenance = Provenance {
            provider: Provider::CensusAcs,
            adapter: "acs5_poverty".into(),
            query: "q".into(),
            query_id: "id".into(),
            fetched_at: Utc::now(),
            run_id: Uuid::nil(),
        };
        let record = CanonicalRecord {
            metric_family: MetricFamily::new("poverty").unwrap(),
            geography_id: GeographyId::new("36"),
            geography_name: "New York".into(),
            time_period: TimePeriod(2018),
            values: vec![
                FieldValue::new("below_poverty", None),
                FieldValue::new("universe", Some(10.0)),
            ],
            derived: Vec::new(),
            provenance,
        };
        assert_eq!(record.primary_value(), Some(10.0));
        let derived = record.clone().with_derived(vec![
            FieldValue::new("poverty_rate", Some(0.5)),
            FieldValue::new("child_rate", Some(0.2)),
        ]);
        assert_eq!(derived.primary_value(), Some(0.5));
        assert_eq!(derived.derived("child_rate"), Some(0.2));
        assert_eq!(record.value("missing"), None);
    }
}
