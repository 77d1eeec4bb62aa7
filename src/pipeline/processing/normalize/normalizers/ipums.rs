use super::{parse_number, SourceNormalizer};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::processing::normalize::{RawGeography, RawRow};
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, FieldValue, RawPayload};
use std::collections::BTreeMap;

/// Aggregates person-level microdata to places: rows passing the configured
/// filter contribute their weight to their place's total.
pub struct IpumsNormalizer;

impl IpumsNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IpumsNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceNormalizer for IpumsNormalizer {
    fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>> {
        let provider = config.provider;
        let QueryTemplate::Ipums {
            filter,
            weight,
            geography_variable,
            ..
        } = &config.query
        else {
            return Err(HarmonizeError::Config(format!("adapter '{}' has no ipums query", config.id)));
        };
        let RawPayload::Csv(text) = &payload.body else {
            return Err(HarmonizeError::schema(provider, "expected a CSV extract, got JSON"));
        };

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
                .ok_or_else(|| HarmonizeError::schema(provider, format!("extract has no '{name}' column")))
        };
        let weight_idx = column(weight.as_str())?;
        let geo_idx = column(geography_variable.as_str())?;
        let filter_idx = match filter {
            Some(f) => Some((column(f.variable.as_str())?, f.equals)),
            None => None,
        };

        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for (n, record) in reader.records().enumerate() {
            let record = record?;
            if let Some((idx, equals)) = filter_idx {
                let matches = record.get(idx).and_then(parse_number) == Some(equals);
                if !matches {
                    continue;
                }
            }
            let place = record
                .get(geo_idx)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| HarmonizeError::schema(provider, format!("record {} has no place code", n + 1)))?;
            let person_weight = record
                .get(weight_idx)
                .and_then(parse_number)
                .ok_or_else(|| HarmonizeError::schema(provider, format!("record {} has no usable weight", n + 1)))?;
            *totals.entry(place.to_string()).or_insert(0.0) += person_weight;
        }

        Ok(totals
            .into_iter()
            .map(|(place, total)| RawRow {
                geography: RawGeography::State(place),
                name: None,
                values: config
                    .fields
                    .iter()
                    .map(|f| {
                        let value = (f.source.eq_ignore_ascii_case(weight)).then_some(total);
                        FieldValue::new(f.column.clone(), value)
                    })
                    .collect(),
            })
            .collect())
    }
}
