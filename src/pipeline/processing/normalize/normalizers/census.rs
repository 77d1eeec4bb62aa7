use super::{parse_number, SourceNormalizer};
use crate::constants::CENSUS_SENTINELS;
use crate::error::{HarmonizeError, Result};
use crate::pipeline::processing::normalize::{RawGeography, RawRow};
use crate::registry::AdapterConfig;
use crate::types::{FetchedPayload, FieldValue, GeographyLevel, RawPayload};
use serde_json::Value;

/// Reads Census Data API responses: a JSON array of arrays whose first row
/// holds the column headers.
pub struct CensusNormalizer;

impl CensusNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CensusNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn cell_value(cell: &Value) -> Option<f64> {
    let value = match cell {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }?;
    if CENSUS_SENTINELS.contains(&value) {
        None
    } else {
        Some(value)
    }
}

fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SourceNormalizer for CensusNormalizer {
    fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>> {
        let provider = config.provider;
        let body = match &payload.body {
            RawPayload::Json(body) => body,
            RawPayload::Csv(_) => {
                return Err(HarmonizeError::schema(provider, "expected a JSON payload, got CSV"))
            }
        };
        let table = body
            .as_array()
            .ok_or_else(|| HarmonizeError::schema(provider, "response is not an array of rows"))?;
        let (header, rows) = table
            .split_first()
            .ok_or_else(|| HarmonizeError::schema(provider, "response has no header row"))?;
        let header: Vec<&str> = header
            .as_array()
            .ok_or_else(|| HarmonizeError::schema(provider, "header row is not an array"))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                h.as_str().ok_or_else(|| {
                    HarmonizeError::schema(provider, format!("header cell {} is not a column name: {}", i + 1, h))
                })
            })
            .collect::<Result<_>>()?;

        let column = |name: &str| {
            header
                .iter()
                .position(|h| *h == name)
                .ok_or_else(|| HarmonizeError::schema(provider, format!("missing column '{name}'")))
        };
        let name_idx = column("NAME")?;
        let state_idx = column("state")?;
        let county_idx = match payload.level {
            GeographyLevel::County => Some(column("county")?),
            GeographyLevel::State => None,
        };
        let field_idx: Vec<(usize, &str)> = config
            .fields
            .iter()
            .map(|f| column(f.source.as_str()).map(|i| (i, f.column.as_str())))
            .collect::<Result<_>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (n, row) in rows.iter().enumerate() {
            let cells = row
                .as_array()
                .ok_or_else(|| HarmonizeError::schema(provider, format!("row {} is not an array", n + 1)))?;
            if cells.len() != header.len() {
                return Err(HarmonizeError::schema(
                    provider,
                    format!("row {} has {} cells, header has {}", n + 1, cells.len(), header.len()),
                ));
            }
            let state = cell_text(&cells[state_idx])
                .ok_or_else(|| HarmonizeError::schema(provider, format!("row {} has no state code", n + 1)))?;
            let geography = match county_idx {
                Some(idx) => RawGeography::County {
                    state,
                    county: cell_text(&cells[idx]).ok_or_else(|| {
                        HarmonizeError::schema(provider, format!("row {} has no county code", n + 1))
                    })?,
                },
                None => RawGeography::State(state),
            };
            out.push(RawRow {
                geography,
                name: cell_text(&cells[name_idx]),
                values: field_idx
                    .iter()
                    .map(|(idx, column)| FieldValue::new(*column, cell_value(&cells[*idx])))
                    .collect(),
            });
        }
        Ok(out)
    }
}
