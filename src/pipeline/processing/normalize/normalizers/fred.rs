use super::{parse_number, SourceNormalizer};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::processing::normalize::{RawGeography, RawRow};
use crate::registry::AdapterConfig;
use crate::types::{FetchedPayload, FieldValue, RawPayload};
use serde_json::Value;

/// Reads one fanned-out FRED observation: `{"geography", "observation"}`.
pub struct FredNormalizer;

impl FredNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FredNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceNormalizer for FredNormalizer {
    fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>> {
        let provider = config.provider;
        let RawPayload::Json(body) = &payload.body else {
            return Err(HarmonizeError::schema(provider, "expected a JSON payload, got CSV"));
        };
        let geography = body
            .get("geography")
            .and_then(Value::as_str)
            .ok_or_else(|| HarmonizeError::schema(provider, "payload has no geography"))?;
        let observation = body
            .get("observation")
            .filter(|o| o.is_object())
            .ok_or_else(|| HarmonizeError::schema(provider, "payload has no observation"))?;

        let values = config
            .fields
            .iter()
            .map(|field| {
                let value = match observation.get(&field.source) {
                    Some(Value::String(s)) => parse_number(s),
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::Null) => None,
                    Some(other) => {
                        return Err(HarmonizeError::schema(
                            provider,
                            format!("field '{}' has unexpected value {}", field.source, other),
                        ))
                    }
                    None => {
                        return Err(HarmonizeError::schema(
                            provider,
                            format!("observation has no field '{}'", field.source),
                        ))
                    }
                };
                Ok(FieldValue::new(field.column.clone(), value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(vec![RawRow {
            geography: RawGeography::State(geography.to_string()),
            name: None,
            values,
        }])
    }
}
