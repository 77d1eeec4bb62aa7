use super::{parse_number, SourceNormalizer};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::processing::normalize::{RawGeography, RawRow};
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, FieldValue, RawPayload};

/// Reads NHGIS tabular CSVs. Table codes differ between census years, so a
/// field's `source` matches a header exactly or, failing that, as a
/// case-insensitive substring (e.g. `puerto` finds the Puerto Rican count).
pub struct NhgisNormalizer;

impl NhgisNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NhgisNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_column(headers: &csv::StringRecord, wanted: &str) -> Option<usize> {
    let wanted = wanted.trim().to_ascii_lowercase();
    headers
        .iter()
        .position(|h| h.trim().to_ascii_lowercase() == wanted)
        .or_else(|| {
            headers
                .iter()
                .position(|h| h.to_ascii_lowercase().contains(&wanted))
        })
}

/// `GISJOIN` values look like `G360`: the state FIPS follows the prefix.
fn gisjoin_state(raw: &str) -> Option<String> {
    raw.trim()
        .strip_prefix('G')
        .and_then(|rest| rest.get(..2))
        .filter(|code| code.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

impl SourceNormalizer for NhgisNormalizer {
    fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>> {
        let provider = config.provider;
        let QueryTemplate::Nhgis { geography_columns, .. } = &config.query else {
            return Err(HarmonizeError::Config(format!("adapter '{}' has no nhgis query", config.id)));
        };
        let RawPayload::Csv(text) = &payload.body else {
            return Err(HarmonizeError::schema(provider, "expected a CSV table, got JSON"));
        };

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers()?.clone();
        let (geo_idx, geo_column) = geography_columns
            .iter()
            .find_map(|name| {
                headers
                    .iter()
                    .position(|h| h.trim().eq_ignore_ascii_case(name))
                    .map(|idx| (idx, name.as_str()))
            })
            .ok_or_else(|| {
                HarmonizeError::schema(
                    provider,
                    format!("table has none of the place columns {}", geography_columns.join(", ")),
                )
            })?;
        let field_idx: Vec<(usize, &str)> = config
            .fields
            .iter()
            .map(|f| {
                find_column(&headers, &f.source)
                    .map(|idx| (idx, f.column.as_str()))
                    .ok_or_else(|| HarmonizeError::schema(provider, format!("table has no column matching '{}'", f.source)))
            })
            .collect::<Result<_>>()?;

        let mut out = Vec::new();
        for (n, record) in reader.records().enumerate() {
            let record = record?;
            let cells: Vec<&str> = field_idx.iter().map(|(idx, _)| record.get(*idx).unwrap_or_default()).collect();
            // Extracts may carry a second header row of descriptions.
            if cells.iter().all(|c| !c.trim().is_empty() && parse_number(c).is_none()) {
                continue;
            }

            let raw_place = record.get(geo_idx).map(str::trim).unwrap_or_default();
            let place = if geo_column.eq_ignore_ascii_case("GISJOIN") {
                gisjoin_state(raw_place)
            } else {
                Some(raw_place.to_string()).filter(|p| !p.is_empty())
            }
            .ok_or_else(|| HarmonizeError::schema(provider, format!("row {} has no usable place", n + 1)))?;

            out.push(RawRow {
                geography: RawGeography::State(place),
                name: None,
                values: field_idx
                    .iter()
                    .zip(cells)
                    .map(|((_, column), cell)| FieldValue::new(*column, parse_number(cell)))
                    .collect(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AdapterRegistry;
    use crate::types::{GeographyLevel, Provenance, Provider, TimePeriod};
    use chrono::Utc;
    use uuid::Uuid;

    fn read_with(csv: &str, geography_columns: &[&str]) -> Result<Vec<RawRow>> {
        let mut config = AdapterRegistry::builtin().unwrap().get("nhgis_population").cloned().unwrap();
        config.query = QueryTemplate::Nhgis {
            geography_columns: geography_columns.iter().map(|c| c.to_string()).collect(),
            extension: "csv".into(),
        };
        let payload = FetchedPayload {
            time_period: TimePeriod(1980),
            level: GeographyLevel::State,
            body: RawPayload::Csv(csv.to_string()),
            provenance: Provenance {
                provider: Provider::Nhgis,
                adapter: config.id.clone(),
                query: "file:///nhgis_1980.csv".into(),
                query_id: "id".into(),
                fetched_at: Utc::now(),
                run_id: Uuid::nil(),
            },
        };
        NhgisNormalizer::new().read(&config, &payload)
    }

    #[test]
    fn finds_the_value_column_by_description() {
        let rows = read_with(
            "GISJOIN,YEAR,STATE,Total Hispanic,Puerto Rican\n\
             G360,1980,New York,1659300,986389\n\
             G340,1980,New Jersey,491883,243540\n",
            &["STATE", "GISJOIN"],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geography, RawGeography::State("New York".into()));
        assert_eq!(rows[0].values, vec![FieldValue::new("puerto_rican", Some(986_389.0))]);
    }

    #[test]
    fn description_rows_are_skipped_and_gisjoin_gives_the_state() {
        let rows = read_with(
            "GISJOIN,YEAR,C9F004\n\
             GIS Join Match Code,Data File Year,Persons: Puerto Rican\n\
             G720,1970,\n\
             G360,1970,872471\n",
            &["GISJOIN"],
        );
        // The description row names the column but the code header does not.
        assert!(matches!(rows, Err(HarmonizeError::Schema { .. })));

        let rows = read_with(
            "GISJOIN,YEAR,Puerto Rican persons\n\
             GIS Join Match Code,Data File Year,Persons: Puerto Rican\n\
             G720,1970,\n\
             G360,1970,872471\n",
            &["GISJOIN"],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geography, RawGeography::State("72".into()));
        assert_eq!(rows[0].values[0].value, None);
        assert_eq!(rows[1].geography, RawGeography::State("36".into()));
        assert_eq!(rows[1].values[0].value, Some(872_471.0));
    }

    #[test]
    fn missing_place_column_is_a_schema_error() {
        let err = read_with("YEAR,Puerto Rican\n1980,5\n", &["STATE"]).unwrap_err();
        assert!(matches!(err, HarmonizeError::Schema { .. }));
    }
}
