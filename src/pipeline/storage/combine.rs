//! Merge family tables into one longitudinal table.
//!
//! Precedence for conflicting rows with the same
//! `(metric_family, geography_id, time_period)`: the row with the greatest
//! `(fetched_at, provider, query_id, run_id)` wins, so the most recent fetch
//! is kept and exact ties still resolve the same way on every run.

use super::table::{Table, TableSchema};
use crate::constants::{COL_GEOGRAPHY_ID, COL_GEOGRAPHY_NAME, COL_TIME_PERIOD};
use crate::error::{HarmonizeError, Result};
use crate::types::{CanonicalRecord, GeographyId, MetricFamily, RecordKey, TimePeriod};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

fn precedence(record: &CanonicalRecord) -> (DateTime<Utc>, crate::types::Provider, &str, Uuid) {
    let p = &record.provenance;
    (p.fetched_at, p.provider, p.query_id.as_str(), p.run_id)
}

/// Presentation order: period ascending, primary value descending with nulls
/// last, then geography and family ascending.
pub fn presentation_order(a: &CanonicalRecord, b: &CanonicalRecord) -> Ordering {
    a.time_period
        .cmp(&b.time_period)
        .then_with(|| match (a.primary_value(), b.primary_value()) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.geography_id.cmp(&b.geography_id))
        .then_with(|| a.metric_family.cmp(&b.metric_family))
}

fn union_schema(tables: &[Table]) -> TableSchema {
    let mut value_columns: Vec<String> = Vec::new();
    for column in tables.iter().flat_map(|t| t.schema.value_columns.iter()) {
        if !value_columns.contains(column) {
            value_columns.push(column.clone());
        }
    }

    // A derived name that is also a value column elsewhere keeps the value.
    let mut derived_columns: Vec<String> = Vec::new();
    for column in tables.iter().flat_map(|t| t.schema.derived_columns.iter()) {
        if !value_columns.contains(column) && !derived_columns.contains(column) {
            derived_columns.push(column.clone());
        }
    }

    let families: BTreeSet<Option<&MetricFamily>> =
        tables.iter().map(|t| t.schema.metric_family.as_ref()).collect();
    let metric_family = match families.len() {
        1 => families.into_iter().next().flatten().cloned(),
        _ => None,
    };

    TableSchema {
        metric_family,
        value_columns,
        derived_columns,
    }
}

/// Union of all rows, one per key, in presentation order.
pub fn combine(tables: &[Table]) -> Table {
    let schema = union_schema(tables);

    let mut winners: HashMap<RecordKey, &CanonicalRecord> = HashMap::new();
    for row in tables.iter().flat_map(|t| t.rows.iter()) {
        winners
            .entry(row.key())
            .and_modify(|current| {
                if precedence(row) > precedence(*current) {
                    *current = row;
                }
            })
            .or_insert(row);
    }

    let mut rows: Vec<CanonicalRecord> = winners.into_values().cloned().collect();
    rows.sort_by(presentation_order);
    Table { schema, rows }
}

/// One row per `(geography_id, time_period)`, with a `{family}.{column}`
/// column for every value and derived column of the inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    pub columns: Vec<String>,
    pub rows: Vec<WideRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub geography_id: GeographyId,
    pub geography_name: String,
    pub time_period: TimePeriod,
    pub cells: Vec<Option<f64>>,
}

impl WideTable {
    pub fn from_tables(tables: &[Table]) -> Self {
        let merged = combine(tables);

        let mut columns: Vec<String> = Vec::new();
        for table in tables {
            let family = match &table.schema.metric_family {
                Some(f) => f,
                None => continue,
            };
            for column in table.schema.value_columns.iter().chain(table.schema.derived_columns.iter()) {
                let name = format!("{family}.{column}");
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }

        let mut rows: BTreeMap<(TimePeriod, GeographyId), WideRow> = BTreeMap::new();
        for record in &merged.rows {
            let row = rows
                .entry((record.time_period, record.geography_id.clone()))
                .or_insert_with(|| WideRow {
                    geography_id: record.geography_id.clone(),
                    geography_name: record.geography_name.clone(),
                    time_period: record.time_period,
                    cells: vec![None; columns.len()],
                });
            for value in record.values.iter().chain(record.derived.iter()) {
                let name = format!("{}.{}", record.metric_family, value.column);
                if let Some(idx) = columns.iter().position(|c| *c == name) {
                    row.cells[idx] = value.value;
                }
            }
        }

        Self {
            columns,
            rows: rows.into_values().collect(),
        }
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        let mut header = vec![
            COL_GEOGRAPHY_NAME.to_string(),
            COL_GEOGRAPHY_ID.to_string(),
            COL_TIME_PERIOD.to_string(),
        ];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![
                row.geography_name.clone(),
                row.geography_id.to_string(),
                row.time_period.to_string(),
            ];
            record.extend(row.cells.iter().map(|c| c.map(|v| v.to_string()).unwrap_or_default()));
            wtr.write_record(&record)?;
        }
        wtr.into_inner()
            .map_err(|e| HarmonizeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }
}
