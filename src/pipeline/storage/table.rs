//! Family tables on disk.
//!
//! One CSV per (provider, metric family) with a JSON sidecar that fixes the
//! column set on first write. Every write replaces the file atomically and
//! writers to the same path are serialized. The sidecar is written after the
//! CSV, so a table is only ever visible once its data is on disk.

use crate::constants::{
    COL_ADAPTER, COL_FETCHED_AT, COL_GEOGRAPHY_ID, COL_GEOGRAPHY_NAME, COL_METRIC_FAMILY, COL_PROVIDER,
    COL_QUERY, COL_QUERY_ID, COL_RUN_ID, COL_TIME_PERIOD, COMBINED_DIR, EXTRACTS_DIR, SCHEMA_SUFFIX,
};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::ingestion::adapters::extract::write_atomic;
use crate::types::{
    CanonicalRecord, FieldValue, GeographyId, MetricFamily, Provenance, Provider, RecordKey, TimePeriod,
};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

static TABLE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = TABLE_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// `None` for combined tables spanning several families.
    pub metric_family: Option<MetricFamily>,
    pub value_columns: Vec<String>,
    #[serde(default)]
    pub derived_columns: Vec<String>,
}

impl TableSchema {
    pub fn header(&self) -> Vec<String> {
        let mut header = vec![COL_GEOGRAPHY_NAME.to_string(), COL_GEOGRAPHY_ID.to_string()];
        header.extend(self.value_columns.iter().cloned());
        header.extend(self.derived_columns.iter().cloned());
        for column in [
            COL_TIME_PERIOD,
            COL_METRIC_FAMILY,
            COL_PROVIDER,
            COL_ADAPTER,
            COL_QUERY,
            COL_QUERY_ID,
            COL_FETCHED_AT,
            COL_RUN_ID,
        ] {
            header.push(column.to_string());
        }
        header
    }

    /// Reject a batch that does not fit this schema.
    fn check(&self, table: &str, records: &[CanonicalRecord]) -> Result<()> {
        for record in records {
            if let Some(family) = &self.metric_family {
                if &record.metric_family != family {
                    return Err(HarmonizeError::TableSchema {
                        table: table.to_string(),
                        message: format!(
                            "record of family {} cannot be written to a {} table",
                            record.metric_family, family
                        ),
                    });
                }
            }
            if let Some(value) = record.values.iter().find(|v| !self.value_columns.contains(&v.column)) {
                return Err(HarmonizeError::TableSchema {
                    table: table.to_string(),
                    message: format!(
                        "column '{}' is not part of the fixed schema {:?}",
                        value.column, self.value_columns
                    ),
                });
            }
            if let Some(derived) = record
                .derived
                .iter()
                .find(|d| d.value.is_some() && !self.derived_columns.contains(&d.column))
            {
                return Err(HarmonizeError::TableSchema {
                    table: table.to_string(),
                    message: format!(
                        "derived column '{}' is not part of the fixed schema {:?}",
                        derived.column, self.derived_columns
                    ),
                });
            }
        }
        Ok(())
    }

    /// Reorder a record's values to the schema, filling absent columns with null.
    fn conform(&self, mut record: CanonicalRecord) -> CanonicalRecord {
        record.values = self
            .value_columns
            .iter()
            .map(|column| FieldValue::new(column.clone(), record.value(column)))
            .collect();
        record.derived = self
            .derived_columns
            .iter()
            .map(|column| FieldValue::new(column.clone(), record.derived(column)))
            .collect();
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub schema: TableSchema,
    pub rows: Vec<CanonicalRecord>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn get(&self, key: &RecordKey) -> Option<&CanonicalRecord> {
        self.rows.iter().find(|r| &r.key() == key)
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        wtr.write_record(self.schema.header())?;
        for row in &self.rows {
            let mut record = vec![row.geography_name.clone(), row.geography_id.to_string()];
            for column in &self.schema.value_columns {
                record.push(format_value(row.value(column)));
            }
            for column in &self.schema.derived_columns {
                record.push(format_value(row.derived(column)));
            }
            record.push(row.time_period.to_string());
            record.push(row.metric_family.to_string());
            record.push(row.provenance.provider.to_string());
            record.push(row.provenance.adapter.clone());
            record.push(row.provenance.query.clone());
            record.push(row.provenance.query_id.clone());
            record.push(row.provenance.fetched_at.to_rfc3339_opts(SecondsFormat::Micros, true));
            record.push(row.provenance.run_id.to_string());
            wtr.write_record(&record)?;
        }
        wtr.into_inner()
            .map_err(|e| HarmonizeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    pub fn from_csv(schema: TableSchema, name: &str, content: &[u8]) -> Result<Self> {
        let bad = |message: String| HarmonizeError::TableSchema {
            table: name.to_string(),
            message,
        };
        let mut reader = csv::Reader::from_reader(content);
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if header != schema.header() {
            return Err(bad(format!(
                "header {:?} does not match the fixed schema {:?}",
                header,
                schema.header()
            )));
        }

        let n_values = schema.value_columns.len();
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |i: usize| record.get(i).unwrap_or_default();
            let number = |i: usize| -> Result<Option<f64>> {
                let raw = cell(i);
                if raw.is_empty() {
                    return Ok(None);
                }
                raw.parse::<f64>()
                    .map(Some)
                    .map_err(|_| bad(format!("row {}: '{}' is not a number", line + 1, raw)))
            };

            let mut values = Vec::with_capacity(n_values);
            for (offset, column) in schema.value_columns.iter().enumerate() {
                values.push(FieldValue::new(column.clone(), number(2 + offset)?));
            }
            let mut derived = Vec::with_capacity(schema.derived_columns.len());
            for (offset, column) in schema.derived_columns.iter().enumerate() {
                derived.push(FieldValue::new(column.clone(), number(2 + n_values + offset)?));
            }
            let idx = 2 + n_values + derived.len();

            let parse_err = |what: &str| bad(format!("row {}: invalid {}", line + 1, what));
            let time_period: TimePeriod = cell(idx).parse().map_err(|_| parse_err(COL_TIME_PERIOD))?;
            let metric_family: MetricFamily = cell(idx + 1).parse().map_err(|_| parse_err(COL_METRIC_FAMILY))?;
            let provider: Provider = cell(idx + 2).parse().map_err(|_| parse_err(COL_PROVIDER))?;
            let fetched_at = DateTime::parse_from_rfc3339(cell(idx + 6))
                .map_err(|_| parse_err(COL_FETCHED_AT))?
                .with_timezone(&Utc);
            let run_id = Uuid::parse_str(cell(idx + 7)).map_err(|_| parse_err(COL_RUN_ID))?;

            rows.push(CanonicalRecord {
                metric_family,
                geography_id: GeographyId::new(cell(1)),
                geography_name: cell(0).to_string(),
                time_period,
                values,
                derived,
                provenance: Provenance {
                    provider,
                    adapter: cell(idx + 3).to_string(),
                    query: cell(idx + 4).to_string(),
                    query_id: cell(idx + 5).to_string(),
                    fetched_at,
                    run_id,
                },
            });
        }
        Ok(Self { schema, rows })
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub total_rows: usize,
}

/// Table files under one output directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, provider: Provider, family: &MetricFamily) -> PathBuf {
        self.root.join(provider.as_str()).join(format!("{}.csv", family.as_str()))
    }

    pub fn combined_path(&self, name: &str) -> PathBuf {
        self.root.join(COMBINED_DIR).join(format!("{name}.csv"))
    }

    pub fn extracts_dir(&self) -> PathBuf {
        self.root.join(EXTRACTS_DIR)
    }

    pub fn schema_path(table: &Path) -> PathBuf {
        let stem = table.file_stem().and_then(|s| s.to_str()).unwrap_or("table");
        table.with_file_name(format!("{stem}{SCHEMA_SUFFIX}"))
    }

    /// Load a table and its sidecar; `None` when nothing was written yet.
    pub fn load(&self, path: &Path) -> Result<Option<Table>> {
        let schema_path = Self::schema_path(path);
        if !schema_path.exists() {
            return Ok(None);
        }
        let schema: TableSchema = serde_json::from_str(&fs::read_to_string(&schema_path)?)?;
        if !path.exists() {
            return Ok(Some(Table::new(schema)));
        }
        let content = fs::read(path)?;
        Table::from_csv(schema, &path.display().to_string(), &content).map(Some)
    }

    /// Upsert a batch into the table at `target`. The first write fixes the
    /// schema to `proposed`; later batches must fit the stored schema. On any
    /// error the file on disk is unchanged.
    pub fn write(
        &self,
        target: &Path,
        proposed: &TableSchema,
        records: Vec<CanonicalRecord>,
    ) -> Result<WriteSummary> {
        let lock = lock_for(target);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let name = target.display().to_string();

        let schema_path = Self::schema_path(target);
        let existing = match self.load(target)? {
            Some(table) => Some(table),
            None if target.exists() => {
                // Data from a first write whose sidecar never landed.
                let content = fs::read(target)?;
                let table = Table::from_csv(proposed.clone(), &name, &content)?;
                warn!("Table {} has no schema sidecar; recovered {} rows", name, table.rows.len());
                Some(table)
            }
            None => None,
        };
        let needs_sidecar = !schema_path.exists();
        let table = existing.unwrap_or_else(|| Table::new(proposed.clone()));
        table.schema.check(&name, &records)?;

        let mut rows: BTreeMap<(TimePeriod, GeographyId), CanonicalRecord> = table
            .rows
            .into_iter()
            .map(|r| ((r.time_period, r.geography_id.clone()), r))
            .collect();

        let mut summary = WriteSummary::default();
        for record in records {
            let key = (record.time_period, record.geography_id.clone());
            match rows.insert(key, table.schema.conform(record)) {
                Some(_) => summary.replaced += 1,
                None => summary.inserted += 1,
            }
        }
        summary.total_rows = rows.len();

        let updated = Table {
            schema: table.schema,
            rows: rows.into_values().collect(),
        };
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        write_atomic(&dir, target, &updated.to_csv()?)?;
        if needs_sidecar {
            let sidecar = serde_json::to_vec_pretty(&updated.schema)?;
            write_atomic(&dir, &schema_path, &sidecar)?;
            info!("Created table {} with columns {:?}", name, updated.schema.header());
        }
        debug!(
            "Wrote {}: {} inserted, {} replaced, {} rows",
            name, summary.inserted, summary.replaced, summary.total_rows
        );
        Ok(summary)
    }

    /// Every family table under the output directory.
    pub fn list_tables(&self) -> Result<Vec<PathBuf>> {
        let mut tables = Vec::new();
        for provider in Provider::ALL {
            let dir = self.root.join(provider.as_str());
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                    tables.push(path);
                }
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Replace a whole output file, e.g. a combined table.
    pub fn write_file(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let lock = lock_for(target);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        write_atomic(&dir, target, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn poverty() -> MetricFamily {
        MetricFamily::new("poverty").unwrap()
    }

    fn schema() -> TableSchema {
        TableSchema {
            metric_family: Some(poverty()),
            value_columns: vec!["below_poverty".into(), "universe".into()],
            derived_columns: vec!["poverty_rate".into()],
        }
    }

    fn record(geo: &str, year: i32, below: Option<f64>, derived: Option<f64>) -> CanonicalRecord {
        CanonicalRecord {
            metric_family: poverty(),
            geography_id: GeographyId::new(geo),
            geography_name: format!("place {geo}"),
            time_period: TimePeriod(year),
            values: vec![
                FieldValue::new("below_poverty", below),
                FieldValue::new("universe", Some(1_000_000.0)),
            ],
            derived: vec![FieldValue::new("poverty_rate", derived)],
            provenance: Provenance {
                provider: Provider::CensusAcs,
                adapter: "acs5_poverty".into(),
                query: "https://api.census.gov/data/2018/acs/acs5?get=NAME,B17001_002E&for=state:*".into(),
                query_id: "abc".into(),
                fetched_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                run_id: Uuid::nil(),
            },
        }
    }

    #[test]
    fn upsert_replaces_rows_with_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());

        let first = store
            .write(&path, &schema(), vec![record("36", 2018, Some(1.0), Some(0.1)), record("36", 2019, None, None)])
            .unwrap();
        assert_eq!(first, WriteSummary { inserted: 2, replaced: 0, total_rows: 2 });

        let second = store
            .write(&path, &schema(), vec![record("36", 2018, Some(2.0), Some(0.2))])
            .unwrap();
        assert_eq!(second, WriteSummary { inserted: 0, replaced: 1, total_rows: 2 });

        let table = store.load(&path).unwrap().unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].value("below_poverty"), Some(2.0));
        assert_eq!(table.rows[0].derived_value(), Some(0.2));
        assert_eq!(table.rows[1].derived_value(), None);
    }

    #[test]
    fn null_is_an_empty_cell_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        let original = record("06", 2019, None, None);
        store.write(&path, &schema(), vec![original.clone()]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "geography_name,geography_id,below_poverty,universe,poverty_rate,time_period,metric_family,provider,adapter,query,query_id,fetched_at,run_id"
        );
        assert!(lines.next().unwrap().starts_with("place 06,06,,1000000,,2019,poverty,census_acs"));

        let table = store.load(&path).unwrap().unwrap();
        assert_eq!(table.rows, vec![original]);
    }

    #[test]
    fn schema_is_fixed_by_the_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        store.write(&path, &schema(), vec![record("36", 2018, Some(1.0), None)]).unwrap();
        let before = fs::read(&path).unwrap();

        let mut extra = record("36", 2019, Some(1.0), None);
        extra.values.push(FieldValue::new("households", Some(3.0)));
        let err = store.write(&path, &schema(), vec![extra]).unwrap_err();
        assert!(matches!(err, HarmonizeError::TableSchema { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);

        // A record missing a column gets an explicit null instead.
        let mut partial = record("48", 2018, Some(5.0), None);
        partial.values.remove(1);
        store.write(&path, &schema(), vec![partial]).unwrap();
        let table = store.load(&path).unwrap().unwrap();
        let key = RecordKey {
            metric_family: poverty(),
            geography_id: GeographyId::new("48"),
            time_period: TimePeriod(2018),
        };
        assert_eq!(table.get(&key).unwrap().values[1], FieldValue::new("universe", None));
    }

    #[test]
    fn other_families_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        let mut wrong = record("36", 2018, Some(1.0), None);
        wrong.metric_family = MetricFamily::new("housing_rent").unwrap();
        assert!(store.write(&path, &schema(), vec![wrong]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_writers_to_one_table_do_not_lose_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());

        std::thread::scope(|scope| {
            for year in 2010..2018 {
                let store = store.clone();
                let path = path.clone();
                scope.spawn(move || {
                    store.write(&path, &schema(), vec![record("36", year, Some(1.0), None)]).unwrap();
                });
            }
        });

        assert_eq!(store.load(&path).unwrap().unwrap().rows.len(), 8);
    }

    #[test]
    fn sidecar_lands_after_the_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        store.write(&path, &schema(), vec![record("36", 2018, Some(1.0), Some(0.1))]).unwrap();

        // A first write interrupted between the two files leaves only the CSV.
        fs::remove_file(TableStore::schema_path(&path)).unwrap();
        assert!(store.load(&path).unwrap().is_none());

        let summary = store
            .write(&path, &schema(), vec![record("36", 2019, Some(2.0), None)])
            .unwrap();
        assert_eq!(summary, WriteSummary { inserted: 1, replaced: 0, total_rows: 2 });
        assert!(TableStore::schema_path(&path).exists());
        assert_eq!(store.load(&path).unwrap().unwrap().rows.len(), 2);
    }

    #[test]
    fn orphaned_data_with_another_layout_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "geography_name,geography_id,households\n").unwrap();

        let err = store
            .write(&path, &schema(), vec![record("36", 2018, Some(1.0), None)])
            .unwrap_err();
        assert!(matches!(err, HarmonizeError::TableSchema { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "geography_name,geography_id,households\n");
        assert!(!TableStore::schema_path(&path).exists());
    }

    #[test]
    fn derived_values_outside_the_schema_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let path = store.table_path(Provider::CensusAcs, &poverty());
        let mut extra = record("36", 2018, Some(1.0), Some(0.1));
        extra.derived.push(FieldValue::new("child_poverty_rate", Some(0.3)));
        let err = store.write(&path, &schema(), vec![extra]).unwrap_err();
        assert!(err.to_string().contains("child_poverty_rate"));
    }
}
