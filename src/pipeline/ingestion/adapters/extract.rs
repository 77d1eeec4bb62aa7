//! Asynchronous extract lifecycle.
//!
//! `Submitted -> Processing -> Ready -> Downloaded`, or `-> Failed`. The
//! current state is persisted after every transition so polling can stop at
//! any point and resume on a later run against the same extract.

use crate::error::{HarmonizeError, Result};
use crate::types::{Provider, TimePeriod};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExtractState {
    Submitted { number: u64 },
    Processing { number: u64, status: String },
    Ready { number: u64, download_url: String },
    Downloaded { number: u64, data_file: PathBuf },
    Failed { number: u64, reason: String },
}

impl ExtractState {
    pub fn number(&self) -> u64 {
        match self {
            ExtractState::Submitted { number }
            | ExtractState::Processing { number, .. }
            | ExtractState::Ready { number, .. }
            | ExtractState::Downloaded { number, .. }
            | ExtractState::Failed { number, .. } => *number,
        }
    }

    /// Next state given a status document for this extract. Polling is
    /// idempotent: the same document always yields the same state.
    pub fn advance(&self, status: &Value) -> Result<ExtractState> {
        let number = self.number();
        let label = status
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| HarmonizeError::schema(Provider::Ipums, "extract status missing 'status'"))?;

        match label {
            "queued" | "started" | "produced" => Ok(ExtractState::Processing {
                number,
                status: label.to_string(),
            }),
            "completed" => {
                let url = status
                    .pointer("/downloadLinks/data/url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HarmonizeError::schema(
                            Provider::Ipums,
                            format!("extract {number} completed without a data download link"),
                        )
                    })?;
                Ok(ExtractState::Ready {
                    number,
                    download_url: url.to_string(),
                })
            }
            "failed" | "canceled" => {
                let reason = status
                    .get("errors")
                    .filter(|e| !e.is_null())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| label.to_string());
                Ok(ExtractState::Failed { number, reason })
            }
            other => Err(HarmonizeError::schema(
                Provider::Ipums,
                format!("extract {number} has unknown status '{other}'"),
            )),
        }
    }
}

/// On-disk record of in-flight extracts, one state file per (adapter, period).
#[derive(Debug, Clone)]
pub struct ExtractStore {
    dir: PathBuf,
}

impl ExtractStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn state_path(&self, adapter: &str, period: TimePeriod) -> PathBuf {
        self.dir.join(format!("{adapter}_{period}.json"))
    }

    pub fn data_path(&self, adapter: &str, period: TimePeriod) -> PathBuf {
        self.dir.join(format!("{adapter}_{period}.csv"))
    }

    pub fn load(&self, adapter: &str, period: TimePeriod) -> Result<Option<ExtractState>> {
        let path = self.state_path(adapter, period);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, adapter: &str, period: TimePeriod, state: &ExtractState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir, &self.state_path(adapter, period), &content)
    }

    pub fn save_data(&self, adapter: &str, period: TimePeriod, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.data_path(adapter, period);
        write_atomic(&self.dir, &path, bytes)?;
        Ok(path)
    }

    /// Forget an extract so the next run starts from a fresh submission.
    pub fn clear(&self, adapter: &str, period: TimePeriod) -> Result<()> {
        for path in [self.state_path(adapter, period), self.data_path(adapter, period)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

pub(crate) fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| HarmonizeError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_documents_drive_transitions() {
        let submitted = ExtractState::Submitted { number: 7 };
        assert_eq!(
            submitted.advance(&json!({"status": "started"})).unwrap(),
            ExtractState::Processing { number: 7, status: "started".into() }
        );
        let ready = submitted
            .advance(&json!({"status": "completed", "downloadLinks": {"data": {"url": "https://x/7.csv.gz"}}}))
            .unwrap();
        assert_eq!(
            ready,
            ExtractState::Ready { number: 7, download_url: "https://x/7.csv.gz".into() }
        );
        assert!(matches!(
            submitted.advance(&json!({"status": "failed"})).unwrap(),
            ExtractState::Failed { number: 7, .. }
        ));
    }

    #[test]
    fn completed_without_link_is_a_schema_error() {
        let err = ExtractState::Submitted { number: 1 }
            .advance(&json!({"status": "completed"}))
            .unwrap_err();
        assert!(matches!(err, HarmonizeError::Schema { .. }));
    }

    #[test]
    fn state_survives_a_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExtractStore::new(dir.path().join(".extracts"));
        assert!(store.load("ipums_population", TimePeriod(1970)).unwrap().is_none());

        let state = ExtractState::Processing { number: 3, status: "queued".into() };
        store.save("ipums_population", TimePeriod(1970), &state).unwrap();
        assert_eq!(store.load("ipums_population", TimePeriod(1970)).unwrap(), Some(state));

        store.clear("ipums_population", TimePeriod(1970)).unwrap();
        assert!(store.load("ipums_population", TimePeriod(1970)).unwrap().is_none());
    }
}
