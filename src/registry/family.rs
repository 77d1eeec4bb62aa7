use crate::constants::is_reserved_column;
use crate::error::{HarmonizeError, Result};
use crate::pipeline::storage::table::TableSchema;
use crate::types::MetricFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Canonical column set of one metric family. Every adapter of the family
/// writes a subset of these columns, and the family table carries all of
/// them in this order.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FamilyDefinition {
    pub name: MetricFamily,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub derived: Vec<String>,
}

impl FamilyDefinition {
    pub fn table_schema(&self) -> TableSchema {
        TableSchema {
            metric_family: Some(self.name.clone()),
            value_columns: self.columns.clone(),
            derived_columns: self.derived.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(HarmonizeError::Config(format!("family '{}': {}", self.name, message)));

        if self.columns.is_empty() {
            return fail("at least one column is required".into());
        }
        let mut seen = HashSet::new();
        for column in self.columns.iter().chain(self.derived.iter()) {
            if column.trim().is_empty() || is_reserved_column(column) {
                return fail(format!("column '{column}' is reserved"));
            }
            if !seen.insert(column.as_str()) {
                return fail(format!("column '{column}' is declared twice"));
            }
        }
        Ok(())
    }
}
