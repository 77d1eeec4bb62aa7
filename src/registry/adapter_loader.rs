use super::{AdapterConfig, FamilyDefinition};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::storage::table::TableSchema;
use crate::types::MetricFamily;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Family definitions shipped with the binary.
const BUILTIN_FAMILIES: &str = include_str!("../../registry/families.json");

/// Family file name inside a registry directory.
const FAMILIES_FILE: &str = "families.json";

/// Adapter definitions shipped with the binary.
const BUILTIN_ADAPTERS: [(&str, &str); 19] = [
    ("acs5_population.json", include_str!("../../registry/adapters/acs5_population.json")),
    ("acs5_poverty.json", include_str!("../../registry/adapters/acs5_poverty.json")),
    ("acs5_housing_rent.json", include_str!("../../registry/adapters/acs5_housing_rent.json")),
    ("acs5_housing_value.json", include_str!("../../registry/adapters/acs5_housing_value.json")),
    ("acs5_health_insurance.json", include_str!("../../registry/adapters/acs5_health_insurance.json")),
    ("acs5_language.json", include_str!("../../registry/adapters/acs5_language.json")),
    ("acs5_commuting.json", include_str!("../../registry/adapters/acs5_commuting.json")),
    ("acs5_occupation.json", include_str!("../../registry/adapters/acs5_occupation.json")),
    ("acs5_industry.json", include_str!("../../registry/adapters/acs5_industry.json")),
    ("acs5_mobility.json", include_str!("../../registry/adapters/acs5_mobility.json")),
    ("acs5_hispanic_poverty.json", include_str!("../../registry/adapters/acs5_hispanic_poverty.json")),
    ("acs5_hispanic_housing_rent.json", include_str!("../../registry/adapters/acs5_hispanic_housing_rent.json")),
    ("acs5_hispanic_housing_value.json", include_str!("../../registry/adapters/acs5_hispanic_housing_value.json")),
    ("dec_sf1_total_population.json", include_str!("../../registry/adapters/dec_sf1_total_population.json")),
    ("dec_pl_total_population.json", include_str!("../../registry/adapters/dec_pl_total_population.json")),
    ("ipums_population.json", include_str!("../../registry/adapters/ipums_population.json")),
    ("nhgis_population.json", include_str!("../../registry/adapters/nhgis_population.json")),
    ("fred_unemployment.json", include_str!("../../registry/adapters/fred_unemployment.json")),
    ("fred_gdp.json", include_str!("../../registry/adapters/fred_gdp.json")),
];

#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    families: BTreeMap<MetricFamily, FamilyDefinition>,
    adapters: BTreeMap<String, AdapterConfig>,
}

impl AdapterRegistry {
    pub fn builtin() -> Result<Self> {
        let families = parse_families("builtin families.json", BUILTIN_FAMILIES)?;
        let mut configs = Vec::with_capacity(BUILTIN_ADAPTERS.len());
        for (name, content) in BUILTIN_ADAPTERS {
            configs.push(parse_config(name, content)?);
        }
        Self::from_parts(families, configs)
    }

    /// Load a registry directory: `families.json` (the built-in families
    /// when absent) plus every other `*.json` adapter definition found in
    /// the directory or its `adapters/` subdirectory.
    pub fn load_from_directory<P: AsRef<Path>>(registry_dir: P) -> Result<Self> {
        let dir_path = registry_dir.as_ref();
        if !dir_path.is_dir() {
            return Err(HarmonizeError::Config(format!(
                "Registry directory does not exist: {}",
                dir_path.display()
            )));
        }

        let families_path = dir_path.join(FAMILIES_FILE);
        let families = if families_path.is_file() {
            let content = fs::read_to_string(&families_path)?;
            parse_families(&families_path.display().to_string(), &content)?
        } else {
            parse_families("builtin families.json", BUILTIN_FAMILIES)?
        };

        let mut paths = json_files(dir_path)?;
        let nested = dir_path.join("adapters");
        if nested.is_dir() {
            paths.extend(json_files(&nested)?);
        }
        paths.retain(|p| p != &families_path);
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path)?;
            configs.push(parse_config(&path.display().to_string(), &content)?);
        }
        debug!(
            "Loaded {} families and {} adapter definitions from {}",
            families.len(),
            configs.len(),
            dir_path.display()
        );
        Self::from_parts(families, configs)
    }

    pub fn from_parts(families: Vec<FamilyDefinition>, configs: Vec<AdapterConfig>) -> Result<Self> {
        let mut family_map = BTreeMap::new();
        for family in families {
            family.validate()?;
            if family_map.contains_key(&family.name) {
                return Err(HarmonizeError::Config(format!(
                    "Duplicate metric family: {}",
                    family.name
                )));
            }
            family_map.insert(family.name.clone(), family);
        }

        let mut adapters = BTreeMap::new();
        for config in configs {
            config.validate()?;
            let family = family_map.get(&config.metric_family).ok_or_else(|| {
                HarmonizeError::Config(format!(
                    "adapter '{}': metric family '{}' is not defined",
                    config.id, config.metric_family
                ))
            })?;
            config.validate_against(family)?;
            if adapters.contains_key(&config.id) {
                return Err(HarmonizeError::Config(format!(
                    "Duplicate adapter id: {}",
                    config.id
                )));
            }
            adapters.insert(config.id.clone(), config);
        }
        Ok(Self {
            families: family_map,
            adapters,
        })
    }

    pub fn get(&self, adapter_id: &str) -> Option<&AdapterConfig> {
        self.adapters.get(adapter_id)
    }

    pub fn family(&self, name: &MetricFamily) -> Option<&FamilyDefinition> {
        self.families.get(name)
    }

    pub fn families(&self) -> Vec<&FamilyDefinition> {
        self.families.values().collect()
    }

    /// Schema of the table an adapter writes into, shared by every adapter
    /// of the same family.
    pub fn table_schema(&self, config: &AdapterConfig) -> Result<TableSchema> {
        self.family(&config.metric_family)
            .map(FamilyDefinition::table_schema)
            .ok_or_else(|| {
                HarmonizeError::Config(format!("metric family '{}' is not defined", config.metric_family))
            })
    }

    pub fn enabled(&self) -> Vec<&AdapterConfig> {
        self.adapters.values().filter(|a| a.enabled).collect()
    }

    pub fn list(&self) -> Vec<&AdapterConfig> {
        self.adapters.values().collect()
    }

    /// Resolve requested ids, or every enabled adapter when none are given.
    /// Explicitly named adapters run even when disabled.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&AdapterConfig>> {
        if ids.is_empty() {
            return Ok(self.enabled());
        }
        ids.iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| HarmonizeError::Config(format!("Adapter not found in registry: {id}")))
            })
            .collect()
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn parse_config(origin: &str, content: &str) -> Result<AdapterConfig> {
    serde_json::from_str(content).map_err(|e| {
        HarmonizeError::Config(format!("Failed to parse adapter config {origin}: {e}"))
    })
}

fn parse_families(origin: &str, content: &str) -> Result<Vec<FamilyDefinition>> {
    serde_json::from_str(content).map_err(|e| {
        HarmonizeError::Config(format!("Failed to parse family definitions {origin}: {e}"))
    })
}
