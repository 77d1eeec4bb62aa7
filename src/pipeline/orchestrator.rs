use super::ingestion::{AdapterSet, FetchContext, ProviderClients};
use super::processing::derive;
use super::processing::RecordNormalizer;
use super::storage::{combine, Table, TableStore, WideTable};
use crate::app::ports::HttpClientPort;
use crate::config::Settings;
use crate::error::{HarmonizeError, Result};
use crate::metrics;
use crate::registry::{AdapterConfig, AdapterRegistry};
use crate::types::{FetchedPayload, GeographyLevel, MetricFamily, Provider, TimePeriod};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What a fetch run covers. Empty or `None` fields mean "as configured".
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub adapters: Vec<String>,
    pub level: Option<GeographyLevel>,
    pub years: Option<Vec<TimePeriod>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeriodStatus {
    /// Provider data was normalized and written.
    Written {
        rows: usize,
        skipped_geographies: Vec<String>,
    },
    /// The provider has no data; null-valued rows were recorded.
    NoData { rows: usize },
    Failed { kind: &'static str, message: String },
}

impl PeriodStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, PeriodStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodReport {
    pub adapter: String,
    pub provider: Provider,
    pub metric_family: MetricFamily,
    pub level: GeographyLevel,
    pub period: TimePeriod,
    pub status: PeriodStatus,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub periods: Vec<PeriodReport>,
}

impl RunReport {
    pub fn any_succeeded(&self) -> bool {
        self.periods.iter().any(|p| p.status.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &PeriodReport> {
        self.periods.iter().filter(|p| !p.status.is_success())
    }

    pub fn succeeded_count(&self) -> usize {
        self.periods.iter().filter(|p| p.status.is_success()).count()
    }
}

#[derive(Debug, Clone)]
pub struct CombineReport {
    pub inputs: Vec<PathBuf>,
    pub path: PathBuf,
    pub wide_path: Option<PathBuf>,
    pub rows: usize,
}

/// Generic fetch → normalize → derive → write pipeline, driven entirely by
/// adapter configs.
pub struct Pipeline {
    registry: AdapterRegistry,
    ctx: Arc<FetchContext>,
    adapters: AdapterSet,
    normalizer: RecordNormalizer,
    store: TableStore,
}

impl Pipeline {
    pub fn new(registry: AdapterRegistry, ctx: Arc<FetchContext>, normalizer: RecordNormalizer, store: TableStore) -> Self {
        let adapters = AdapterSet::new(ctx.clone());
        Self {
            registry,
            ctx,
            adapters,
            normalizer,
            store,
        }
    }

    pub fn from_settings(settings: &Settings, http: Arc<dyn HttpClientPort>) -> Result<Self> {
        let registry = match &settings.registry_dir {
            Some(dir) => AdapterRegistry::load_from_directory(dir)?,
            None => AdapterRegistry::builtin()?,
        };
        let store = TableStore::new(settings.output_dir.clone());
        let ctx = Arc::new(FetchContext {
            clients: ProviderClients::new(http, settings.retry.clone(), |service| settings.limits_for(service)),
            api_keys: settings.api_keys.clone(),
            run_id: Uuid::new_v4(),
            extracts_dir: store.extracts_dir(),
            nhgis_dir: settings.nhgis_dir.clone(),
            poll_interval: settings.ipums_poll_interval,
            poll_timeout: settings.ipums_poll_timeout,
        });
        Ok(Self::new(
            registry,
            ctx,
            RecordNormalizer::new(settings.geography_policy),
            store,
        ))
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// Fetch every selected (adapter, level, period). Individual period
    /// failures are reported, never raised; only an invalid plan is an error.
    #[instrument(skip(self, plan), fields(run_id = %self.ctx.run_id))]
    pub async fn run(&self, plan: &RunPlan) -> Result<RunReport> {
        let started = Instant::now();
        let configs = self.registry.select(&plan.adapters)?;
        info!(
            "🚀 Starting run {} over {} adapters (unknown geographies: {})",
            self.ctx.run_id,
            configs.len(),
            self.normalizer.policy()
        );

        let mut periods = Vec::new();
        for config in configs {
            let levels = match plan.level {
                Some(level) => vec![level],
                None => config.levels.clone(),
            };
            let requested = plan
                .years
                .clone()
                .unwrap_or_else(|| config.configured_periods());
            for level in levels {
                periods.extend(self.run_adapter(config, level, &requested).await);
            }
        }

        let report = RunReport {
            run_id: self.ctx.run_id,
            periods,
        };
        let elapsed = started.elapsed().as_secs_f64();
        metrics::run_duration(elapsed);
        if report.any_succeeded() {
            info!(
                "🎉 Run {} finished in {:.1}s: {} periods succeeded, {} failed",
                report.run_id,
                elapsed,
                report.succeeded_count(),
                report.failures().count()
            );
        } else {
            error!("💥 Run {} finished with every period failed", report.run_id);
        }
        Ok(report)
    }

    async fn run_adapter(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodReport> {
        let outcomes = self.adapters.fetch(config, level, periods).await;
        let mut reports = Vec::with_capacity(outcomes.len());

        for (period, outcome) in outcomes {
            let status = match outcome {
                Ok(payload) => self.store_payload(config, &payload).await,
                Err(err) if err.is_not_found() => self.record_no_data(config, level, period, &err),
                Err(err) => Err(err),
            };
            let status = match status {
                Ok(status) => {
                    metrics::fetch::period_succeeded(config.provider);
                    status
                }
                Err(err) => {
                    if matches!(err, HarmonizeError::TableSchema { .. } | HarmonizeError::Io(_)) {
                        metrics::storage::write_failed();
                    }
                    metrics::fetch::period_failed(config.provider, err.kind());
                    warn!("❌ {} {} {}: {}", config.id, level, period, err);
                    PeriodStatus::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    }
                }
            };
            reports.push(PeriodReport {
                adapter: config.id.clone(),
                provider: config.provider,
                metric_family: config.metric_family.clone(),
                level,
                period,
                status,
            });
        }
        reports
    }

    /// Normalize, derive and write one payload. The adapter is only told
    /// the period is done once the table write has committed.
    async fn store_payload(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<PeriodStatus> {
        let normalized = self.normalizer.normalize(config, payload)?;
        let records = derive::apply(config, normalized.records);
        let rows = records.len();
        let target = self.store.table_path(config.provider, &config.metric_family);
        let schema = self.registry.table_schema(config)?;
        let summary = self.store.write(&target, &schema, records)?;
        metrics::storage::rows_written(&config.metric_family, summary.inserted, summary.replaced);
        info!(
            "✅ {} {} {}: {} rows ({} new, {} replaced)",
            config.id, payload.level, payload.time_period, rows, summary.inserted, summary.replaced
        );
        if let Err(err) = self.adapters.acknowledge(config, payload.time_period).await {
            warn!("{} {}: could not release fetch state: {}", config.id, payload.time_period, err);
        }
        Ok(PeriodStatus::Written {
            rows,
            skipped_geographies: normalized.skipped_geographies,
        })
    }

    /// State-level gaps are written as null rows; county gaps are only
    /// reported because the expected county set is not known up front.
    fn record_no_data(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        period: TimePeriod,
        err: &HarmonizeError,
    ) -> Result<PeriodStatus> {
        info!("{} has no data for {} {}: {}", config.id, level, period, err);
        if level == GeographyLevel::County {
            return Ok(PeriodStatus::NoData { rows: 0 });
        }
        let provenance = self
            .ctx
            .provenance(config, level, period, &format!("no-data:{}", err));
        let records = self.normalizer.null_records(config, period, &provenance)?;
        let rows = records.len();
        let target = self.store.table_path(config.provider, &config.metric_family);
        let schema = self.registry.table_schema(config)?;
        let summary = self.store.write(&target, &schema, records)?;
        metrics::storage::rows_written(&config.metric_family, summary.inserted, summary.replaced);
        Ok(PeriodStatus::NoData { rows })
    }

    /// Merge family tables into `{output}/combined/{name}.csv`. An empty
    /// family list combines every table under the output directory.
    #[instrument(skip(self))]
    pub fn combine(&self, families: &[MetricFamily], name: &str, wide: bool) -> Result<CombineReport> {
        if name.trim().is_empty() || name.contains(['/', '\\']) {
            return Err(HarmonizeError::Config(format!("invalid combined table name '{name}'")));
        }

        let mut inputs = Vec::new();
        let mut tables: Vec<Table> = Vec::new();
        for path in self.store.list_tables()? {
            let family = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<MetricFamily>().ok());
            let Some(family) = family else {
                continue;
            };
            if !families.is_empty() && !families.contains(&family) {
                continue;
            }
            if let Some(table) = self.store.load(&path)? {
                tables.push(table);
                inputs.push(path);
            }
        }
        if tables.is_empty() {
            return Err(HarmonizeError::Config(format!(
                "no tables found under {} for the requested families",
                self.store.root().display()
            )));
        }

        let merged = combine(&tables);
        let path = self.store.combined_path(name);
        self.store.write_file(&path, &merged.to_csv()?)?;
        info!("Combined {} tables into {} ({} rows)", tables.len(), path.display(), merged.rows.len());

        let wide_path = if wide {
            let wide_path = self.store.combined_path(&format!("{name}_wide"));
            self.store
                .write_file(&wide_path, &WideTable::from_tables(&tables).to_csv()?)?;
            Some(wide_path)
        } else {
            None
        };

        Ok(CombineReport {
            inputs,
            path,
            wide_path,
            rows: merged.rows.len(),
        })
    }
}
