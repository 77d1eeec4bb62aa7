use super::{FetchContext, PeriodOutcome, SourceAdapter};
use crate::error::{HarmonizeError, Result};
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, GeographyLevel, Provider, RawPayload, TimePeriod};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const PROVIDER: Provider = Provider::Nhgis;

/// NHGIS tables downloaded by hand from the NHGIS web interface. Each year
/// is read from the file in the NHGIS directory whose name contains it.
pub struct NhgisAdapter {
    ctx: Arc<FetchContext>,
}

impl NhgisAdapter {
    pub fn new(ctx: Arc<FetchContext>) -> Self {
        Self { ctx }
    }

    /// Candidate files for a year, sorted by name.
    fn files_for(dir: &Path, extension: &str, period: TimePeriod) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let year = period.to_string();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let matches_extension = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension));
            let matches_year = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(&year));
            if path.is_file() && matches_extension && matches_year {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn fetch_period(
        &self,
        config: &AdapterConfig,
        extension: &str,
        level: GeographyLevel,
        period: TimePeriod,
    ) -> Result<FetchedPayload> {
        let dir = &self.ctx.nhgis_dir;
        let files = Self::files_for(dir, extension, period)?;
        let Some(path) = files.first() else {
            return Err(HarmonizeError::NotFound {
                provider: PROVIDER,
                key: format!("{period} table in {}", dir.display()),
            });
        };
        if files.len() > 1 {
            warn!(
                "{} NHGIS files match {}; using {}",
                files.len(),
                period,
                path.display()
            );
        }
        debug!("Reading NHGIS table {}", path.display());

        let text = tokio::fs::read_to_string(path).await?;
        let provenance = self
            .ctx
            .provenance(config, level, period, &format!("file://{}", path.display()));
        Ok(FetchedPayload {
            time_period: period,
            level,
            body: RawPayload::Csv(text),
            provenance,
        })
    }
}

#[async_trait]
impl SourceAdapter for NhgisAdapter {
    async fn fetch_supported(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome> {
        let extension = match &config.query {
            QueryTemplate::Nhgis { extension, .. } => extension.as_str(),
            _ => {
                let err = HarmonizeError::Config(format!("adapter '{}' has no nhgis query", config.id));
                return periods.iter().map(|p| (*p, Err(err.replicate(PROVIDER)))).collect();
            }
        };

        let mut outcomes = Vec::with_capacity(periods.len());
        for period in periods {
            outcomes.push((*period, self.fetch_period(config, extension, level, *period).await));
        }
        outcomes
    }
}
