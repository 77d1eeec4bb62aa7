use super::{FetchContext, PeriodOutcome, SourceAdapter};
use crate::app::ports::HttpRequest;
use crate::constants::FRED_BASE_URL;
use crate::error::{HarmonizeError, Result};
use crate::pipeline::ingestion::client::check_status;
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, GeographyLevel, RawPayload, TimePeriod};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// FRED series observations. The whole period span is fetched in one request
/// and fanned back out into one payload per year.
pub struct FredAdapter {
    ctx: Arc<FetchContext>,
}

struct SeriesQuery<'a> {
    series_id: &'a str,
    geography: &'a str,
    frequency: &'a str,
    aggregation_method: &'a str,
    units: &'a str,
}

impl FredAdapter {
    pub fn new(ctx: Arc<FetchContext>) -> Self {
        Self { ctx }
    }

    fn build_url(query: &SeriesQuery<'_>, first: TimePeriod, last: TimePeriod, key: &str) -> String {
        format!(
            "{}/series/observations?series_id={}&api_key={}&file_type=json&observation_start={}-01-01&observation_end={}-12-31&frequency={}&aggregation_method={}&units={}",
            FRED_BASE_URL,
            query.series_id,
            key,
            first.year(),
            last.year(),
            query.frequency,
            query.aggregation_method,
            query.units
        )
    }

    async fn fetch_series(
        &self,
        config: &AdapterConfig,
        query: &SeriesQuery<'_>,
        url: String,
    ) -> Result<HashMap<i32, Value>> {
        let provider = config.provider;
        let response = self.ctx.clients.send(provider, HttpRequest::get(url)).await?;

        if response.status == 400 && response.text().to_ascii_lowercase().contains("does not exist") {
            return Err(HarmonizeError::NotFound {
                provider,
                key: format!("series {}", query.series_id),
            });
        }
        let response = check_status(provider, response, &format!("series {}", query.series_id))?;

        let body: Value = serde_json::from_slice(&response.bytes)
            .map_err(|e| HarmonizeError::schema(provider, format!("response is not JSON: {e}")))?;
        let observations = body
            .get("observations")
            .and_then(Value::as_array)
            .ok_or_else(|| HarmonizeError::schema(provider, "missing 'observations' array"))?;

        let mut by_year = HashMap::new();
        for observation in observations {
            let date = observation
                .get("date")
                .and_then(Value::as_str)
                .ok_or_else(|| HarmonizeError::schema(provider, "observation without 'date'"))?;
            let year: i32 = date
                .get(..4)
                .and_then(|y| y.parse().ok())
                .ok_or_else(|| HarmonizeError::schema(provider, format!("unparsable date '{date}'")))?;
            if observation.get("value").is_none() {
                return Err(HarmonizeError::schema(provider, format!("observation {date} has no 'value'")));
            }
            by_year.insert(year, observation.clone());
        }
        debug!("{} returned {} observations", query.series_id, by_year.len());
        Ok(by_year)
    }
}

#[async_trait]
impl SourceAdapter for FredAdapter {
    async fn fetch_supported(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome> {
        let query = match &config.query {
            QueryTemplate::Fred {
                series_id,
                geography,
                frequency,
                aggregation_method,
                units,
            } => SeriesQuery {
                series_id,
                geography,
                frequency,
                aggregation_method,
                units,
            },
            _ => {
                let err = HarmonizeError::Config(format!("adapter '{}' has no fred query", config.id));
                return periods.iter().map(|p| (*p, Err(err.replicate(config.provider)))).collect();
            }
        };
        let (Some(first), Some(last)) = (periods.iter().min(), periods.iter().max()) else {
            return Vec::new();
        };

        let key = match self.ctx.require_key(config.provider) {
            Ok(key) => key.to_string(),
            Err(err) => return periods.iter().map(|p| (*p, Err(err.replicate(config.provider)))).collect(),
        };

        let url = Self::build_url(&query, *first, *last, &key);
        let mut by_year = match self.fetch_series(config, &query, url.clone()).await {
            Ok(by_year) => by_year,
            Err(err) => return periods.iter().map(|p| (*p, Err(err.replicate(config.provider)))).collect(),
        };

        periods
            .iter()
            .map(|period| {
                let outcome = match by_year.remove(&period.year()) {
                    Some(observation) => Ok(FetchedPayload {
                        time_period: *period,
                        level,
                        body: RawPayload::Json(json!({
                            "geography": query.geography,
                            "observation": observation,
                        })),
                        provenance: self.ctx.provenance(config, level, *period, &url),
                    }),
                    None => Err(HarmonizeError::NotFound {
                        provider: config.provider,
                        key: format!("series {} {}", query.series_id, period),
                    }),
                };
                (*period, outcome)
            })
            .collect()
    }
}
