use super::{FetchContext, PeriodOutcome, SourceAdapter};
use crate::app::ports::HttpRequest;
use crate::constants::CENSUS_BASE_URL;
use crate::error::{HarmonizeError, Result};
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, GeographyLevel, RawPayload, TimePeriod};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

/// Census Data API (ACS and Decennial). One request per period; requests run
/// concurrently and are bounded by the Census rate limiter.
pub struct CensusAdapter {
    ctx: Arc<FetchContext>,
}

impl CensusAdapter {
    pub fn new(ctx: Arc<FetchContext>) -> Self {
        Self { ctx }
    }

    pub fn build_url(
        dataset: &str,
        period: TimePeriod,
        variables: &[&str],
        level: GeographyLevel,
        key: Option<&str>,
    ) -> String {
        let mut url = format!(
            "{}/{}/{}?get=NAME,{}&for={}:*",
            CENSUS_BASE_URL,
            period.year(),
            dataset.trim_matches('/'),
            variables.join(","),
            level.as_str()
        );
        if let Some(key) = key {
            url.push_str("&key=");
            url.push_str(key);
        }
        url
    }

    async fn fetch_period(
        &self,
        config: &AdapterConfig,
        dataset: &str,
        level: GeographyLevel,
        period: TimePeriod,
    ) -> Result<FetchedPayload> {
        let variables: Vec<&str> = config.fields.iter().map(|f| f.source.as_str()).collect();
        let key = self.ctx.api_keys.for_provider(config.provider);
        let url = Self::build_url(dataset, period, &variables, level, key);
        let provenance = self.ctx.provenance(config, level, period, &url);
        debug!("Census request {}", provenance.query);

        let response = self
            .ctx
            .clients
            .send_expecting_data(
                config.provider,
                HttpRequest::get(url),
                &format!("{} {}-level {}", dataset, level, period),
            )
            .await?;

        // An invalid key is answered with a 200 HTML error page.
        if response.content_type.starts_with("text/html") {
            return Err(HarmonizeError::Provider {
                provider: config.provider,
                status: response.status,
                message: "received an HTML page instead of data; check CENSUS_API_KEY".into(),
            });
        }
        if response.bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(HarmonizeError::NotFound {
                provider: config.provider,
                key: format!("{} {}-level {}", dataset, level, period),
            });
        }

        let body: serde_json::Value = serde_json::from_slice(&response.bytes).map_err(|e| {
            HarmonizeError::schema(config.provider, format!("response is not JSON: {e}"))
        })?;

        Ok(FetchedPayload {
            time_period: period,
            level,
            body: RawPayload::Json(body),
            provenance,
        })
    }
}

#[async_trait]
impl SourceAdapter for CensusAdapter {
    async fn fetch_supported(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome> {
        let dataset = match &config.query {
            QueryTemplate::Census { dataset } => dataset.as_str(),
            _ => {
                return periods
                    .iter()
                    .map(|p| {
                        (
                            *p,
                            Err(HarmonizeError::Config(format!(
                                "adapter '{}' has no census query",
                                config.id
                            ))),
                        )
                    })
                    .collect()
            }
        };

        join_all(periods.iter().map(|period| async move {
            (*period, self.fetch_period(config, dataset, level, *period).await)
        }))
        .await
    }
}
