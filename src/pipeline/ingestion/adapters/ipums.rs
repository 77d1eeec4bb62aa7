use super::extract::{ExtractState, ExtractStore};
use super::{FetchContext, PeriodOutcome, SourceAdapter};
use crate::app::ports::HttpRequest;
use crate::constants::{IPUMS_API_VERSION, IPUMS_BASE_URL};
use crate::error::{HarmonizeError, Result};
use crate::pipeline::ingestion::client::check_status;
use crate::registry::{AdapterConfig, QueryTemplate};
use crate::types::{FetchedPayload, GeographyLevel, Provider, RawPayload, TimePeriod};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Read;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

const PROVIDER: Provider = Provider::Ipums;

/// IPUMS microdata extracts: submit, poll, download. One extract per period.
pub struct IpumsAdapter {
    ctx: Arc<FetchContext>,
    store: ExtractStore,
}

struct ExtractRequest<'a> {
    collection: &'a str,
    sample: &'a str,
    variables: &'a [String],
}

impl IpumsAdapter {
    pub fn new(ctx: Arc<FetchContext>) -> Self {
        let store = ExtractStore::new(ctx.extracts_dir.clone());
        Self { ctx, store }
    }

    fn extracts_url(collection: &str) -> String {
        format!(
            "{}/extracts?collection={}&version={}",
            IPUMS_BASE_URL, collection, IPUMS_API_VERSION
        )
    }

    fn status_url(collection: &str, number: u64) -> String {
        format!(
            "{}/extracts/{}?collection={}&version={}",
            IPUMS_BASE_URL, number, collection, IPUMS_API_VERSION
        )
    }

    fn definition(request: &ExtractRequest<'_>, adapter: &str, period: TimePeriod) -> Value {
        let mut samples = Map::new();
        samples.insert(request.sample.to_string(), json!({}));
        let mut variables = Map::new();
        for variable in request.variables {
            variables.insert(variable.clone(), json!({}));
        }
        json!({
            "description": format!("{adapter} {period}"),
            "dataStructure": { "rectangular": { "on": "P" } },
            "dataFormat": "csv",
            "samples": samples,
            "variables": variables,
        })
    }

    async fn submit(&self, request: &ExtractRequest<'_>, key: &str, adapter: &str, period: TimePeriod) -> Result<ExtractState> {
        let http_request = HttpRequest::post_json(
            Self::extracts_url(request.collection),
            &Self::definition(request, adapter, period),
        )
        .header("Authorization", key);
        let response = self.ctx.clients.send(PROVIDER, http_request).await?;
        let response = check_status(PROVIDER, response, &format!("extract for {}", request.sample))?;
        let body: Value = serde_json::from_slice(&response.bytes)
            .map_err(|e| HarmonizeError::schema(PROVIDER, format!("submit response is not JSON: {e}")))?;
        let number = body
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| HarmonizeError::schema(PROVIDER, "submit response missing extract 'number'"))?;
        info!("Submitted IPUMS extract {} for {} {}", number, adapter, period);
        Ok(ExtractState::Submitted { number })
    }

    async fn poll(&self, state: &ExtractState, collection: &str, key: &str) -> Result<ExtractState> {
        let number = state.number();
        let request = HttpRequest::get(Self::status_url(collection, number)).header("Authorization", key);
        let response = self.ctx.clients.send(PROVIDER, request).await?;
        let response = check_status(PROVIDER, response, &format!("extract {number}"))?;
        let body: Value = serde_json::from_slice(&response.bytes)
            .map_err(|e| HarmonizeError::schema(PROVIDER, format!("status response is not JSON: {e}")))?;
        state.advance(&body)
    }

    async fn download(&self, number: u64, url: &str, key: &str) -> Result<Vec<u8>> {
        let request = HttpRequest::get(url).header("Authorization", key);
        let response = self.ctx.clients.send(PROVIDER, request).await?;
        let response = check_status(PROVIDER, response, &format!("extract {number} data"))?;
        decompress(&response.bytes, &response.content_type)
    }

    /// Drive one period's extract to completion or until the poll timeout.
    #[instrument(skip(self, config, request, key), fields(adapter = %config.id))]
    async fn fetch_period(
        &self,
        config: &AdapterConfig,
        request: ExtractRequest<'_>,
        key: &str,
        level: GeographyLevel,
        period: TimePeriod,
    ) -> Result<FetchedPayload> {
        let adapter = config.id.as_str();
        let started = Instant::now();

        let mut state = match self.store.load(adapter, period)? {
            Some(state) => {
                info!("Resuming IPUMS extract {} for {}", state.number(), period);
                state
            }
            None => {
                let state = self.submit(&request, key, adapter, period).await?;
                self.store.save(adapter, period, &state)?;
                state
            }
        };

        loop {
            state = match &state {
                ExtractState::Submitted { .. } | ExtractState::Processing { .. } => {
                    let next = self.poll(&state, request.collection, key).await?;
                    self.store.save(adapter, period, &next)?;
                    if let ExtractState::Processing { number, status } = &next {
                        if started.elapsed() >= self.ctx.poll_timeout {
                            return Err(HarmonizeError::transient(
                                PROVIDER,
                                format!("extract {number} still {status} after {:?}; polling resumes on the next run", self.ctx.poll_timeout),
                            ));
                        }
                        tokio::time::sleep(self.ctx.poll_interval).await;
                    }
                    next
                }
                ExtractState::Ready { number, download_url } => {
                    let bytes = self.download(*number, download_url, key).await?;
                    let data_file = self.store.save_data(adapter, period, &bytes)?;
                    let next = ExtractState::Downloaded {
                        number: *number,
                        data_file,
                    };
                    self.store.save(adapter, period, &next)?;
                    next
                }
                // Kept until the table write is acknowledged.
                ExtractState::Downloaded { number, data_file } => {
                    let csv = fs::read_to_string(data_file)?;
                    let url = Self::status_url(request.collection, *number);
                    let provenance = self.ctx.provenance(config, level, period, &url);
                    return Ok(FetchedPayload {
                        time_period: period,
                        level,
                        body: RawPayload::Csv(csv),
                        provenance,
                    });
                }
                ExtractState::Failed { number, reason } => {
                    warn!("IPUMS extract {} for {} failed: {}", number, period, reason);
                    self.store.clear(adapter, period)?;
                    return Err(HarmonizeError::ExtractFailed {
                        provider: PROVIDER,
                        number: *number,
                        reason: reason.clone(),
                    });
                }
            };
        }
    }
}

/// Extract data arrives gzip-compressed or as plain CSV.
fn decompress(bytes: &[u8], content_type: &str) -> Result<Vec<u8>> {
    let gzipped = content_type.contains("gzip");
    if gzipped || bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceAdapter for IpumsAdapter {
    async fn fetch_supported(
        &self,
        config: &AdapterConfig,
        level: GeographyLevel,
        periods: &[TimePeriod],
    ) -> Vec<PeriodOutcome> {
        let (collection, samples, variables) = match &config.query {
            QueryTemplate::Ipums {
                collection,
                samples,
                variables,
                ..
            } => (collection, samples, variables),
            _ => {
                let err = HarmonizeError::Config(format!("adapter '{}' has no ipums query", config.id));
                return periods.iter().map(|p| (*p, Err(err.replicate(PROVIDER)))).collect();
            }
        };
        let key = match self.ctx.require_key(PROVIDER) {
            Ok(key) => key.to_string(),
            Err(err) => return periods.iter().map(|p| (*p, Err(err.replicate(PROVIDER)))).collect(),
        };

        let mut outcomes = Vec::with_capacity(periods.len());
        for period in periods {
            let outcome = match samples.get(&period.year()) {
                Some(sample) => {
                    let request = ExtractRequest {
                        collection,
                        sample,
                        variables,
                    };
                    self.fetch_period(config, request, &key, level, *period).await
                }
                None => Err(HarmonizeError::Capability {
                    provider: PROVIDER,
                    level,
                    period: *period,
                }),
            };
            outcomes.push((*period, outcome));
        }
        outcomes
    }

    async fn acknowledge(&self, config: &AdapterConfig, period: TimePeriod) -> Result<()> {
        self.store.clear(&config.id, period)
    }
}
