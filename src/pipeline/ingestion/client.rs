use super::rate_limiter::{Limits, RateLimiter};
use super::retry::{with_backoff, RetryPolicy};
use crate::app::ports::{HttpClientPort, HttpRequest, HttpResponse};
use crate::error::{HarmonizeError, Result};
use crate::idempotency::redact_query;
use crate::metrics;
use crate::types::Provider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Statuses worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

/// Provider-aware wrapper around the HTTP port: every request is rate
/// limited, transport failures and retryable statuses become
/// [`HarmonizeError::Transient`] and are retried with backoff.
#[derive(Clone)]
pub struct ProviderClient {
    http: Arc<dyn HttpClientPort>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(http: Arc<dyn HttpClientPort>, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self { http, limiter, retry }
    }

    /// Send once per attempt. Non-retryable statuses are returned to the
    /// caller as responses so each adapter can map them.
    pub async fn send(&self, provider: Provider, request: HttpRequest) -> Result<HttpResponse> {
        with_backoff(&self.retry, provider, || self.attempt(provider, request.clone())).await
    }

    async fn attempt(&self, provider: Provider, request: HttpRequest) -> Result<HttpResponse> {
        let _permit = self.limiter.acquire().await;
        let url = redact_query(&request.url);
        debug!("{} {:?} {}", provider, request.method, url);

        metrics::fetch::request_sent(provider);
        let started = Instant::now();
        let outcome = self.http.send(request).await;
        metrics::fetch::request_duration(provider, started.elapsed().as_secs_f64());

        let response = outcome
            .map_err(|e| HarmonizeError::transient(provider, format!("{url}: {}", redact_query(&e))))?;
        if is_retryable_status(response.status) {
            return Err(HarmonizeError::transient(
                provider,
                format!("{url} returned HTTP {}", response.status),
            ));
        }
        Ok(response)
    }

    /// Like [`send`](Self::send) but maps the remaining statuses: 204/404 to
    /// NotFound and any other non-success to a provider error.
    pub async fn send_expecting_data(
        &self,
        provider: Provider,
        request: HttpRequest,
        key: &str,
    ) -> Result<HttpResponse> {
        let response = self.send(provider, request).await?;
        check_status(provider, response, key)
    }
}

/// One [`ProviderClient`] per upstream service. Each service has its own
/// limiter, so a slow or throttled provider never holds slots another
/// provider's requests are waiting for. Providers served by the same
/// service share its client.
#[derive(Clone)]
pub struct ProviderClients {
    clients: HashMap<&'static str, ProviderClient>,
}

impl ProviderClients {
    pub fn new<F>(http: Arc<dyn HttpClientPort>, retry: RetryPolicy, limits_for: F) -> Self
    where
        F: Fn(&str) -> Limits,
    {
        let mut clients = HashMap::new();
        for provider in Provider::ALL {
            let service = provider.service();
            clients.entry(service).or_insert_with(|| {
                ProviderClient::new(http.clone(), RateLimiter::new(limits_for(service)), retry.clone())
            });
        }
        Self { clients }
    }

    pub fn get(&self, provider: Provider) -> Result<&ProviderClient> {
        self.clients.get(provider.service()).ok_or_else(|| {
            HarmonizeError::Config(format!("no HTTP client configured for {}", provider.service()))
        })
    }

    /// Send through the client of `provider`'s service.
    pub async fn send(&self, provider: Provider, request: HttpRequest) -> Result<HttpResponse> {
        self.get(provider)?.send(provider, request).await
    }

    pub async fn send_expecting_data(
        &self,
        provider: Provider,
        request: HttpRequest,
        key: &str,
    ) -> Result<HttpResponse> {
        self.get(provider)?.send_expecting_data(provider, request, key).await
    }
}

pub fn check_status(provider: Provider, response: HttpResponse, key: &str) -> Result<HttpResponse> {
    match response.status {
        204 | 404 => Err(HarmonizeError::NotFound {
            provider,
            key: key.to_string(),
        }),
        _ if response.is_success() => Ok(response),
        status => Err(HarmonizeError::Provider {
            provider,
            status,
            message: truncate(&response.text(), 300),
        }),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
