//! Pipeline metrics.
//!
//! Every stage records through the `metrics` facade. Nothing is exported unless
//! [`init_metrics`] is given a listen address, in which case a Prometheus
//! scrape endpoint is started.

use crate::types::{MetricFamily, Provider};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Install the Prometheus exporter. Idempotent; must run inside a Tokio runtime.
pub fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else {
        return;
    };
    INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => warn!("Failed to install Prometheus exporter on {}: {}", addr, e),
        }
    });
}

pub mod fetch {
    use super::*;

    pub fn request_sent(provider: Provider) {
        counter!("harmonizer_requests_total", "provider" => provider.as_str()).increment(1);
    }

    pub fn retry(provider: Provider) {
        counter!("harmonizer_request_retries_total", "provider" => provider.as_str()).increment(1);
    }

    pub fn request_duration(provider: Provider, secs: f64) {
        histogram!("harmonizer_request_duration_seconds", "provider" => provider.as_str()).record(secs);
    }

    pub fn period_succeeded(provider: Provider) {
        counter!("harmonizer_periods_fetched_total", "provider" => provider.as_str()).increment(1);
    }

    pub fn period_failed(provider: Provider, kind: &'static str) {
        counter!(
            "harmonizer_period_failures_total",
            "provider" => provider.as_str(),
            "kind" => kind
        )
        .increment(1);
    }
}

pub mod normalize {
    use super::*;

    pub fn geography_skipped(provider: Provider) {
        counter!("harmonizer_geographies_skipped_total", "provider" => provider.as_str()).increment(1);
    }
}

pub mod storage {
    use super::*;

    pub fn rows_written(family: &MetricFamily, inserted: usize, replaced: usize) {
        counter!("harmonizer_rows_inserted_total", "family" => family.to_string()).increment(inserted as u64);
        counter!("harmonizer_rows_replaced_total", "family" => family.to_string()).increment(replaced as u64);
    }

    pub fn write_failed() {
        counter!("harmonizer_table_write_failures_total").increment(1);
    }
}

pub fn run_duration(secs: f64) {
    histogram!("harmonizer_run_duration_seconds").record(secs);
}
