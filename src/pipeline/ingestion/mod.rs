// Pipeline ingestion: provider clients, rate limiting, retries, and source adapters

pub mod adapters;
pub mod client;
pub mod rate_limiter;
pub mod retry;

pub use adapters::{AdapterSet, FetchContext, PeriodOutcome, SourceAdapter};
pub use client::{ProviderClient, ProviderClients};
pub use rate_limiter::{Limits, RateLimiter};
pub use retry::RetryPolicy;
