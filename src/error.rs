use crate::types::{GeographyLevel, Provider, TimePeriod};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarmonizeError {
    #[error("{provider} does not serve {level}-level data for {period}")]
    Capability {
        provider: Provider,
        level: GeographyLevel,
        period: TimePeriod,
    },

    #[error("transient failure from {provider}: {message}")]
    Transient { provider: Provider, message: String },

    #[error("{provider} has no data for {key}")]
    NotFound { provider: Provider, key: String },

    #[error("unexpected payload from {provider}: {message}")]
    Schema { provider: Provider, message: String },

    #[error("unknown geography encoding '{encoding}'")]
    UnknownGeography { encoding: String },

    #[error("{provider} responded with HTTP {status}: {message}")]
    Provider {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("{provider} extract {number} failed: {reason}")]
    ExtractFailed {
        provider: Provider,
        number: u64,
        reason: String,
    },

    #[error("table {table}: {message}")]
    TableSchema { table: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarmonizeError {
    /// Only transient failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, HarmonizeError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HarmonizeError::NotFound { .. })
    }

    /// Short label used for metrics and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            HarmonizeError::Capability { .. } => "capability",
            HarmonizeError::Transient { .. } => "transient",
            HarmonizeError::NotFound { .. } => "not_found",
            HarmonizeError::Schema { .. } => "schema",
            HarmonizeError::UnknownGeography { .. } => "unknown_geography",
            HarmonizeError::Provider { .. } => "provider",
            HarmonizeError::ExtractFailed { .. } => "extract_failed",
            HarmonizeError::TableSchema { .. } => "table_schema",
            HarmonizeError::Config(_) => "config",
            HarmonizeError::Io(_) => "io",
            HarmonizeError::Json(_) => "json",
            HarmonizeError::Csv(_) => "csv",
            HarmonizeError::Toml(_) => "toml",
        }
    }

    pub(crate) fn schema(provider: Provider, message: impl Into<String>) -> Self {
        HarmonizeError::Schema {
            provider,
            message: message.into(),
        }
    }

    /// Copy of this error for another period served by the same batched
    /// request. Wrapped library errors are carried over by message.
    pub(crate) fn replicate(&self, provider: Provider) -> Self {
        match self {
            HarmonizeError::Capability { provider, level, period } => HarmonizeError::Capability {
                provider: *provider,
                level: *level,
                period: *period,
            },
            HarmonizeError::Transient { provider, message } => HarmonizeError::transient(*provider, message.clone()),
            HarmonizeError::Schema { provider, message } => HarmonizeError::schema(*provider, message.clone()),
            HarmonizeError::NotFound { provider, key } => HarmonizeError::NotFound {
                provider: *provider,
                key: key.clone(),
            },
            HarmonizeError::Provider { provider, status, message } => HarmonizeError::Provider {
                provider: *provider,
                status: *status,
                message: message.clone(),
            },
            HarmonizeError::ExtractFailed { provider, number, reason } => HarmonizeError::ExtractFailed {
                provider: *provider,
                number: *number,
                reason: reason.clone(),
            },
            HarmonizeError::UnknownGeography { encoding } => HarmonizeError::UnknownGeography {
                encoding: encoding.clone(),
            },
            HarmonizeError::TableSchema { table, message } => HarmonizeError::TableSchema {
                table: table.clone(),
                message: message.clone(),
            },
            HarmonizeError::Config(message) => HarmonizeError::Config(message.clone()),
            HarmonizeError::Io(e) => HarmonizeError::Io(std::io::Error::new(e.kind(), e.to_string())),
            other => HarmonizeError::schema(provider, other.to_string()),
        }
    }

    pub(crate) fn transient(provider: Provider, message: impl Into<String>) -> Self {
        HarmonizeError::Transient {
            provider,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarmonizeError>;
