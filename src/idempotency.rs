use crate::types::{GeographyLevel, Provider, TimePeriod};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static SECRET_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(key|api_key)=[^&\s)'"]*"#).expect("static regex")
});

/// Strip credentials from a request URL, or any text quoting one, before it
/// is logged or persisted.
pub fn redact_query(url: &str) -> String {
    SECRET_PARAM.replace_all(url, "$1=REDACTED").into_owned()
}

/// Stable identity of one provider query. Re-running the same request yields
/// the same id, so it doubles as the deterministic tie-breaker in combine.
pub fn compute_query_id(
    provider: Provider,
    adapter: &str,
    level: GeographyLevel,
    period: TimePeriod,
    redacted_query: &str,
) -> String {
    let mut s = String::new();
    s.push_str(provider.as_str());
    s.push('|');
    s.push_str(adapter);
    s.push('|');
    s.push_str(level.as_str());
    s.push('|');
    s.push_str(&period.to_string());
    s.push('|');
    s.push_str(redacted_query);

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}
