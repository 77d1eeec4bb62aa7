// Provider payload readers
pub mod census;
pub mod fred;
pub mod ipums;
pub mod nhgis;

pub use census::CensusNormalizer;
pub use fred::FredNormalizer;
pub use ipums::IpumsNormalizer;
pub use nhgis::NhgisNormalizer;

use super::RawRow;
use crate::error::Result;
use crate::registry::AdapterConfig;
use crate::types::FetchedPayload;

/// Turns one provider payload into raw rows. Implementations validate the
/// payload shape and report violations as schema errors.
pub trait SourceNormalizer: Send + Sync {
    fn read(&self, config: &AdapterConfig, payload: &FetchedPayload) -> Result<Vec<RawRow>>;
}

/// Parse a provider cell; blanks and non-numbers read as null.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }
    trimmed
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_blanks_and_markers() {
        assert_eq!(parse_number(" 1,234.5 "), Some(1234.5));
        assert_eq!(parse_number("."), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("N/A"), None);
        assert_eq!(parse_number("NaN"), None);
    }
}
