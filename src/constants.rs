//! Provider endpoints and storage naming shared across the pipeline.

// Provider base URLs
pub const CENSUS_BASE_URL: &str = "https://api.census.gov/data";
pub const FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred";
pub const IPUMS_BASE_URL: &str = "https://api.ipums.org";

// IPUMS API version pinned for extract requests
pub const IPUMS_API_VERSION: u32 = 2;

/// Census annotation values reported in place of an estimate
/// (medians out of range, too few sample cases, not applicable).
pub const CENSUS_SENTINELS: [f64; 6] = [
    -666_666_666.0,
    -999_999_999.0,
    -888_888_888.0,
    -555_555_555.0,
    -333_333_333.0,
    -222_222_222.0,
];

// Storage layout
pub const COMBINED_DIR: &str = "combined";
pub const EXTRACTS_DIR: &str = ".extracts";
pub const SCHEMA_SUFFIX: &str = ".schema.json";

// Fixed table columns, in file order around the per-family value columns
pub const COL_GEOGRAPHY_NAME: &str = "geography_name";
pub const COL_GEOGRAPHY_ID: &str = "geography_id";
pub const COL_TIME_PERIOD: &str = "time_period";
pub const COL_METRIC_FAMILY: &str = "metric_family";
pub const COL_PROVIDER: &str = "provider";
pub const COL_ADAPTER: &str = "adapter";
pub const COL_QUERY: &str = "query";
pub const COL_QUERY_ID: &str = "query_id";
pub const COL_FETCHED_AT: &str = "fetched_at";
pub const COL_RUN_ID: &str = "run_id";

pub const PROVENANCE_COLUMNS: [&str; 7] = [
    COL_METRIC_FAMILY,
    COL_PROVIDER,
    COL_ADAPTER,
    COL_QUERY,
    COL_QUERY_ID,
    COL_FETCHED_AT,
    COL_RUN_ID,
];

/// Column names that can never be used for provider values.
pub fn is_reserved_column(name: &str) -> bool {
    name == COL_GEOGRAPHY_NAME
        || name == COL_GEOGRAPHY_ID
        || name == COL_TIME_PERIOD
        || PROVENANCE_COLUMNS.contains(&name)
}
