// Pipeline processing: normalization and derived metrics

pub mod derive;
pub mod normalize;

pub use normalize::{GeographyPolicy, Normalized, RecordNormalizer};
