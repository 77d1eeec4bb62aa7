//! Derived-metric calculation.

use crate::registry::{AdapterConfig, DerivedSpec};
use crate::types::{CanonicalRecord, FieldValue};

/// `numerator / denominator` when both are present and the denominator is
/// positive; `None` otherwise. Never produces zero for missing inputs, and
/// never infinity or NaN.
pub fn derive(record: &CanonicalRecord, numerator_field: &str, denominator_field: &str) -> Option<f64> {
    let numerator = record.value(numerator_field)?;
    let denominator = record.value(denominator_field)?;
    if denominator > 0.0 {
        Some(numerator / denominator).filter(|v| v.is_finite())
    } else {
        None
    }
}

/// `(sum(numerator) - sum(less)) / denominator` under the same rules as
/// [`derive`]: any missing input yields `None`.
pub fn derive_rule(record: &CanonicalRecord, rule: &DerivedSpec) -> Option<f64> {
    if let ([numerator], []) = (rule.numerator.as_slice(), rule.less.as_slice()) {
        return derive(record, numerator, &rule.denominator);
    }
    let sum = |columns: &[String]| -> Option<f64> {
        columns.iter().map(|c| record.value(c)).sum::<Option<f64>>()
    };
    let numerator = sum(&rule.numerator)? - sum(&rule.less)?;
    let denominator = record.value(&rule.denominator)?;
    if denominator > 0.0 {
        Some(numerator / denominator).filter(|v| v.is_finite())
    } else {
        None
    }
}

/// Fill every configured derived column of every record.
pub fn apply(config: &AdapterConfig, records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
    if config.derived.is_empty() {
        return records;
    }
    records
        .into_iter()
        .map(|record| {
            let derived = config
                .derived
                .iter()
                .map(|rule| FieldValue::new(rule.column.clone(), derive_rule(&record, rule)))
                .collect();
            record.with_derived(derived)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AdapterRegistry;
    use crate::types::{GeographyId, MetricFamily, Provenance, Provider, TimePeriod};
    use chrono::Utc;
    use uuid::Uuid;

    fn record(numerator: Option<f64>, denominator: Option<f64>) -> CanonicalRecord {
        CanonicalRecord {
            metric_family: MetricFamily::new("poverty").unwrap(),
            geography_id: GeographyId::new("36"),
            geography_name: "New York".into(),
            time_period: TimePeriod(2018),
            values: vec![
                FieldValue::new("below_poverty", numerator),
                FieldValue::new("universe", denominator),
            ],
            derived: Vec::new(),
            provenance: Provenance {
                provider: Provider::CensusAcs,
                adapter: "acs5_poverty".into(),
                query: "q".into(),
                query_id: "id".into(),
                fetched_at: Utc::now(),
                run_id: Uuid::nil(),
            },
        }
    }

    #[test]
    fn ratio_of_present_inputs() {
        let r = record(Some(150_000.0), Some(1_000_000.0));
        assert_eq!(derive(&r, "below_poverty", "universe"), Some(0.15));
    }

    #[test]
    fn missing_or_non_positive_denominators_yield_null() {
        for (num, den) in [
            (None, Some(1_000_000.0)),
            (Some(1.0), None),
            (Some(1.0), Some(0.0)),
            (Some(0.0), Some(0.0)),
            (Some(1.0), Some(-5.0)),
        ] {
            assert_eq!(derive(&record(num, den), "below_poverty", "universe"), None);
        }
    }

    #[test]
    fn zero_numerator_is_a_real_zero() {
        assert_eq!(derive(&record(Some(0.0), Some(10.0)), "below_poverty", "universe"), Some(0.0));
    }

    #[test]
    fn same_inputs_same_output() {
        let r = record(Some(1.0), Some(3.0));
        assert_eq!(
            derive(&r, "below_poverty", "universe"),
            derive(&r.clone(), "below_poverty", "universe")
        );
    }

    fn language(values: &[(&str, Option<f64>)]) -> CanonicalRecord {
        let mut r = record(None, None);
        r.metric_family = MetricFamily::new("language").unwrap();
        r.values = values.iter().map(|(c, v)| FieldValue::new(*c, *v)).collect();
        r
    }

    #[test]
    fn summed_numerators_and_subtracted_terms() {
        let config = AdapterRegistry::builtin().unwrap().get("acs5_language").cloned().unwrap();
        let r = language(&[
            ("total_population_5plus", Some(1000.0)),
            ("speaks_english_only", Some(400.0)),
            ("spanish_english_very_well", Some(300.0)),
            ("spanish_english_well", Some(100.0)),
            ("spanish_english_not_well", Some(150.0)),
            ("spanish_english_not_at_all", Some(50.0)),
        ]);
        let derived = apply(&config, vec![r]).remove(0);
        assert_eq!(derived.derived("english_only_rate"), Some(0.4));
        assert_eq!(derived.derived("spanish_speaking_rate"), Some(0.6));
        assert_eq!(derived.derived("limited_english_rate"), Some(0.2));
        assert_eq!(derived.derived_value(), Some(0.4));

        let rule = DerivedSpec {
            column: "moved_rate".into(),
            numerator: vec!["total_population_5plus".into()],
            less: vec!["speaks_english_only".into()],
            denominator: "total_population_5plus".into(),
        };
        assert_eq!(derive_rule(&derived, &rule), Some(0.6));
    }

    #[test]
    fn any_missing_term_nulls_the_rule() {
        let config = AdapterRegistry::builtin().unwrap().get("acs5_language").cloned().unwrap();
        let r = language(&[
            ("total_population_5plus", Some(1000.0)),
            ("speaks_english_only", Some(400.0)),
            ("spanish_english_very_well", Some(300.0)),
            ("spanish_english_well", None),
            ("spanish_english_not_well", Some(150.0)),
            ("spanish_english_not_at_all", Some(50.0)),
        ]);
        let derived = apply(&config, vec![r]).remove(0);
        assert_eq!(derived.derived.len(), 3);
        assert_eq!(derived.derived("english_only_rate"), Some(0.4));
        assert_eq!(derived.derived("spanish_speaking_rate"), None);
        assert_eq!(derived.derived("limited_english_rate"), Some(0.2));
    }
}
