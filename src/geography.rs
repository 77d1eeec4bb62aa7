//! Fixed lookup table of state-level place encodings.
//!
//! Providers identify places differently: Census returns zero-padded FIPS
//! strings, IPUMS returns `STATEFIP` as a bare integer, FRED series are keyed by
//! USPS abbreviation, and hand-assembled sources use full names. Every one of
//! those resolves to the same [`GeographyId`] here; anything else is an
//! [`HarmonizeError::UnknownGeography`].

use crate::error::{HarmonizeError, Result};
use crate::types::GeographyId;
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub fips: &'static str,
    pub name: &'static str,
    pub abbreviation: &'static str,
}

impl State {
    pub fn id(&self) -> GeographyId {
        GeographyId::new(self.fips)
    }
}

pub const STATES: [State; 52] = [
    State { fips: "01", name: "Alabama", abbreviation: "AL" },
    State { fips: "02", name: "Alaska", abbreviation: "AK" },
    State { fips: "04", name: "Arizona", abbreviation: "AZ" },
    State { fips: "05", name: "Arkansas", abbreviation: "AR" },
    State { fips: "06", name: "California", abbreviation: "CA" },
    State { fips: "08", name: "Colorado", abbreviation: "CO" },
    State { fips: "09", name: "Connecticut", abbreviation: "CT" },
    State { fips: "10", name: "Delaware", abbreviation: "DE" },
    State { fips: "11", name: "District of Columbia", abbreviation: "DC" },
    State { fips: "12", name: "Florida", abbreviation: "FL" },
    State { fips: "13", name: "Georgia", abbreviation: "GA" },
    State { fips: "15", name: "Hawaii", abbreviation: "HI" },
    State { fips: "16", name: "Idaho", abbreviation: "ID" },
    State { fips: "17", name: "Illinois", abbreviation: "IL" },
    State { fips: "18", name: "Indiana", abbreviation: "IN" },
    State { fips: "19", name: "Iowa", abbreviation: "IA" },
    State { fips: "20", name: "Kansas", abbreviation: "KS" },
    State { fips: "21", name: "Kentucky", abbreviation: "KY" },
    State { fips: "22", name: "Louisiana", abbreviation: "LA" },
    State { fips: "23", name: "Maine", abbreviation: "ME" },
    State { fips: "24", name: "Maryland", abbreviation: "MD" },
    State { fips: "25", name: "Massachusetts", abbreviation: "MA" },
    State { fips: "26", name: "Michigan", abbreviation: "MI" },
    State { fips: "27", name: "Minnesota", abbreviation: "MN" },
    State { fips: "28", name: "Mississippi", abbreviation: "MS" },
    State { fips: "29", name: "Missouri", abbreviation: "MO" },
    State { fips: "30", name: "Montana", abbreviation: "MT" },
    State { fips: "31", name: "Nebraska", abbreviation: "NE" },
    State { fips: "32", name: "Nevada", abbreviation: "NV" },
    State { fips: "33", name: "New Hampshire", abbreviation: "NH" },
    State { fips: "34", name: "New Jersey", abbreviation: "NJ" },
    State { fips: "35", name: "New Mexico", abbreviation: "NM" },
    State { fips: "36", name: "New York", abbreviation: "NY" },
    State { fips: "37", name: "North Carolina", abbreviation: "NC" },
    State { fips: "38", name: "North Dakota", abbreviation: "ND" },
    State { fips: "39", name: "Ohio", abbreviation: "OH" },
    State { fips: "40", name: "Oklahoma", abbreviation: "OK" },
    State { fips: "41", name: "Oregon", abbreviation: "OR" },
    State { fips: "42", name: "Pennsylvania", abbreviation: "PA" },
    State { fips: "44", name: "Rhode Island", abbreviation: "RI" },
    State { fips: "45", name: "South Carolina", abbreviation: "SC" },
    State { fips: "46", name: "South Dakota", abbreviation: "SD" },
    State { fips: "47", name: "Tennessee", abbreviation: "TN" },
    State { fips: "48", name: "Texas", abbreviation: "TX" },
    State { fips: "49", name: "Utah", abbreviation: "UT" },
    State { fips: "50", name: "Vermont", abbreviation: "VT" },
    State { fips: "51", name: "Virginia", abbreviation: "VA" },
    State { fips: "53", name: "Washington", abbreviation: "WA" },
    State { fips: "54", name: "West Virginia", abbreviation: "WV" },
    State { fips: "55", name: "Wisconsin", abbreviation: "WI" },
    State { fips: "56", name: "Wyoming", abbreviation: "WY" },
    State { fips: "72", name: "Puerto Rico", abbreviation: "PR" },
];

// Keys are upper-cased so names and abbreviations match case-insensitively.
static BY_ENCODING: Lazy<HashMap<String, &'static State>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for state in STATES.iter() {
        map.insert(state.fips.to_string(), state);
        map.insert(state.name.to_ascii_uppercase(), state);
        map.insert(state.abbreviation.to_string(), state);
    }
    map
});

/// Resolve any known state encoding: `"36"`, `"6"`, `"New York"`, `"ny"`.
pub fn resolve_state(encoding: &str) -> Result<&'static State> {
    let trimmed = encoding.trim();
    let key = if !trimmed.is_empty() && trimmed.len() <= 2 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("{trimmed:0>2}")
    } else {
        trimmed.to_ascii_uppercase()
    };
    BY_ENCODING
        .get(&key)
        .copied()
        .ok_or_else(|| HarmonizeError::UnknownGeography {
            encoding: encoding.to_string(),
        })
}

/// Resolve a county from its state encoding and 3-digit county code.
pub fn resolve_county(state_encoding: &str, county_code: &str) -> Result<(&'static State, GeographyId)> {
    let state = resolve_state(state_encoding)?;
    let code = county_code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(HarmonizeError::UnknownGeography {
            encoding: format!("{state_encoding}:{county_code}"),
        });
    }
    Ok((state, GeographyId::new(format!("{}{}", state.fips, code))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_encoding_in_the_table_resolves_to_its_fips() {
        for state in STATES.iter() {
            let unpadded = state.fips.trim_start_matches('0');
            for encoding in [
                state.fips.to_string(),
                unpadded.to_string(),
                state.name.to_string(),
                state.name.to_lowercase(),
                state.abbreviation.to_string(),
                state.abbreviation.to_lowercase(),
            ] {
                let resolved = resolve_state(&encoding).unwrap();
                assert_eq!(resolved.fips, state.fips, "encoding {encoding}");
            }
        }
    }

    #[test]
    fn encodings_outside_the_table_are_rejected() {
        for encoding in ["03", "99", "", "Atlantis", "XX", "100", "New  York"] {
            let err = resolve_state(encoding).unwrap_err();
            assert!(
                matches!(err, HarmonizeError::UnknownGeography { .. }),
                "encoding {encoding:?}"
            );
        }
    }

    #[test]
    fn counties_combine_state_fips_with_county_code() {
        let (state, id) = resolve_county("36", "061").unwrap();
        assert_eq!(state.name, "New York");
        assert_eq!(id.as_str(), "36061");

        assert!(resolve_county("36", "61").is_err());
        assert!(resolve_county("98", "001").is_err());
    }
}
