//! Query descriptor parsing and serialization.
//!
//! The host embeds a compact descriptor in each dataset definition:
//!
//! ```text
//! dx=FTRrcoaog83;105-EP01c.%20Malaria%20(B%2Fs)&pe=LAST_3_YEARS;2020&ou=ImspTQPwCqd&ouMode=CHILDREN&table=analytics
//! ```
//!
//! Keys are separated by `&`, values within a key by `;`. Segments are
//! percent-decoded after splitting, so labels containing `;`, `&` or `=`
//! survive a round trip through [`QueryDescriptor::to_query_string`].
//!
//! | Key | Required | Meaning |
//! |-----|----------|---------|
//! | `dx` | yes | indicators / data elements |
//! | `pe` | yes | period expressions (see [`crate::period`]) |
//! | `ou` | yes | organisation unit ids |
//! | `ouMode` | no | `SELECTED` (default), `CHILDREN`, `DESCENDANTS`, `ALL` |
//! | `table` | no | `analytics` (default), `dataValueSets`, `events` |
//! | `program` | for `events` | tracker program id |
//!
//! Unknown keys are ignored. A missing or empty required key fails with
//! [`BridgeError::EmptyDimension`]; a partial query is never produced.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::models::{Dimension, EndpointFamily, OrgUnitMode};
use crate::period::PeriodExpr;

/// Default value of the `table` key.
pub const DEFAULT_TABLE: &str = "analytics";

/// A parsed, validated query descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub indicators: Vec<String>,
    pub periods: Vec<PeriodExpr>,
    pub org_units: Vec<String>,
    pub org_unit_mode: OrgUnitMode,
    pub target_table: String,
    pub program: Option<String>,
}

impl QueryDescriptor {
    /// Endpoint family addressed by `target_table`.
    pub fn endpoint(&self) -> EndpointFamily {
        EndpointFamily::for_table(&self.target_table).unwrap_or(EndpointFamily::Analytics)
    }

    /// Serialize back into descriptor form.
    ///
    /// `parse(d.to_query_string()) == d` for every valid descriptor.
    pub fn to_query_string(&self) -> String {
        let mut parts = vec![
            format!("dx={}", join_encoded(self.indicators.iter().cloned())),
            format!("pe={}", join_encoded(self.periods.iter().map(|p| p.to_string()))),
            format!("ou={}", join_encoded(self.org_units.iter().cloned())),
            format!("ouMode={}", self.org_unit_mode.as_str()),
            format!("table={}", urlencoding::encode(&self.target_table)),
        ];
        if let Some(ref program) = self.program {
            parts.push(format!("program={}", urlencoding::encode(program)));
        }
        parts.join("&")
    }

    /// One-line summary for logs and error context.
    pub fn summary(&self) -> String {
        format!(
            "table={} dx={} pe={} ou={} ouMode={}",
            self.target_table,
            self.indicators.len(),
            self.periods
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(";"),
            self.org_units.len(),
            self.org_unit_mode.as_str()
        )
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_string())
    }
}

impl FromStr for QueryDescriptor {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl Serialize for QueryDescriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_query_string())
    }
}

impl<'de> Deserialize<'de> for QueryDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a raw descriptor string.
///
/// # Errors
///
/// - [`BridgeError::EmptyDimension`] if `dx`, `pe` or `ou` is missing or
///   has no non-empty values (checked in that order).
/// - [`BridgeError::InvalidPeriodExpression`] for a bad `pe` value.
/// - [`BridgeError::InvalidDescriptor`] for undecodable segments, an
///   unknown `ouMode` or `table`, or `table=events` without `program`.
pub fn parse(raw: &str) -> Result<QueryDescriptor, BridgeError> {
    let raw = raw.trim().trim_start_matches('?');

    let mut indicators: Vec<String> = Vec::new();
    let mut periods: Vec<String> = Vec::new();
    let mut org_units: Vec<String> = Vec::new();
    let mut org_unit_mode = OrgUnitMode::default();
    let mut target_table = DEFAULT_TABLE.to_string();
    let mut program = None;

    for segment in raw.split('&').filter(|s| !s.trim().is_empty()) {
        let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
        let key = decode(key)?;

        match key.trim() {
            "dx" => extend_unique(&mut indicators, split_values(value)?),
            "pe" => extend_unique(&mut periods, split_values(value)?),
            "ou" => extend_unique(&mut org_units, split_values(value)?),
            "ouMode" => {
                let mode = decode(value)?;
                org_unit_mode =
                    OrgUnitMode::parse(&mode).ok_or_else(|| BridgeError::InvalidDescriptor {
                        message: format!("unknown ouMode '{}'", mode),
                    })?;
            }
            "table" => {
                let table = decode(value)?.trim().to_string();
                if !table.is_empty() {
                    if EndpointFamily::for_table(&table).is_none() {
                        return Err(BridgeError::InvalidDescriptor {
                            message: format!("unknown table '{}'", table),
                        });
                    }
                    target_table = table;
                }
            }
            "program" => {
                let p = decode(value)?.trim().to_string();
                program = (!p.is_empty()).then_some(p);
            }
            _ => {}
        }
    }

    if indicators.is_empty() {
        return Err(BridgeError::EmptyDimension {
            which: Dimension::Indicators,
        });
    }
    if periods.is_empty() {
        return Err(BridgeError::EmptyDimension {
            which: Dimension::Periods,
        });
    }
    if org_units.is_empty() {
        return Err(BridgeError::EmptyDimension {
            which: Dimension::OrgUnits,
        });
    }

    let mut parsed_periods: Vec<PeriodExpr> = Vec::with_capacity(periods.len());
    for p in &periods {
        let expr: PeriodExpr = p.parse()?;
        if !parsed_periods.contains(&expr) {
            parsed_periods.push(expr);
        }
    }

    if target_table == "events" && program.is_none() {
        return Err(BridgeError::InvalidDescriptor {
            message: "table=events requires a 'program' key".to_string(),
        });
    }

    Ok(QueryDescriptor {
        indicators,
        periods: parsed_periods,
        org_units,
        org_unit_mode,
        target_table,
        program,
    })
}

fn join_encoded(values: impl Iterator<Item = String>) -> String {
    values
        .map(|v| urlencoding::encode(&v).into_owned())
        .collect::<Vec<_>>()
        .join(";")
}

fn decode(s: &str) -> Result<String, BridgeError> {
    urlencoding::decode(s)
        .map(|v| v.into_owned())
        .map_err(|e| BridgeError::InvalidDescriptor {
            message: format!("segment '{}' is not valid percent-encoded UTF-8: {}", s, e),
        })
}

fn split_values(value: &str) -> Result<Vec<String>, BridgeError> {
    let mut out = Vec::new();
    for part in value.split(';') {
        let decoded = decode(part)?;
        let trimmed = decoded.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

fn extend_unique(target: &mut Vec<String>, values: Vec<String>) {
    for v in values {
        if !target.contains(&v) {
            target.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Period;

    #[test]
    fn test_parse_full_descriptor() {
        let d = parse("dx=a;b&pe=LAST_3_YEARS;2020&ou=X;Y&ouMode=CHILDREN&table=dataValueSets")
            .unwrap();
        assert_eq!(d.indicators, vec!["a", "b"]);
        assert_eq!(d.periods.len(), 2);
        assert_eq!(d.periods[1], PeriodExpr::Fixed(Period::Year(2020)));
        assert_eq!(d.org_units, vec!["X", "Y"]);
        assert_eq!(d.org_unit_mode, OrgUnitMode::Children);
        assert_eq!(d.target_table, "dataValueSets");
        assert_eq!(d.endpoint(), EndpointFamily::DataValueSets);
    }

    #[test]
    fn test_defaults() {
        let d = parse("dx=a&pe=2024&ou=X").unwrap();
        assert_eq!(d.org_unit_mode, OrgUnitMode::Selected);
        assert_eq!(d.target_table, "analytics");
        assert_eq!(d.program, None);
    }

    #[test]
    fn test_key_order_insensitive_value_order_preserved() {
        let a = parse("ou=X&pe=2024&dx=b;a").unwrap();
        let b = parse("dx=b;a&ou=X&pe=2024").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.indicators, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let d = parse("dx=a&pe=2024&ou=X&displayProperty=SHORTNAME&future=1").unwrap();
        assert_eq!(d.indicators, vec!["a"]);
    }

    #[test]
    fn test_missing_dimension_reported_by_key() {
        assert_eq!(
            parse("pe=2024&ou=X").unwrap_err(),
            BridgeError::EmptyDimension {
                which: Dimension::Indicators
            }
        );
        assert_eq!(
            parse("dx=a&ou=X").unwrap_err(),
            BridgeError::EmptyDimension {
                which: Dimension::Periods
            }
        );
        assert_eq!(
            parse("dx=a&pe=2024&ou=").unwrap_err(),
            BridgeError::EmptyDimension {
                which: Dimension::OrgUnits
            }
        );
        assert_eq!(
            parse("dx=;;&pe=2024&ou=X").unwrap_err(),
            BridgeError::EmptyDimension {
                which: Dimension::Indicators
            }
        );
        assert_eq!(
            parse("").unwrap_err(),
            BridgeError::EmptyDimension {
                which: Dimension::Indicators
            }
        );
    }

    #[test]
    fn test_bad_period_fails_parse() {
        let err = parse("dx=a&pe=NEXT_DECADE&ou=X").unwrap_err();
        assert_eq!(
            err,
            BridgeError::InvalidPeriodExpression {
                expr: "NEXT_DECADE".to_string()
            }
        );
    }

    #[test]
    fn test_bad_mode_and_table() {
        assert!(matches!(
            parse("dx=a&pe=2024&ou=X&ouMode=SIBLINGS"),
            Err(BridgeError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            parse("dx=a&pe=2024&ou=X&table=geoFeatures"),
            Err(BridgeError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            parse("dx=a&pe=2024&ou=X&table=events"),
            Err(BridgeError::InvalidDescriptor { .. })
        ));
        assert!(parse("dx=a&pe=2024&ou=X&table=events&program=IpHINAT79UW").is_ok());
    }

    #[test]
    fn test_percent_decoding_of_labels() {
        let d = parse("dx=105-EP01c.%20Malaria%20(B%2Fs);a%3Bb&pe=2024&ou=X").unwrap();
        assert_eq!(d.indicators, vec!["105-EP01c. Malaria (B/s)", "a;b"]);
    }

    #[test]
    fn test_duplicates_collapse_in_first_seen_order() {
        let d = parse("dx=a;b;a&dx=c;b&pe=2024;2024&ou=X").unwrap();
        assert_eq!(d.indicators, vec!["a", "b", "c"]);
        assert_eq!(d.periods.len(), 1);
    }

    #[test]
    fn test_round_trip() {
        let originals = [
            "dx=a;b&pe=LAST_3_YEARS;2020&ou=X;Y&ouMode=CHILDREN&table=dataValueSets",
            "dx=105-EP01c.%20Malaria%20(B%2Fs);x%26y%3Dz&pe=202401;2024Q1&ou=O6uvpzGd5pu",
            "dx=a&pe=THIS_MONTH&ou=X&ouMode=ALL&table=events&program=IpHINAT79UW",
        ];
        for raw in originals {
            let d = parse(raw).unwrap();
            let again = parse(&d.to_query_string()).unwrap();
            assert_eq!(d, again, "round trip failed for {}", raw);
        }
    }

    #[test]
    fn test_serde_as_string() {
        let d = parse("dx=a&pe=2024&ou=X").unwrap();
        let json = serde_json::to_string(&d).unwrap();
        let back: QueryDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
