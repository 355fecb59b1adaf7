//! Period expressions and their resolution into concrete period codes.
//!
//! A [`PeriodExpr`] is either a fixed period code or a relative keyword.
//! Resolution is a pure function of the expression and a reference date;
//! nothing here reads the clock.
//!
//! # Fixed codes
//!
//! | Format | Example | Meaning |
//! |--------|---------|---------|
//! | `YYYY` | `2024` | calendar year |
//! | `YYYYMM` | `202403` | calendar month |
//! | `YYYYQn` | `2024Q2` | calendar quarter (n in 1..=4) |
//!
//! # Relative keywords (case-insensitive)
//!
//! | Keyword | Resolves to |
//! |---------|-------------|
//! | `THIS_YEAR` / `THIS_QUARTER` / `THIS_MONTH` | the period containing the reference date |
//! | `LAST_YEAR` / `LAST_QUARTER` / `LAST_MONTH` | the period before it |
//! | `LAST_<N>_YEARS` / `LAST_<N>_QUARTERS` / `LAST_<N>_MONTHS` | N trailing periods, ending at and including the current one |
//! | `QUARTERS_THIS_YEAR` / `MONTHS_THIS_YEAR` | this year's periods up to and including the current one |
//!
//! Expanded periods come out most recent first. Callers filter by set
//! membership and must not depend on that order.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::BridgeError;

/// Upper bound on `N` in `LAST_<N>_…` keywords.
pub const MAX_RELATIVE_COUNT: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
    Year,
    Quarter,
    Month,
}

impl PeriodUnit {
    fn singular(&self) -> &'static str {
        match self {
            PeriodUnit::Year => "YEAR",
            PeriodUnit::Quarter => "QUARTER",
            PeriodUnit::Month => "MONTH",
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            PeriodUnit::Year => "YEARS",
            PeriodUnit::Quarter => "QUARTERS",
            PeriodUnit::Month => "MONTHS",
        }
    }

    fn from_singular(s: &str) -> Option<Self> {
        match s {
            "YEAR" => Some(PeriodUnit::Year),
            "QUARTER" => Some(PeriodUnit::Quarter),
            "MONTH" => Some(PeriodUnit::Month),
            _ => None,
        }
    }

    fn from_plural(s: &str) -> Option<Self> {
        match s {
            "YEARS" => Some(PeriodUnit::Year),
            "QUARTERS" => Some(PeriodUnit::Quarter),
            "MONTHS" => Some(PeriodUnit::Month),
            _ => None,
        }
    }
}

/// A concrete calendar period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Year(i32),
    Quarter { year: i32, quarter: u32 },
    Month { year: i32, month: u32 },
}

impl Period {
    /// The period of the given unit that contains `date`.
    pub fn containing(unit: PeriodUnit, date: NaiveDate) -> Self {
        match unit {
            PeriodUnit::Year => Period::Year(date.year()),
            PeriodUnit::Quarter => Period::Quarter {
                year: date.year(),
                quarter: (date.month() - 1) / 3 + 1,
            },
            PeriodUnit::Month => Period::Month {
                year: date.year(),
                month: date.month(),
            },
        }
    }

    pub fn unit(&self) -> PeriodUnit {
        match self {
            Period::Year(_) => PeriodUnit::Year,
            Period::Quarter { .. } => PeriodUnit::Quarter,
            Period::Month { .. } => PeriodUnit::Month,
        }
    }

    /// The immediately preceding period of the same unit.
    pub fn previous(&self) -> Self {
        match *self {
            Period::Year(y) => Period::Year(y - 1),
            Period::Quarter { year, quarter: 1 } => Period::Quarter {
                year: year - 1,
                quarter: 4,
            },
            Period::Quarter { year, quarter } => Period::Quarter {
                year,
                quarter: quarter - 1,
            },
            Period::Month { year, month: 1 } => Period::Month {
                year: year - 1,
                month: 12,
            },
            Period::Month { year, month } => Period::Month {
                year,
                month: month - 1,
            },
        }
    }

    /// First day of the period.
    pub fn start(&self) -> Option<NaiveDate> {
        match *self {
            Period::Year(y) => NaiveDate::from_ymd_opt(y, 1, 1),
            Period::Quarter { year, quarter } => {
                NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)
            }
            Period::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1),
        }
    }

    /// Last day of the period.
    pub fn end(&self) -> Option<NaiveDate> {
        let next_start = match *self {
            Period::Year(y) => NaiveDate::from_ymd_opt(y + 1, 1, 1),
            Period::Quarter { year, quarter: 4 } => NaiveDate::from_ymd_opt(year + 1, 1, 1),
            Period::Quarter { year, quarter } => NaiveDate::from_ymd_opt(year, quarter * 3 + 1, 1),
            Period::Month { year, month: 12 } => NaiveDate::from_ymd_opt(year + 1, 1, 1),
            Period::Month { year, month } => NaiveDate::from_ymd_opt(year, month + 1, 1),
        };
        next_start.and_then(|d| d.pred_opt())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        Period::containing(self.unit(), date) == *self
    }

    /// Parse a fixed period code, validating its format.
    pub fn parse_code(code: &str) -> Option<Self> {
        let bytes = code.as_bytes();
        let all_digits = |s: &[u8]| !s.is_empty() && s.iter().all(u8::is_ascii_digit);

        match bytes.len() {
            4 if all_digits(bytes) => code.parse().ok().map(Period::Year),
            6 if all_digits(bytes) => {
                let year = code[..4].parse().ok()?;
                let month: u32 = code[4..].parse().ok()?;
                (1..=12)
                    .contains(&month)
                    .then_some(Period::Month { year, month })
            }
            6 if all_digits(&bytes[..4]) && bytes[4] == b'Q' && bytes[5].is_ascii_digit() => {
                let year = code[..4].parse().ok()?;
                let quarter = u32::from(bytes[5] - b'0');
                (1..=4)
                    .contains(&quarter)
                    .then_some(Period::Quarter { year, quarter })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year(y) => write!(f, "{:04}", y),
            Period::Quarter { year, quarter } => write!(f, "{:04}Q{}", year, quarter),
            Period::Month { year, month } => write!(f, "{:04}{:02}", year, month),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelativePeriod {
    This(PeriodUnit),
    Last(PeriodUnit),
    LastN { count: u32, unit: PeriodUnit },
    ThisYearBy(PeriodUnit),
}

impl RelativePeriod {
    fn parse(keyword: &str) -> Option<Self> {
        let upper = keyword.to_ascii_uppercase();

        if let Some(rest) = upper.strip_suffix("_THIS_YEAR") {
            return match PeriodUnit::from_plural(rest)? {
                PeriodUnit::Year => None,
                unit => Some(RelativePeriod::ThisYearBy(unit)),
            };
        }
        if let Some(rest) = upper.strip_prefix("THIS_") {
            return PeriodUnit::from_singular(rest).map(RelativePeriod::This);
        }
        let rest = upper.strip_prefix("LAST_")?;
        if let Some(unit) = PeriodUnit::from_singular(rest) {
            return Some(RelativePeriod::Last(unit));
        }
        let (count, unit) = rest.split_once('_')?;
        if !count.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let count: u32 = count.parse().ok()?;
        if count == 0 || count > MAX_RELATIVE_COUNT {
            return None;
        }
        Some(RelativePeriod::LastN {
            count,
            unit: PeriodUnit::from_plural(unit)?,
        })
    }

    fn resolve(&self, reference: NaiveDate) -> Vec<Period> {
        match *self {
            RelativePeriod::This(unit) => vec![Period::containing(unit, reference)],
            RelativePeriod::Last(unit) => vec![Period::containing(unit, reference).previous()],
            RelativePeriod::LastN { count, unit } => {
                trailing(Period::containing(unit, reference), count as usize)
            }
            RelativePeriod::ThisYearBy(unit) => {
                let current = Period::containing(unit, reference);
                let count = match current {
                    Period::Quarter { quarter, .. } => quarter,
                    Period::Month { month, .. } => month,
                    Period::Year(_) => 1,
                };
                trailing(current, count as usize)
            }
        }
    }
}

fn trailing(current: Period, count: usize) -> Vec<Period> {
    let mut out = Vec::with_capacity(count);
    let mut p = current;
    for _ in 0..count {
        out.push(p);
        p = p.previous();
    }
    out
}

impl fmt::Display for RelativePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelativePeriod::This(unit) => write!(f, "THIS_{}", unit.singular()),
            RelativePeriod::Last(unit) => write!(f, "LAST_{}", unit.singular()),
            RelativePeriod::LastN { count, unit } => write!(f, "LAST_{}_{}", count, unit.plural()),
            RelativePeriod::ThisYearBy(unit) => write!(f, "{}_THIS_YEAR", unit.plural()),
        }
    }
}

/// A period selection as written in a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodExpr {
    Fixed(Period),
    Relative(RelativePeriod),
}

impl PeriodExpr {
    /// Expand into concrete period codes, most recent first.
    pub fn resolve(&self, reference: NaiveDate) -> Vec<String> {
        match self {
            PeriodExpr::Fixed(p) => vec![p.to_string()],
            PeriodExpr::Relative(r) => r.resolve(reference).iter().map(Period::to_string).collect(),
        }
    }
}

impl FromStr for PeriodExpr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || BridgeError::InvalidPeriodExpression {
            expr: s.to_string(),
        };

        if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            return Period::parse_code(trimmed)
                .map(PeriodExpr::Fixed)
                .ok_or_else(invalid);
        }
        RelativePeriod::parse(trimmed)
            .map(PeriodExpr::Relative)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for PeriodExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodExpr::Fixed(p) => p.fmt(f),
            PeriodExpr::Relative(r) => r.fmt(f),
        }
    }
}

/// Parse and resolve a single expression.
pub fn resolve(expr: &str, reference: NaiveDate) -> Result<Vec<String>, BridgeError> {
    Ok(expr.parse::<PeriodExpr>()?.resolve(reference))
}

/// Resolve several expressions into one ordered set of period codes.
///
/// Codes keep first-seen order; duplicates across expressions collapse.
pub fn resolve_all(exprs: &[PeriodExpr], reference: NaiveDate) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for expr in exprs {
        for code in expr.resolve(reference) {
            if !out.contains(&code) {
                out.push(code);
            }
        }
    }
    out
}

/// Earliest start and latest end date covered by a set of period codes.
///
/// Codes that fail to parse are skipped.
pub fn date_span(codes: &[String]) -> Option<(NaiveDate, NaiveDate)> {
    let periods: Vec<Period> = codes.iter().filter_map(|c| Period::parse_code(c)).collect();
    let start = periods.iter().filter_map(Period::start).min()?;
    let end = periods.iter().filter_map(Period::end).max()?;
    Some((start, end))
}
