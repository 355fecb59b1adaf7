//! CLI command implementations.
//!
//! Each `run_*` function backs one `d2b` subcommand. Results go to stdout;
//! progress and diagnostics go through `tracing` to stderr.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use dhis2_bridge_core::descriptor::{self, QueryDescriptor};
use dhis2_bridge_core::models::ColumnRole;
use dhis2_bridge_core::period::{resolve_all, PeriodExpr};
use dhis2_bridge_core::reconcile::{ColumnFilter, QueryReferences};

use crate::app::App;
use crate::config::Config;
use crate::dataset::today;

/// Parse `--reference-date`, defaulting to today (UTC).
pub fn reference_date(raw: Option<&str>) -> Result<NaiveDate> {
    match raw {
        None => Ok(today()),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("--reference-date must be YYYY-MM-DD (got '{}')", s)),
    }
}

/// Parse a `column=value1,value2` filter argument.
pub fn parse_filter(s: &str) -> Result<ColumnFilter, String> {
    let (column, values) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid filter '{}': expected column=value[,value...]", s))?;
    if column.trim().is_empty() {
        return Err(format!("invalid filter '{}': empty column", s));
    }
    Ok(ColumnFilter {
        column: column.trim().to_string(),
        values: values.split(',').map(|v| v.trim().to_string()).collect(),
    })
}

/// A token cancelled by Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            child.cancel();
        }
    });
    token
}

pub fn run_periods(exprs: &[String], reference: Option<&str>) -> Result<()> {
    let reference = reference_date(reference)?;
    let parsed = exprs
        .iter()
        .map(|e| e.parse::<PeriodExpr>())
        .collect::<Result<Vec<_>, _>>()?;
    for code in resolve_all(&parsed, reference) {
        println!("{}", code);
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParsedDescriptor<'a> {
    normalized: String,
    endpoint: String,
    indicators: &'a [String],
    periods: Vec<String>,
    org_units: &'a [String],
    org_unit_mode: &'static str,
    table: &'a str,
    program: Option<&'a str>,
}

fn describe(query: &QueryDescriptor) -> ParsedDescriptor<'_> {
    ParsedDescriptor {
        normalized: query.to_query_string(),
        endpoint: query.endpoint().path().to_string(),
        indicators: &query.indicators,
        periods: query.periods.iter().map(|p| p.to_string()).collect(),
        org_units: &query.org_units,
        org_unit_mode: query.org_unit_mode.as_str(),
        table: &query.target_table,
        program: query.program.as_deref(),
    }
}

pub fn run_parse(raw: &str) -> Result<()> {
    let query = descriptor::parse(raw)?;
    println!("{}", serde_json::to_string_pretty(&describe(&query))?);
    Ok(())
}

pub async fn run_query(
    config: &Config,
    raw: &str,
    reference: Option<&str>,
    refs: QueryReferences,
    pretty: bool,
) -> Result<()> {
    let reference = reference_date(reference)?;
    // validate before touching the network or database
    let query = descriptor::parse(raw)?;

    let app = App::from_config(config).await?;
    let cancel = ctrl_c_token();
    let result = app.pipeline.run(&query, reference, &refs, &cancel).await?;

    let out = if pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", out);
    Ok(())
}

pub async fn run_columns(config: &Config, raw: &str, reference: Option<&str>) -> Result<()> {
    let reference = reference_date(reference)?;
    descriptor::parse(raw)?;

    let app = App::from_config(config).await?;
    let cancel = ctrl_c_token();
    let columns = app.pipeline.columns(raw, reference, &cancel).await?;

    for col in columns {
        let role = match col.role {
            ColumnRole::Dimension => "dimension",
            ColumnRole::Metric => "metric",
        };
        let temporal = if col.is_temporal { " (temporal)" } else { "" };
        println!("{}\t{}{}\t{}", col.name, role, temporal, col.original_label);
    }
    Ok(())
}

pub async fn run_boundaries(config: &Config, levels: &[u32], geojson: bool) -> Result<()> {
    if levels.is_empty() {
        bail!("at least one --level is required");
    }
    let app = App::from_config(config).await?;
    let entry = app.cache.get_or_fetch(levels, app.cache_version()).await?;

    if geojson {
        println!("{}", serde_json::to_string(&entry.collection.to_geojson())?);
        return Ok(());
    }

    println!("levels:    {}", entry.level_key);
    println!("version:   {}", entry.version);
    println!("digest:    {}", entry.digest);
    println!("features:  {}", entry.collection.len());
    println!("accepted:  {}", entry.report.accepted);
    println!("corrected: {}", entry.report.corrected);
    println!("rejected:  {}", entry.report.rejected.len());
    for r in &entry.report.rejected {
        println!("  - {}: {}", r.feature_id, r.reason);
    }
    Ok(())
}

pub async fn run_invalidate(config: &Config, prefix: &str) -> Result<()> {
    let app = App::from_config(config).await?;
    let report = app.cache.invalidate(prefix).await?;
    println!(
        "Invalidated {} persisted entr{} for version prefix '{}'.",
        report.persisted,
        if report.persisted == 1 { "y" } else { "ies" },
        prefix
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        let f = parse_filter("orgUnit=A, B").unwrap();
        assert_eq!(f.column, "orgUnit");
        assert_eq!(f.values, vec!["A", "B"]);
        assert!(parse_filter("novalue").is_err());
        assert!(parse_filter("=x").is_err());
    }

    #[test]
    fn test_reference_date() {
        assert_eq!(
            reference_date(Some("2024-02-29")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert!(reference_date(Some("2023-02-29")).is_err());
    }
}
