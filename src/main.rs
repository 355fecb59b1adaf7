//! # DHIS2 Bridge CLI (`d2b`)
//!
//! The `d2b` binary drives the adapter from a shell: validate descriptors,
//! expand relative periods, run queries, inspect column metadata, fetch
//! corrected boundaries, manage the boundary cache, and start the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! d2b --config ./config/d2b.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `d2b init` | Create the SQLite database and boundary cache table |
//! | `d2b periods <expr>...` | Resolve period expressions to period codes |
//! | `d2b parse "<descriptor>"` | Validate and normalize a query descriptor |
//! | `d2b query "<descriptor>"` | Run a query and print the wide dataset as JSON |
//! | `d2b columns "<descriptor>"` | Print the dataset's column metadata |
//! | `d2b boundaries --level 2` | Fetch corrected boundaries for one or more levels |
//! | `d2b cache invalidate <prefix>` | Drop cached boundaries by version prefix |
//! | `d2b serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! d2b periods LAST_3_YEARS THIS_QUARTER --reference-date 2025-06-15
//! d2b parse "dx=FTRrcoaog83&pe=LAST_12_MONTHS&ou=ImspTQPwCqd&ouMode=CHILDREN"
//! d2b query "dx=FTRrcoaog83&pe=2024&ou=ImspTQPwCqd" --group-by orgUnit --pretty
//! d2b boundaries --level 2 --level 3 --geojson > districts.geojson
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use dhis2_bridge::{commands, config, logging, migrate, server};

/// DHIS2 Bridge CLI — expose DHIS2 analytics and boundaries as flat,
/// column-named datasets.
///
/// Commands that talk to the upstream server or the database read a TOML
/// configuration file given by `--config`. See `config/d2b.example.toml`.
#[derive(Parser)]
#[command(
    name = "d2b",
    about = "DHIS2 Bridge — analytics datasets and boundaries for BI hosts",
    version,
    long_about = "DHIS2 Bridge fetches indicator data from a DHIS2-style analytics API, \
    pivots it into wide rows with stable sanitized column names, and serves corrected \
    organisation-unit boundaries for map renderers."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/d2b.toml`.
    #[arg(long, global = true, default_value = "./config/d2b.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the boundary cache table.
    /// Running it more than once is safe.
    Init,

    /// Resolve period expressions (`LAST_3_YEARS`, `THIS_QUARTER`, `2024Q1`, ...).
    ///
    /// Prints one period code per line, in resolution order.
    Periods {
        /// One or more period expressions.
        #[arg(required = true)]
        exprs: Vec<String>,

        /// Date that relative expressions are anchored to (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long)]
        reference_date: Option<String>,
    },

    /// Validate a query descriptor and print its normalized form.
    Parse {
        /// Descriptor, e.g. `dx=ID1;ID2&pe=LAST_12_MONTHS&ou=OU1`.
        descriptor: String,
    },

    /// Run a query and print the wide dataset as JSON.
    Query {
        descriptor: String,

        /// Date that relative periods are anchored to (YYYY-MM-DD).
        #[arg(long)]
        reference_date: Option<String>,

        /// Group-by column reference (raw label or column name). Repeatable.
        #[arg(long = "group-by")]
        group_by: Vec<String>,

        /// Metric column reference (raw label or column name). Repeatable.
        #[arg(long = "metric")]
        metrics: Vec<String>,

        /// Row filter as `column=value1,value2`. Repeatable.
        #[arg(long = "filter", value_parser = commands::parse_filter)]
        filters: Vec<dhis2_bridge_core::reconcile::ColumnFilter>,

        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },

    /// Print the column metadata a descriptor produces.
    Columns {
        descriptor: String,

        #[arg(long)]
        reference_date: Option<String>,
    },

    /// Fetch corrected boundaries for one or more org-unit levels.
    Boundaries {
        /// Org-unit level. Repeatable.
        #[arg(long = "level", required = true)]
        levels: Vec<u32>,

        /// Print a GeoJSON FeatureCollection instead of the ingest summary.
        #[arg(long)]
        geojson: bool,
    },

    /// Manage the boundary cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Boundary cache subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// Drop every entry whose cache version starts with PREFIX.
    ///
    /// An empty prefix (`""`) drops everything.
    Invalidate { prefix: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Periods {
            exprs,
            reference_date,
        } => {
            commands::run_periods(exprs, reference_date.as_deref())?;
            return Ok(());
        }
        Commands::Parse { descriptor } => {
            commands::run_parse(descriptor)?;
            return Ok(());
        }
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "d2b", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Query {
            descriptor,
            reference_date,
            group_by,
            metrics,
            filters,
            pretty,
        } => {
            let refs = dhis2_bridge_core::reconcile::QueryReferences {
                group_by,
                metrics,
                filters,
            };
            commands::run_query(&cfg, &descriptor, reference_date.as_deref(), refs, pretty).await?;
        }
        Commands::Columns {
            descriptor,
            reference_date,
        } => {
            commands::run_columns(&cfg, &descriptor, reference_date.as_deref()).await?;
        }
        Commands::Boundaries { levels, geojson } => {
            commands::run_boundaries(&cfg, &levels, geojson).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Invalidate { prefix } => {
                commands::run_invalidate(&cfg, &prefix).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Periods { .. } | Commands::Parse { .. } | Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
