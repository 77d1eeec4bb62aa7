use anyhow::Context;
use clap::{Parser, Subcommand};
use migration_stats::config::Settings;
use migration_stats::infra::ReqwestHttp;
use migration_stats::logging::init_logging;
use migration_stats::metrics::init_metrics;
use migration_stats::pipeline::{PeriodStatus, Pipeline, RunPlan, RunReport};
use migration_stats::types::{GeographyLevel, MetricFamily, TimePeriod};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "migration_stats")]
#[command(about = "Fetch, harmonize and combine state-level migration statistics")]
#[command(version = "0.1.0")]
struct Cli {
    /// Defaults to fetching every enabled adapter
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch provider data and update the family tables
    Fetch {
        /// Comma-separated adapter ids (default: all enabled)
        #[arg(long, value_delimiter = ',')]
        adapters: Vec<String>,
        /// Geography level to request instead of each adapter's configured levels
        #[arg(long)]
        level: Option<GeographyLevel>,
        /// Years as a list (2018,2019) or an inclusive range (2010-2023)
        #[arg(long)]
        years: Option<String>,
    },
    /// Merge family tables into one longitudinal table
    Combine {
        /// Comma-separated metric families (default: every table)
        #[arg(long, value_delimiter = ',')]
        families: Vec<MetricFamily>,
        /// Name of the combined table
        #[arg(long, default_value = "combined")]
        name: String,
        /// Also write a wide table with one column per family value
        #[arg(long)]
        wide: bool,
    },
    /// List configured adapters
    List,
    /// List metric families and their table columns
    Families,
}

fn parse_years(raw: &str) -> anyhow::Result<Vec<TimePeriod>> {
    let raw = raw.trim();
    if let Some((from, to)) = raw.split_once('-') {
        let from: i32 = from.trim().parse().with_context(|| format!("invalid start year in '{raw}'"))?;
        let to: i32 = to.trim().parse().with_context(|| format!("invalid end year in '{raw}'"))?;
        anyhow::ensure!(from <= to, "year range '{raw}' is reversed");
        return Ok((from..=to).map(TimePeriod).collect());
    }
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<TimePeriod>().map_err(anyhow::Error::msg))
        .collect()
}

fn print_report(report: &RunReport) {
    println!("\n📊 Run {}", report.run_id);
    for period in &report.periods {
        let label = format!("{} {} {}", period.adapter, period.level, period.period);
        match &period.status {
            PeriodStatus::Written {
                rows,
                skipped_geographies,
            } => {
                println!("   ✅ {label}: {rows} rows");
                if !skipped_geographies.is_empty() {
                    println!("      ⚠️  skipped geographies: {}", skipped_geographies.join(", "));
                }
            }
            PeriodStatus::NoData { rows } => println!("   ∅  {label}: no data ({rows} null rows recorded)"),
            PeriodStatus::Failed { kind, message } => println!("   ❌ {label}: {kind}: {message}"),
        }
    }
    println!(
        "   {} succeeded, {} failed",
        report.succeeded_count(),
        report.failures().count()
    );
}

async fn fetch(pipeline: &Pipeline, plan: RunPlan) -> anyhow::Result<ExitCode> {
    let run = pipeline.run(&plan);
    let report = tokio::select! {
        report = run => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; tables already written are complete, in-flight periods were abandoned");
            return Ok(ExitCode::from(130));
        }
    };

    print_report(&report);
    if report.periods.is_empty() || report.any_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let settings = Settings::load()?;
    let _log_guard = init_logging();
    init_metrics(settings.metrics_addr);

    let http = ReqwestHttp::new(settings.request_timeout).map_err(anyhow::Error::msg)?;
    let pipeline = Pipeline::from_settings(&settings, Arc::new(http))?;
    info!("Writing tables under {}", settings.output_dir.display());

    match cli.command.unwrap_or(Commands::Fetch {
        adapters: Vec::new(),
        level: None,
        years: None,
    }) {
        Commands::Fetch { adapters, level, years } => {
            let years = years.as_deref().map(parse_years).transpose()?;
            fetch(&pipeline, RunPlan { adapters, level, years }).await
        }
        Commands::Combine { families, name, wide } => {
            let report = pipeline.combine(&families, &name, wide)?;
            println!(
                "🔗 Combined {} tables into {} ({} rows)",
                report.inputs.len(),
                report.path.display(),
                report.rows
            );
            if let Some(wide_path) = report.wide_path {
                println!("   wide table: {}", wide_path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            for config in pipeline.registry().list() {
                let levels: Vec<&str> = config.levels.iter().map(|l| l.as_str()).collect();
                let periods = config.configured_periods();
                println!(
                    "{:<28} {:<17} {:<17} {:<14} {}-{} {}",
                    config.id,
                    config.provider,
                    config.metric_family,
                    levels.join(","),
                    periods.first().map(|p| p.year()).unwrap_or_default(),
                    periods.last().map(|p| p.year()).unwrap_or_default(),
                    if config.enabled { "" } else { "(disabled)" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Families => {
            for family in pipeline.registry().families() {
                println!("{:<24} {}", family.name, family.description);
                println!("   columns: {}", family.columns.join(", "));
                if !family.derived.is_empty() {
                    println!("   derived: {}", family.derived.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
