// 🧾 salt-rules - Admin CLI for the SALT rule engine
//
// ingest -> review (list/show/diff) -> activate -> calculate

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use salt_rules::{
    issues_to_csv, read_distributions, EngineConfig, EntityTypeCode, Investor, Period,
    RuleIngestor, RuleSetManager, StateCode, TaxCalculator, Workbook,
};

/// SALT tax-rule engine: rule set ingestion, lifecycle and tax calculation
#[derive(Parser, Debug)]
#[command(name = "salt-rules", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to engine configuration (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, global = true, default_value = "salt_rules.db")]
    database: PathBuf,

    /// Name recorded on lifecycle events.
    #[arg(long, global = true, default_value = "system")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a withholding + composite workbook and store it as a draft.
    Ingest {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        period: Period,
        /// Withholding sheet (CSV).
        #[arg(long)]
        withholding: PathBuf,
        /// Composite sheet (CSV).
        #[arg(long)]
        composite: PathBuf,
        /// Write every validation issue to this CSV file.
        #[arg(long)]
        issues_csv: Option<PathBuf>,
    },

    /// Publish a draft, archiving the prior active set for its period.
    Activate {
        id: String,
        /// Defaults to the first day of the period.
        #[arg(long)]
        effective_date: Option<NaiveDate>,
    },

    /// Archive an active set or abandon a draft.
    Archive {
        id: String,
        #[arg(long)]
        effective_to: Option<NaiveDate>,
    },

    /// Compare a rule set with another (default: the active set for its period).
    Diff {
        id: String,
        #[arg(long)]
        against: Option<String>,
    },

    /// List rule sets, newest period first.
    List {
        #[arg(long)]
        year: Option<i32>,
    },

    /// Show one rule set with its issues and resolved rule count.
    Show { id: String },

    /// Calculate taxes for one investor's distributions.
    Calculate {
        #[arg(long)]
        rule_set: String,
        #[arg(long)]
        investor_id: String,
        #[arg(long)]
        entity_type: EntityTypeCode,
        #[arg(long)]
        domicile: StateCode,
        /// Distribution rows (CSV).
        #[arg(long)]
        distributions: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let mut manager = RuleSetManager::open(&cli.database)
        .with_context(|| format!("Failed to open database: {:?}", cli.database))?
        .with_actor(&cli.actor);

    match cli.command {
        Commands::Ingest {
            year,
            period,
            withholding,
            composite,
            issues_csv,
        } => run_ingest(
            &mut manager,
            &config,
            year,
            period,
            &withholding,
            &composite,
            issues_csv.as_deref(),
        ),
        Commands::Activate { id, effective_date } => {
            let rule_set = manager.activate(&id, effective_date)?;
            let resolved = manager.resolved_rules(&id)?;
            println!(
                "✓ Activated {} ({} {}) effective {} with {} resolved rules",
                rule_set.id,
                rule_set.year,
                rule_set.period,
                rule_set.effective_from,
                resolved.len()
            );
            Ok(())
        }
        Commands::Archive { id, effective_to } => {
            let rule_set = manager.archive(&id, effective_to)?;
            match rule_set.effective_to {
                Some(to) => println!("✓ Archived {} (effective to {})", rule_set.id, to),
                None => println!("✓ Archived draft {}", rule_set.id),
            }
            Ok(())
        }
        Commands::Diff { id, against } => {
            let diff = manager.diff(&id, against.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
            eprintln!("{}", diff.summary());
            Ok(())
        }
        Commands::List { year } => {
            let rule_sets = manager.list_rule_sets(year)?;
            if rule_sets.is_empty() {
                println!("No rule sets.");
            }
            for rs in rule_sets {
                let to = rs.effective_to.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {} {}  {:<8}  {} .. {}",
                    rs.id, rs.year, rs.period, rs.status, rs.effective_from, to
                );
            }
            Ok(())
        }
        Commands::Show { id } => {
            let rule_set = manager.get_rule_set(&id)?;
            let issues = manager.issues(&id)?;
            let resolved = manager.resolved_rules(&id)?;
            let view = serde_json::json!({
                "rule_set": rule_set,
                "can_activate": manager.can_activate(&id)?,
                "withholding_rules": manager.withholding_rules(&id)?.len(),
                "composite_rules": manager.composite_rules(&id)?.len(),
                "resolved_rules": resolved.len(),
                "issues": issues,
                "events": manager.events_for(&id)?,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Calculate {
            rule_set,
            investor_id,
            entity_type,
            domicile,
            distributions,
        } => {
            let snapshot = manager.published_snapshot(&rule_set)?;
            let target = manager.get_rule_set(&rule_set)?;
            if !target.is_active() {
                tracing::warn!(rule_set_id = %target.id, status = %target.status, "calculating against a superseded rule set");
            }

            let file = File::open(&distributions)
                .with_context(|| format!("Failed to open distributions: {:?}", distributions))?;
            let rows = read_distributions(file)?;

            let investor = Investor {
                id: investor_id,
                entity_type,
                domicile_state: domicile,
            };
            let batch = TaxCalculator::new(&snapshot, config.rounding_scale).calculate(&investor, &rows);
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
    }
}

fn run_ingest(
    manager: &mut RuleSetManager,
    config: &EngineConfig,
    year: i32,
    period: Period,
    withholding: &Path,
    composite: &Path,
    issues_csv: Option<&Path>,
) -> Result<()> {
    let workbook = Workbook::from_csv_files(withholding, composite)?;

    let previous = manager.find_by_source_digest(year, period, &workbook.digest())?;
    if let Some(first) = previous.first() {
        tracing::warn!(rule_set_id = %first.id, "same workbook was already ingested for this period");
    }

    let ingestor = RuleIngestor::new(config);
    let (id, report) = manager.ingest(year, period, &workbook, &ingestor)?;

    println!("✓ Draft rule set {id} ({year} {period})");
    println!(
        "  {} withholding rules, {} composite rules",
        report.rules.withholding.len(),
        report.rules.composite.len()
    );
    println!("  {} errors, {} warnings", report.error_count(), report.warning_count());

    if let Some(path) = issues_csv {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        issues_to_csv(file, &report.issues)?;
        println!("  issues written to {}", path.display());
    } else {
        for issue in &report.issues {
            let row = issue.row.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            println!("  [{}] {} row {}: {} ({})", issue.severity, issue.sheet, row, issue.message, issue.code);
        }
    }

    if report.has_blocking_issues() {
        println!("⚠️  Blocking issues present: activation will be refused");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parse_ingest() {
        let cli = Cli::try_parse_from([
            "salt-rules",
            "ingest",
            "--year",
            "2025",
            "--period",
            "q1",
            "--withholding",
            "wh.csv",
            "--composite",
            "comp.csv",
        ])
        .unwrap();
        assert_eq!(cli.database, PathBuf::from("salt_rules.db"));
        if let Commands::Ingest { year, period, issues_csv, .. } = cli.command {
            assert_eq!(year, 2025);
            assert_eq!(period, Period::Q1);
            assert!(issues_csv.is_none());
        } else {
            panic!("expected ingest");
        }
    }

    #[test]
    fn cli_parse_activate_with_date() {
        let cli = Cli::try_parse_from(["salt-rules", "-vv", "activate", "rs-1", "--effective-date", "2025-02-15"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.actor, "system");
        if let Commands::Activate { id, effective_date } = cli.command {
            assert_eq!(id, "rs-1");
            assert_eq!(effective_date, NaiveDate::from_ymd_opt(2025, 2, 15));
        } else {
            panic!("expected activate");
        }
    }

    #[test]
    fn cli_parse_calculate() {
        let cli = Cli::try_parse_from([
            "salt-rules",
            "calculate",
            "--rule-set",
            "rs-1",
            "--investor-id",
            "inv-1",
            "--entity-type",
            "PARTNERSHIP",
            "--domicile",
            "ny",
            "--distributions",
            "d.csv",
        ])
        .unwrap();
        if let Commands::Calculate { entity_type, domicile, .. } = cli.command {
            assert_eq!(entity_type, EntityTypeCode::Partnership);
            assert_eq!(domicile.as_str(), "NY");
        } else {
            panic!("expected calculate");
        }
    }

    #[test]
    fn cli_parse_actor_after_subcommand() {
        let cli = Cli::try_parse_from(["salt-rules", "archive", "rs-1", "--actor", "jdoe"]).unwrap();
        assert_eq!(cli.actor, "jdoe");
        assert!(matches!(cli.command, Commands::Archive { effective_to: None, .. }));
    }

    #[test]
    fn cli_rejects_unknown_period() {
        assert!(Cli::try_parse_from([
            "salt-rules", "ingest", "--year", "2025", "--period", "Q5",
            "--withholding", "a.csv", "--composite", "b.csv",
        ])
        .is_err());
    }
}
