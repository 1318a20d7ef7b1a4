//! Command surface for the contact identity store.
//!
//! Host tools can embed the CLI through [`run_cli`] for full parsed execution,
//! or [`run_command`] against an already opened [`SqliteContactStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use contact_identity_core::{ContactId, IdentifyRequest, IntegrityReport, IssueSeverity};
use contact_identity_store_sqlite::SqliteContactStore;

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity resolution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./contacts.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve an (email, phone) observation into its identity group.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
pub struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    Show(IdArgs),
}

#[derive(Debug, Subcommand)]
pub enum GroupCommand {
    /// Show the group containing a contact, primary or secondary.
    Show(IdArgs),
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

/// Opens the database named by `--db`, migrates it and runs the command.
///
/// # Errors
/// Returns an error if the database cannot be opened or migrated, or if the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    tracing::debug!(db = %cli.db.display(), "opening contact store");
    let mut store = SqliteContactStore::open(&cli.db)?;
    store
        .migrate()
        .with_context(|| format!("failed to migrate {}", cli.db.display()))?;
    run_command(cli.command, &mut store)
}

/// # Errors
/// Returns an error when the command fails; `db check` also fails when the
/// report is unhealthy.
pub fn run_command(command: Command, store: &mut SqliteContactStore) -> Result<()> {
    match command {
        Command::Identify(args) => {
            let request = IdentifyRequest {
                email: args.email,
                phone_number: args.phone,
            };
            let view = store.identify(&request)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::Contact { command } => match command {
            ContactCommand::Show(args) => {
                let id = ContactId(args.id);
                let record = store
                    .get_contact(id)?
                    .ok_or_else(|| anyhow!("contact not found: {id}"))?;
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
        },
        Command::Group { command } => match command {
            GroupCommand::Show(args) => {
                let view = store.group_of(ContactId(args.id))?;
                println!("{}", serde_json::to_string_pretty(&view)?);
                Ok(())
            }
        },
        Command::Db { command } => run_db(command, store),
    }
}

fn run_db(command: DbCommand, store: &SqliteContactStore) -> Result<()> {
    match command {
        DbCommand::Migrate => {
            let version = store.schema_version()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "schema_version": version }))?
            );
            Ok(())
        }
        DbCommand::Check(args) => {
            let report = store.integrity_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_integrity_report(&report);
            }

            if report.healthy {
                Ok(())
            } else {
                let errors = report
                    .issues
                    .iter()
                    .filter(|item| item.severity == IssueSeverity::Error)
                    .count();
                Err(anyhow!("integrity check failed: {errors} error issue(s)"))
            }
        }
    }
}

fn print_integrity_report(report: &IntegrityReport) {
    println!("contract={}", report.contract_version);
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    println!(
        "records={} primary={} secondary={}",
        report.total_records, report.primary_records, report.secondary_records
    );
    if report.issues.is_empty() {
        println!("issues=none");
        return;
    }

    println!("{:<24} {:<8} {:>10}  message", "code", "severity", "contact");
    println!("{}", "-".repeat(80));
    for item in &report.issues {
        let severity = match item.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        println!(
            "{:<24} {:<8} {:>10}  {}",
            item.code, severity, item.contact_id.0, item.message
        );
    }
}
