//! Command surface for the student roster.
//!
//! Hosts embed roster behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_roster_with_db`] for executing a [`Command`] against a DB path.
//! - [`run_roster`] for executing a record command against an existing
//!   [`RosterSession`], whatever its persistence.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use student_roster_core::{
    display_join_date, Confirmation, IdScheme, Projection, Record, RecordDraft, RecordPersistence,
    RosterError, RosterSession, SubmitOutcome, ViewFilter, DEFAULT_ID_PREFIX, DEFAULT_ID_WIDTH,
    DEFAULT_NAMESPACE,
};
use student_roster_store_sqlite::{open_record_store, SqliteKeyValueStore, StorageStatus};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "ROSTER_LOG";

const TABLE_HEADER: [&str; 5] = ["id", "name", "contact", "section", "salary"];

#[derive(Debug, Parser)]
#[command(name = "roster")]
#[command(about = "Student roster record manager")]
pub struct Cli {
    #[arg(long, env = "ROSTER_DB", default_value = "./student_roster.sqlite3")]
    db: PathBuf,

    /// Storage key the record collection is kept under.
    #[arg(long, env = "ROSTER_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[arg(long, env = "ROSTER_ID_PREFIX", default_value = DEFAULT_ID_PREFIX)]
    id_prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Add(AddArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Show(ShowArgs),
    List(ListArgs),
    Sections(SectionsArgs),
    Storage {
        #[command(subcommand)]
        command: Box<StorageCommand>,
    },
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    contact: String,
    #[arg(long)]
    section: String,
    #[arg(long, allow_hyphen_values = true)]
    salary: String,
    #[arg(long)]
    join_date: String,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    contact: Option<String>,
    #[arg(long)]
    section: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    salary: Option<String>,
    #[arg(long)]
    join_date: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: String,
    /// Skip the interactive confirmation.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    section: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SectionsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum StorageCommand {
    Status(StorageStatusArgs),
}

#[derive(Debug, Args)]
pub struct StorageStatusArgs {
    #[arg(long)]
    json: bool,
}

/// Where the record collection lives and how new identifiers look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub namespace: String,
    pub scheme: IdScheme,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            scheme: IdScheme::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Created { record: Record },
    Updated { record: Record },
    Removed { record: Record },
    NotFound { id: String },
    Declined { id: String },
}

impl From<SubmitOutcome> for CommandOutcome {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Created { record } => Self::Created { record },
            SubmitOutcome::Updated { record } => Self::Updated { record },
            SubmitOutcome::EditTargetMissing { id } => Self::NotFound { id: id.0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ShowPayload {
    id: String,
    form: RecordDraft,
    join_date_display: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ListPayload {
    contract_version: String,
    filter: ViewFilter,
    #[serde(flatten)]
    projection: Projection,
}

/// Installs the stderr log subscriber, filtered by [`LOG_ENV`].
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        warn!(error = %err, "tracing init failed");
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the configuration is invalid, the store cannot be
/// opened, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let scheme = IdScheme::new(cli.id_prefix, DEFAULT_ID_WIDTH)
        .map_err(|err| anyhow!("invalid --id-prefix: {err}"))?;
    let options = StoreOptions {
        namespace: cli.namespace,
        scheme,
    };
    run_roster_with_db(&cli.db, &options, cli.command)
}

/// Executes a command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_roster_with_db(db_path: &Path, options: &StoreOptions, command: Command) -> Result<()> {
    match command {
        Command::Storage { command } => {
            let kv = SqliteKeyValueStore::open_migrated(db_path)?;
            run_storage(*command, &kv, &options.namespace)
        }
        record_command => {
            let store = open_record_store(db_path, &options.namespace, options.scheme.clone())?;
            let mut session = RosterSession::new(store);
            run_roster(record_command, &mut session)
        }
    }
}

/// Executes a record command against an existing session.
///
/// # Errors
/// Returns an error when validation or the write-through fails, a shown
/// record does not exist, or output cannot be produced.
pub fn run_roster<P: RecordPersistence>(
    command: Command,
    session: &mut RosterSession<P>,
) -> Result<()> {
    match command {
        Command::Add(args) => {
            let draft = RecordDraft {
                name: args.name,
                contact: args.contact,
                section: args.section,
                salary: args.salary,
                join_date: args.join_date,
            };
            let outcome = session.submit(&draft).map_err(submit_error)?;
            print_outcome(&CommandOutcome::from(outcome))
        }
        Command::Update(args) => {
            let Some(prefill) = session.begin_edit(&args.id) else {
                return print_outcome(&CommandOutcome::NotFound { id: args.id });
            };

            let draft = RecordDraft {
                name: args.name.unwrap_or(prefill.name),
                contact: args.contact.unwrap_or(prefill.contact),
                section: args.section.unwrap_or(prefill.section),
                salary: args.salary.unwrap_or(prefill.salary),
                join_date: args.join_date.unwrap_or(prefill.join_date),
            };
            let outcome = session.submit(&draft).map_err(submit_error)?;
            print_outcome(&CommandOutcome::from(outcome))
        }
        Command::Delete(args) => {
            if session.store().get(&args.id).is_none() {
                return print_outcome(&CommandOutcome::NotFound { id: args.id });
            }

            let confirmation = if args.yes {
                Confirmation::Confirmed
            } else {
                confirm_on_stdin(&args.id)?
            };

            let outcome = match session.remove(&args.id, confirmation)? {
                Some(record) => CommandOutcome::Removed { record },
                None if confirmation == Confirmation::Declined => {
                    CommandOutcome::Declined { id: args.id }
                }
                None => CommandOutcome::NotFound { id: args.id },
            };
            print_outcome(&outcome)
        }
        Command::Show(args) => {
            let Some(record) = session.store().get(&args.id) else {
                return Err(anyhow!("record not found: {}", args.id));
            };

            let payload = ShowPayload {
                id: record.id.to_string(),
                form: RecordDraft::from(record),
                join_date_display: display_join_date(&record.join_date),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::List(args) => {
            session.set_search(args.search.unwrap_or_default());
            session.set_section_filter(args.section.unwrap_or_default());
            let filter = session.filter().clone();
            let projection = session.view();

            if args.json {
                let payload = build_list_json_payload(filter, projection);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_projection(&projection);
            }
            Ok(())
        }
        Command::Sections(args) => {
            let sections = session.view().distinct_sections;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&sections)?);
            } else {
                for section in &sections {
                    println!("{section}");
                }
            }
            Ok(())
        }
        Command::Storage { .. } => Err(anyhow!(
            "internal dispatch error: storage commands should be handled before store initialization"
        )),
    }
}

fn submit_error(err: RosterError) -> anyhow::Error {
    match err.validation_failure() {
        Some(failure) => anyhow!(
            "validation error: {}: {} ({})",
            failure.field(),
            failure.message(),
            failure.as_str()
        ),
        None => err.into(),
    }
}

fn run_storage(command: StorageCommand, kv: &SqliteKeyValueStore, namespace: &str) -> Result<()> {
    match command {
        StorageCommand::Status(args) => {
            let status = kv.status(namespace)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_storage_status(&status);
            }
            Ok(())
        }
    }
}

fn confirm_on_stdin(id: &str) -> Result<Confirmation> {
    eprint!("Delete record {id}? [y/N] ");
    std::io::stderr()
        .flush()
        .context("failed to flush confirmation prompt")?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;

    Ok(parse_confirmation(&answer))
}

fn parse_confirmation(answer: &str) -> Confirmation {
    let answer = answer.trim().to_lowercase();
    Confirmation::from(answer == "y" || answer == "yes")
}

fn print_outcome(outcome: &CommandOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn build_list_json_payload(filter: ViewFilter, projection: Projection) -> ListPayload {
    ListPayload {
        contract_version: "roster_list.v1".to_string(),
        filter,
        projection,
    }
}

fn format_salary(salary: Option<f64>) -> String {
    salary.map(|value| value.to_string()).unwrap_or_default()
}

fn print_projection(projection: &Projection) {
    println!(
        "{:<10} {:<24} {:<12} {:<10} {:>10}  join_date",
        TABLE_HEADER[0], TABLE_HEADER[1], TABLE_HEADER[2], TABLE_HEADER[3], TABLE_HEADER[4]
    );
    println!("{}", "-".repeat(84));

    if projection.rows.is_empty() {
        println!("No records");
    }

    for record in &projection.rows {
        println!(
            "{:<10} {:<24} {:<12} {:<10} {:>10}  {}",
            record.id,
            record.name,
            record.contact,
            record.section,
            format_salary(record.salary),
            display_join_date(&record.join_date)
        );
    }

    println!(
        "Showing: {} | Total Salary: {}",
        projection.summary.count, projection.summary.total_salary
    );
}

fn print_storage_status(status: &StorageStatus) {
    println!(
        "contract={} namespace={} schema_version={} key_present={} payload_bytes={}",
        status.contract_version,
        status.namespace,
        status
            .schema_version
            .map_or_else(|| "none".to_string(), |value| value.to_string()),
        if status.key_present { "yes" } else { "no" },
        status.payload_bytes
    );
    println!(
        "decodes={} record_count={} updated_at={}",
        if status.decodes { "yes" } else { "no" },
        status.record_count,
        status.updated_at.as_deref().unwrap_or("n/a")
    );
}
