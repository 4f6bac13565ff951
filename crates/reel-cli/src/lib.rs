//! Command-line surface of the `reel` maintenance tool.

use std::future::Future;
use std::io::{self, BufRead, IsTerminal, Write};

use clap::{Args, Parser, Subcommand};
use reel_core::models::{EntityId, ReconcileOutcome, SubformatDescriptor};
use reel_core::{AppError, AppResult, Config, ErrorMetadata, LogFormat, LogLevel};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "reel", about = "Video record and deposit maintenance", version)]
pub struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Re-create the deposit bucket from the published record bucket
    Reconcile {
        #[command(flatten)]
        entity: EntityArgs,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
        /// Run every step, then roll back
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-trigger the extract frames task of the latest flow
    RestartExtractFrames {
        #[command(flatten)]
        entity: EntityArgs,
    },
    /// Subformat utilities
    Subformats {
        #[command(subcommand)]
        command: SubformatCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SubformatCommands {
    /// Create missing subformats
    Missing {
        #[command(flatten)]
        entity: EntityArgs,
    },
    /// Recreate subformats for a video
    Recreate {
        #[command(subcommand)]
        command: RecreateCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum RecreateCommands {
    /// Recreate the subformat of one quality
    Quality {
        /// Preset name, e.g. 720p
        quality: String,
        #[command(flatten)]
        entity: EntityArgs,
    },
    /// Recreate all subformats
    All {
        #[command(flatten)]
        entity: EntityArgs,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

/// Exactly one of `--recid` / `--depid`.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct EntityArgs {
    /// ID of the video record
    #[arg(long)]
    pub recid: Option<String>,
    /// ID of the video deposit
    #[arg(long)]
    pub depid: Option<String>,
}

impl EntityArgs {
    pub fn entity_id(&self) -> AppResult<EntityId> {
        match (&self.recid, &self.depid) {
            (Some(recid), None) => Ok(EntityId::recid(recid)),
            (None, Some(depid)) => Ok(EntityId::depid(depid)),
            _ => Err(AppError::InvalidInput(
                "Exactly one of --recid or --depid is required".to_string(),
            )),
        }
    }
}

/// A command whose arguments were checked and, when destructive, confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reconcile { id: EntityId, dry_run: bool },
    RestartExtractFrames { id: EntityId },
    CreateMissingSubformats { id: EntityId },
    RecreateSubformat { id: EntityId, quality: String },
    RecreateAllSubformats { id: EntityId },
}

/// Validate the parsed command and ask for confirmation where needed.
///
/// Runs before any database connection is opened, so a refused or declined command
/// leaves no trace (not even applied migrations).
pub fn prepare(
    command: Commands,
    config: &Config,
    confirm: impl FnOnce(&str, bool) -> AppResult<()>,
) -> AppResult<Action> {
    match command {
        Commands::Reconcile {
            entity,
            yes,
            dry_run,
        } => {
            let id = entity.entity_id()?;
            if !dry_run {
                confirm(
                    &format!(
                        "The deposit bucket of {} will be replaced by a copy of the record bucket and destroyed. Continue?",
                        id
                    ),
                    yes,
                )?;
            }
            Ok(Action::Reconcile { id, dry_run })
        }
        Commands::RestartExtractFrames { entity } => Ok(Action::RestartExtractFrames {
            id: entity.entity_id()?,
        }),
        Commands::Subformats { command } => match command {
            SubformatCommands::Missing { entity } => Ok(Action::CreateMissingSubformats {
                id: entity.entity_id()?,
            }),
            SubformatCommands::Recreate {
                command: RecreateCommands::Quality { quality, entity },
            } => {
                let id = entity.entity_id()?;
                if config.quality(&quality).is_none() {
                    let names: Vec<&str> = config
                        .transcode_qualities
                        .iter()
                        .map(|q| q.name.as_str())
                        .collect();
                    return Err(AppError::InvalidInput(format!(
                        "Input quality must be one of {}",
                        names.join(", ")
                    )));
                }
                Ok(Action::RecreateSubformat { id, quality })
            }
            SubformatCommands::Recreate {
                command: RecreateCommands::All { entity, yes },
            } => {
                let id = entity.entity_id()?;
                confirm("Do you really want to recreate all subformats?", yes)?;
                Ok(Action::RecreateAllSubformats { id })
            }
        },
    }
}

/// Resolves on Ctrl+C, or on SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::warn!("Received terminate signal");
        },
    }
}

/// Drive `work` until it finishes or `interrupt` resolves.
///
/// On interrupt the token is cancelled and `work` is dropped mid-flight; an open store
/// transaction inside it is rolled back.
pub async fn run_until_interrupted<T>(
    work: impl Future<Output = AppResult<T>>,
    interrupt: impl Future<Output = ()>,
    cancel: &CancellationToken,
) -> AppResult<T> {
    tokio::select! {
        result = work => result,
        _ = interrupt => {
            cancel.cancel();
            Err(AppError::Cancelled("Interrupted by operator".to_string()))
        }
    }
}

/// Initialize tracing for the CLI. Logs go to stderr so stdout stays parseable.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reel=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

pub fn print_json(value: &impl Serialize) -> AppResult<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{}", out);
    Ok(())
}

/// Ask the operator to confirm a destructive command.
///
/// `--yes` skips the question. Without it a non-interactive session is refused.
pub fn confirm(prompt: &str, yes: bool) -> AppResult<()> {
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    confirm_with(prompt, yes, interactive, &mut stdin.lock(), &mut io::stderr())
}

pub fn confirm_with(
    prompt: &str,
    yes: bool,
    interactive: bool,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> AppResult<()> {
    if yes {
        return Ok(());
    }
    if !interactive {
        return Err(AppError::InvalidInput(
            "Refusing to run without confirmation in a non-interactive session, pass --yes"
                .to_string(),
        ));
    }

    write!(output, "{} [y/N]: ", prompt)?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(()),
        _ => Err(AppError::Cancelled("Aborted by operator".to_string())),
    }
}

pub fn reconcile_summary(outcome: &ReconcileOutcome) -> String {
    if outcome.dry_run {
        format!(
            "Dry run: deposit bucket would be re-created from record bucket. Old bucket id: {} - New bucket id: {}",
            outcome.old_bucket_id, outcome.new_bucket_id
        )
    } else {
        format!(
            "Deposit bucket re-created from record bucket. Old bucket id: {} - New bucket id: {}",
            outcome.old_bucket_id, outcome.new_bucket_id
        )
    }
}

pub fn subformats_summary(created: &[SubformatDescriptor]) -> String {
    if created.is_empty() {
        return "No missing subformats to create.".to_string();
    }
    let qualities: Vec<&str> = created.iter().map(|d| d.preset_quality.as_str()).collect();
    format!("Creating the following subformats: {}", qualities.join(", "))
}

pub fn recreate_all_summary(created: &[SubformatDescriptor]) -> String {
    if created.is_empty() {
        return "The master is too small for every configured quality, nothing to recreate."
            .to_string();
    }
    let qualities: Vec<&str> = created.iter().map(|d| d.preset_quality.as_str()).collect();
    format!("Recreating the following subformats: {}", qualities.join(", "))
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    error: &'a str,
    message: String,
    recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

/// Log the error and render it for the operator.
pub fn report_error(err: &AppError, json: bool) {
    match err.log_level() {
        LogLevel::Debug => tracing::debug!(error = %err.detailed_message(), code = err.error_code(), "Command failed"),
        LogLevel::Warn => tracing::warn!(error = %err.detailed_message(), code = err.error_code(), "Command failed"),
        LogLevel::Error => tracing::error!(error = %err.detailed_message(), code = err.error_code(), "Command failed"),
    }

    if json {
        let report = ErrorReport {
            error: err.error_code(),
            message: err.operator_message(),
            recoverable: err.is_recoverable(),
            suggestion: err.suggested_action(),
        };
        if print_json(&report).is_ok() {
            return;
        }
    }
    eprintln!("Error: {}", err.operator_message());
    if let Some(hint) = err.suggested_action() {
        eprintln!("Hint: {}", hint);
    }
}
