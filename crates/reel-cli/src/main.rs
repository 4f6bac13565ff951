//! reel: maintenance commands for video records and their deposits.
//!
//! Reads DATABASE_URL and the other settings from the environment (or `.env`).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use reel_cli::{
    confirm, init_tracing, prepare, print_json, reconcile_summary, recreate_all_summary,
    report_error, run_until_interrupted, shutdown_signal, subformats_summary, Action, Cli,
};
use reel_core::models::TaskKind;
use reel_core::{AppError, AppResult, Config, ErrorMetadata, LogFormat};
use reel_db::{connect, FlowRepository, PgStore};
use reel_services::{
    AssociationRepository, EntityResolver, FlowTranscoder, ReconcileOptions, Reconciler,
    SnapshotService, SubformatService, TagModel, TaskRestartService,
};
use reel_storage::{FlowStore, Store};
use tokio_util::sync::CancellationToken;

struct Services {
    store: Arc<dyn Store>,
    flows: Arc<dyn FlowStore>,
    config: Config,
}

impl Services {
    async fn connect(config: Config) -> AppResult<Self> {
        let pool = connect(&config).await?;
        Ok(Self {
            store: Arc::new(PgStore::new(pool.clone())),
            flows: Arc::new(FlowRepository::new(pool)),
            config,
        })
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            EntityResolver::new(),
            SnapshotService::new(),
            TagModel::new(),
            AssociationRepository::new(),
        )
    }

    fn subformats(&self) -> SubformatService {
        SubformatService::new(
            self.store.clone(),
            EntityResolver::new(),
            Arc::new(FlowTranscoder::new(self.flows.clone())),
            self.config.transcode_qualities.clone(),
        )
    }
}

async fn run(
    action: Action,
    config: Config,
    json: bool,
    cancel: CancellationToken,
) -> AppResult<()> {
    let services = Services::connect(config).await?;

    match action {
        Action::Reconcile { id, dry_run } => {
            let outcome = services
                .reconciler()
                .reconcile(&id, ReconcileOptions { dry_run }, &cancel)
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("{}", reconcile_summary(&outcome));
                for warning in &outcome.warnings {
                    println!("Warning: {}", warning);
                }
            }
        }
        Action::RestartExtractFrames { id } => {
            let restarted = TaskRestartService::new(
                services.store.clone(),
                services.flows.clone(),
                EntityResolver::new(),
            )
            .restart_tasks(&id, TaskKind::ExtractFrames)
            .await?;
            if json {
                print_json(&restarted)?;
            } else {
                println!("Restarted {} extract frames task(s)", restarted.len());
                for task in &restarted {
                    println!("  {}", task.id);
                }
            }
        }
        Action::CreateMissingSubformats { id } => {
            let created = services.subformats().create_all_missing(&id).await?;
            if json {
                print_json(&created)?;
            } else {
                println!("{}", subformats_summary(&created));
            }
        }
        Action::RecreateSubformat { id, quality } => {
            let created = services.subformats().create(&id, &quality).await?;
            if json {
                print_json(&created)?;
            } else {
                match created {
                    Some(descriptor) => println!(
                        "Creating the following subformat: {}. Task id: {}",
                        descriptor.preset_quality, descriptor.task_id
                    ),
                    None => println!("This subformat cannot be transcoded."),
                }
            }
        }
        Action::RecreateAllSubformats { id } => {
            let created = services.subformats().create_all(&id).await?;
            if json {
                print_json(&created)?;
            } else {
                println!("{}", recreate_all_summary(&created));
            }
        }
    }
    Ok(())
}

async fn execute(cli: Cli) -> AppResult<()> {
    let config = Config::from_env()
        .map_err(|e| AppError::InvalidInput(format!("Invalid configuration: {:#}", e)))?;
    tracing::debug!(
        environment = %config.environment,
        production = config.is_production(),
        "Configuration loaded"
    );

    // No signal handler is installed yet: Ctrl+C at the prompt exits right away.
    let action = prepare(cli.command, &config, confirm)?;

    let cancel = CancellationToken::new();
    run_until_interrupted(
        run(action, config, cli.json, cancel.clone()),
        shutdown_signal(),
        &cancel,
    )
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let log_format: LogFormat = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    init_tracing(log_format);

    let cli = Cli::parse();
    let json = cli.json;

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, json);
            ExitCode::from(err.exit_code())
        }
    }
}
