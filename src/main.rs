//! handover CLI - run and resume device migration plans.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use handover::actions::EXAMPLE_PLAN;
use handover::checkpoint::{ExecutionMode, PlanArchive};
use handover::external::FanoutSink;
use handover::models::{StepDefaults, TriggerKind};
use handover::{
    ActionRegistry, CommandTrigger, Config, Engine, EnvCredentialProvider, FileCheckpointStore,
    MarkerFileTrigger, MigrationPlan, NoopTrigger, NotificationSink, PlanDefinition, PlanResult,
    PlanStatus, ProgressSink, Resolution, ResumptionTrigger, StepStatus, TracingSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "handover")]
#[command(version)]
#[command(about = "Resumable, compensating device migration workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "handover.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a plan from a plan file
    Run {
        /// Path to the plan file (TOML or JSON)
        plan: PathBuf,
    },

    /// Continue a plan from its last checkpoint
    Resume {
        plan_id: String,
    },

    /// Show the stored state of a plan
    Status {
        plan_id: String,

        /// Print the raw checkpoint or receipt as JSON
        #[arg(long)]
        json: bool,
    },

    /// List plans with an active checkpoint
    List,

    /// Drop a plan's checkpoint, receipt and resumption trigger
    Abandon {
        plan_id: String,
    },

    /// Record the outcome of a step interrupted mid-flight
    Resolve {
        plan_id: String,

        /// Step id
        #[arg(long)]
        step: String,

        /// What actually happened
        #[arg(long = "as", value_enum)]
        resolution: ResolveAs,
    },

    /// Validate the configuration file, and a plan file if given
    Validate {
        plan: Option<PathBuf>,
    },

    /// Show example configuration and plan
    Example,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResolveAs {
    Completed,
    Failed,
}

impl From<ResolveAs> for Resolution {
    fn from(value: ResolveAs) -> Self {
        match value {
            ResolveAs::Completed => Resolution::Completed,
            ResolveAs::Failed => Resolution::Failed,
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example() {
    let config = r#"# handover configuration file

[store]
# Checkpoints, receipts, lock files and archived plan files
dir = "${ProgramData}/handover"

[defaults]
timeout_secs = 600
max_retries = 0
backoff_base_ms = 1000
backoff_max_ms = 60000
verify_timeout_secs = 300

[resume]
# none | marker | command
kind = "command"
arm_command = 'schtasks /create /f /tn handover-{plan_id} /sc onstart /ru SYSTEM /tr "\"{exe}\" --config \"{config}\" resume {plan_id}"'
disarm_command = "schtasks /delete /f /tn handover-{plan_id}"

[credentials]
# Credential "enroll_token" is read from HANDOVER_SECRET_ENROLL_TOKEN
env_prefix = "HANDOVER_SECRET_"

[notify]
progress_bar = true
"#;
    println!("{config}");
    println!("# ---- example plan ----\n");
    println!("{EXAMPLE_PLAN}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_or_default(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn load_plan(path: &Path, defaults: &StepDefaults) -> Result<MigrationPlan> {
    let definition = PlanDefinition::from_file(path)
        .with_context(|| format!("Failed to read plan from {path:?}"))?;
    ActionRegistry::with_builtins()
        .build_plan(&definition, defaults)
        .with_context(|| format!("Invalid plan {path:?}"))
}

fn find_archived_plan(archive: &PlanArchive, plan_id: &str) -> Result<PathBuf> {
    archive
        .find(plan_id)?
        .with_context(|| format!("No archived plan file for '{plan_id}' in {:?}", archive.dir()))
}

struct Cmdline {
    engine: Engine,
    progress: Option<Arc<ProgressSink>>,
    archive: PlanArchive,
}

fn build_engine(config: &Config, config_path: &Path) -> Result<Cmdline> {
    let store_dir = config.store.resolved_dir();
    let store = FileCheckpointStore::new(&store_dir)
        .with_context(|| format!("Failed to open checkpoint store {store_dir:?}"))?;
    let archive = PlanArchive::new(&store_dir)?;

    let exe = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "handover".to_string());
    let config_arg = std::path::absolute(config_path)
        .unwrap_or_else(|_| config_path.to_owned())
        .display()
        .to_string();

    let trigger: Arc<dyn ResumptionTrigger> = match config.resume.kind {
        TriggerKind::None => Arc::new(NoopTrigger),
        TriggerKind::Marker => Arc::new(MarkerFileTrigger::new(
            config.marker_dir(),
            vec![exe, "--config".to_string(), config_arg, "resume".to_string()],
        )),
        TriggerKind::Command => {
            // validate() guarantees both commands are present
            let arm = config.resume.arm_command.clone().unwrap_or_default();
            let disarm = config.resume.disarm_command.clone().unwrap_or_default();
            Arc::new(CommandTrigger::new(arm, disarm, exe, config_arg))
        }
    };

    let progress = config.notify.progress_bar.then(|| Arc::new(ProgressSink::new()));
    let sink: Arc<dyn NotificationSink> = match &progress {
        Some(bar) => Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(bar.clone()),
        ),
        None => Arc::new(TracingSink),
    };

    let engine = Engine::new(Arc::new(store))
        .with_sink(sink)
        .with_trigger(trigger)
        .with_credentials(Arc::new(EnvCredentialProvider::new(
            config.credentials.env_prefix.clone(),
        )));

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting the current step");
            token.cancel();
        }
    });

    Ok(Cmdline {
        engine,
        progress,
        archive,
    })
}

fn report(result: &PlanResult) -> i32 {
    println!("\n=== Plan {} ===", result.plan_id);
    println!("Outcome:     {}", result.outcome);
    if let Some(cause) = &result.cause {
        println!("Cause:       {cause}");
    }
    let completed = result
        .records
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .count();
    println!("Completed:   {completed} step transition(s) this run");
    println!("Facts:       {}", result.facts.len());
    result.outcome.exit_code()
}

fn print_status(status: &PlanStatus, json: bool) -> Result<()> {
    match status {
        PlanStatus::Unknown => println!("No checkpoint or receipt found"),
        PlanStatus::Completed(receipt) if json => {
            println!("{}", serde_json::to_string_pretty(receipt)?)
        }
        PlanStatus::Completed(receipt) => {
            println!("Plan:        {}", receipt.plan_id);
            println!("Device:      {}", receipt.device.name);
            println!("State:       succeeded");
            println!("Completed:   {}", receipt.completed_at);
            println!("Steps:       {}", receipt.completed_steps.join(", "));
        }
        PlanStatus::Active(checkpoint) if json => {
            println!("{}", serde_json::to_string_pretty(checkpoint)?)
        }
        PlanStatus::Active(checkpoint) => {
            let state = match (&checkpoint.mode, &checkpoint.suspended) {
                (ExecutionMode::Terminal { outcome, .. }, _) => outcome.to_string(),
                (ExecutionMode::RollingBack { .. }, _) => "rolling back".to_string(),
                (ExecutionMode::Forward, Some(s)) => {
                    format!("suspended after '{}', resume {}", s.step_id, s.condition)
                }
                (ExecutionMode::Forward, None) => "in progress".to_string(),
            };
            println!("Plan:        {}", checkpoint.plan_id);
            println!("Device:      {}", checkpoint.device.name);
            println!("State:       {state}");
            if let ExecutionMode::Terminal { cause: Some(cause), .. }
            | ExecutionMode::RollingBack { cause, .. } = &checkpoint.mode
            {
                println!("Cause:       {cause}");
            }
            println!(
                "Position:    phase {} ({}), step {}",
                checkpoint.phase_index,
                checkpoint.current_phase_name().unwrap_or("-"),
                checkpoint.current_step_id().unwrap_or("-")
            );
            println!("Progress:    {:.0}%", checkpoint.progress_percent());
            println!("Updated:     {} (revision {})", checkpoint.updated_at, checkpoint.revision);
            for phase in &checkpoint.layout {
                println!("\n[{}]", phase.name);
                for step in &phase.steps {
                    let status = if checkpoint.is_carried_over(step) {
                        "completed (earlier run)".to_string()
                    } else {
                        checkpoint.log.status_of(step).to_string()
                    };
                    println!("  {step:<24} {status}");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example();
            return Ok(());
        }

        Commands::Validate { plan } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            info!("Configuration is valid");
            info!("  Store: {}", config.store.resolved_dir().display());
            info!("  Resume trigger: {:?}", config.resume.kind);

            if let Some(path) = plan {
                let plan = load_plan(&path, &config.defaults)?;
                info!("Plan '{}' is valid", plan.id);
                for phase in &plan.phases {
                    info!(
                        "  {}: {} step(s){}",
                        phase.name,
                        phase.steps.len(),
                        if phase.verification.is_some() { ", verified" } else { "" }
                    );
                }
            }
            return Ok(());
        }

        Commands::Run { plan: plan_path } => {
            let config = load_config(&cli.config)?;
            let plan = load_plan(&plan_path, &config.defaults)?;
            let cmd = build_engine(&config, &cli.config)?;

            let result = cmd
                .engine
                .run_archived(&plan, &plan_path, &cmd.archive)
                .await?;
            if let Some(bar) = &cmd.progress {
                bar.finish();
            }
            std::process::exit(report(&result));
        }

        Commands::Resume { plan_id } => {
            let config = load_config(&cli.config)?;
            let cmd = build_engine(&config, &cli.config)?;
            let plan_path = find_archived_plan(&cmd.archive, &plan_id)?;
            let plan = load_plan(&plan_path, &config.defaults)?;

            let result = cmd
                .engine
                .execute(&plan, Some(&plan_id))
                .await
                .with_context(|| format!("Failed to resume plan '{plan_id}'"))?;
            if let Some(bar) = &cmd.progress {
                bar.finish();
            }
            std::process::exit(report(&result));
        }

        Commands::Status { plan_id, json } => {
            let config = load_config(&cli.config)?;
            let store = FileCheckpointStore::new(&config.store.resolved_dir())?;
            let status = Engine::new(Arc::new(store)).status(&plan_id)?;
            print_status(&status, json)?;
        }

        Commands::List => {
            let config = load_config(&cli.config)?;
            let store = FileCheckpointStore::new(&config.store.resolved_dir())?;
            let engine = Engine::new(Arc::new(store));
            let ids = engine.list()?;
            if ids.is_empty() {
                println!("No active plans");
            }
            for id in ids {
                if let PlanStatus::Active(checkpoint) = engine.status(&id)? {
                    println!(
                        "{id:<32} {:>3.0}%  {}",
                        checkpoint.progress_percent(),
                        checkpoint.current_step_id().unwrap_or("-")
                    );
                }
            }
        }

        Commands::Abandon { plan_id } => {
            let config = load_config(&cli.config)?;
            let cmd = build_engine(&config, &cli.config)?;
            let existed = cmd.engine.abandon(&plan_id).await?;
            cmd.archive
                .remove(&plan_id)
                .context("Failed to remove archived plan file")?;
            if existed {
                println!("Abandoned plan '{plan_id}'");
            } else {
                println!("Nothing stored for plan '{plan_id}'");
            }
        }

        Commands::Resolve {
            plan_id,
            step,
            resolution,
        } => {
            let config = load_config(&cli.config)?;
            let store = FileCheckpointStore::new(&config.store.resolved_dir())?;
            let checkpoint = Engine::new(Arc::new(store))
                .resolve(&plan_id, &step, resolution.into())
                .with_context(|| format!("Failed to resolve step '{step}'"))?;
            println!(
                "Step '{step}' is now {}; run `handover resume {plan_id}` to continue",
                checkpoint.log.status_of(&step)
            );
        }
    }

    Ok(())
}
