//! fabsim - Fab Rule Catalog Simulator
//!
//! Loads a rule catalog, replays a scripted sequence of station and robot
//! events through the rule engine and prints what the engine emits.

mod config;
mod scenario;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use fab_rules::{
    load_catalog, spawn_engine, ChannelSink, EngineStatus, NullSink, OutboundEvent, RuleCatalog,
    RuleEngine, RuleLogger, TransferRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::{FabsimConfig, DEFAULT_CONFIG_FILE};
use crate::scenario::{apply_step, Scenario, ScenarioStep, SimScheduler};

#[derive(Parser)]
#[command(name = "fabsim")]
#[command(about = "Replay equipment events through a fab rule catalog")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file
    #[arg(short = 'c', long = "config", global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Rule catalog (overrides the settings file)
    #[arg(long, global = true, env = "FABSIM_CATALOG")]
    catalog: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the catalog and report consistency warnings
    Validate,

    /// Replay a scenario and print the outbound events
    Run {
        /// Scenario file (YAML or JSON)
        scenario: PathBuf,

        /// Number of wafers in the lot
        #[arg(short = 'n', long)]
        wafers: Option<usize>,

        /// Submit transfers through the simulated scheduler
        #[arg(long)]
        scheduler: bool,

        /// Robots the simulated scheduler rejects
        #[arg(long = "offline-robot")]
        offline_robots: Vec<String>,

        /// Directory for per-catalog rule logs
        #[arg(long)]
        rule_log_dir: Option<PathBuf>,
    },

    /// Evaluate every rule against the state reached by a scenario
    Explain {
        /// Scenario to replay first (paused, nothing executes)
        scenario: Option<PathBuf>,

        /// Number of wafers in the lot
        #[arg(short = 'n', long)]
        wafers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let mut settings = FabsimConfig::load(&cli.config)?;
    if cli.catalog.is_some() {
        settings.catalog = cli.catalog.clone();
    }

    let log_level = if cli.verbose {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let Some(catalog_path) = settings.catalog.clone() else {
        bail!("No rule catalog given (use --catalog or set 'catalog' in the settings file)");
    };
    let catalog = Arc::new(
        load_catalog(&catalog_path)
            .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?,
    );

    match cli.command {
        Commands::Validate => validate(&catalog),
        Commands::Run {
            scenario,
            wafers,
            scheduler,
            offline_robots,
            rule_log_dir,
        } => {
            if let Some(n) = wafers {
                settings.total_wafers = n;
            }
            if scheduler {
                settings.use_scheduler = true;
            }
            if rule_log_dir.is_some() {
                settings.rule_log_dir = rule_log_dir;
            }
            run(catalog, &settings, &scenario, offline_robots).await
        },
        Commands::Explain { scenario, wafers } => {
            if let Some(n) = wafers {
                settings.total_wafers = n;
            }
            explain(catalog, &settings, scenario.as_deref())
        },
    }
}

fn validate(catalog: &RuleCatalog) -> Result<()> {
    println!(
        "{} {} v{} ({} rules)",
        "Catalog".bright_cyan(),
        catalog.id.bold(),
        catalog.version,
        catalog.rules.len()
    );

    for index in catalog.execution_order() {
        let rule = &catalog.rules[index];
        println!(
            "  {:>4}  {:<28} {} -> {}  [{}]",
            rule.priority,
            rule.id,
            rule.from,
            rule.to,
            fab_rules::format_condition(&rule.conditions).dimmed()
        );
    }

    let warnings = catalog.validate();
    if warnings.is_empty() {
        println!("{} no warnings", "OK".bright_green());
    } else {
        for warning in &warnings {
            println!("{} {}", "WARN".yellow(), warning);
        }
        println!("{} {} warning(s)", "DONE".bright_yellow(), warnings.len());
    }
    Ok(())
}

async fn run(
    catalog: Arc<RuleCatalog>,
    settings: &FabsimConfig,
    scenario_path: &Path,
    offline_robots: Vec<String>,
) -> Result<()> {
    let scenario = Scenario::load(scenario_path)?;
    let total_wafers = scenario.total_wafers.unwrap_or(settings.total_wafers);
    if let Some(description) = &scenario.description {
        println!("{} {}", "Scenario".bright_cyan(), description);
    }

    let (sink, mut events) = ChannelSink::new();
    let mut engine = RuleEngine::new(Arc::clone(&catalog), total_wafers, Arc::new(sink));

    let mut transfers = None;
    if settings.use_scheduler {
        let (scheduler, rx) = SimScheduler::new(offline_robots);
        engine = engine.with_scheduler(Arc::new(scheduler));
        transfers = Some(rx);
    }
    if let Some(dir) = &settings.rule_log_dir {
        engine = engine.with_logger(Arc::new(RuleLogger::new(dir, &catalog.id)));
    }

    let (handle, task) = spawn_engine(engine);

    for (i, step) in scenario.steps.iter().enumerate() {
        println!("{} {}", format!("[{:>3}]", i + 1).dimmed(), step);
        apply_step(&handle, step)?;
        // Round trip so the step is fully processed before draining
        handle.status().await?;
        drain_events(&mut events);
        if let Some(rx) = transfers.as_mut() {
            drain_transfers(rx);
        }
    }

    let status = handle.shutdown().await?;
    task.await.context("Engine task panicked")?;
    print_status(&status);
    Ok(())
}

fn explain(
    catalog: Arc<RuleCatalog>,
    settings: &FabsimConfig,
    scenario_path: Option<&Path>,
) -> Result<()> {
    let scenario = match scenario_path {
        Some(path) => Scenario::load(path)?,
        None => Scenario::default(),
    };
    let total_wafers = scenario.total_wafers.unwrap_or(settings.total_wafers);

    let mut engine = RuleEngine::new(catalog, total_wafers, Arc::new(NullSink));
    engine.pause();
    for step in &scenario.steps {
        match step {
            ScenarioStep::Station {
                station,
                state,
                wafer_id,
            } => engine.on_station_status(station, state, *wafer_id),
            ScenarioStep::Robot {
                robot,
                state,
                wafer_id,
                waiting_for,
            } => engine.on_robot_status(robot, state, *wafer_id, waiting_for.as_deref()),
            ScenarioStep::Reset { carrier_id } => engine.reset(carrier_id.as_deref()),
            // Execution stays suppressed
            ScenarioStep::Pause | ScenarioStep::Resume { .. } => {},
        }
    }

    for result in engine.explain() {
        let verdict = if result.result {
            "TRUE ".bright_green()
        } else {
            "FALSE".red()
        };
        println!(
            "{} {:>4}  {:<28} {}",
            verdict, result.priority, result.rule_id, result.expression
        );
    }
    Ok(())
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<OutboundEvent>) {
    while let Ok(event) = events.try_recv() {
        let line = match &event {
            OutboundEvent::RobotCommand {
                robot,
                command,
                wafer_id,
                from,
                to,
            } => format!(
                "{} {} wafer {} {} -> {}",
                robot.bold(),
                command,
                wafer_id,
                from,
                to
            )
            .bright_green(),
            OutboundEvent::DestinationReady { robot } => {
                format!("{} destination ready", robot.bold()).bright_blue()
            },
            OutboundEvent::CarrierWaferCompleted {
                carrier_id,
                wafer_id,
            } => format!(
                "wafer {} completed (carrier {})",
                wafer_id,
                carrier_id.as_deref().unwrap_or("-")
            )
            .cyan(),
            OutboundEvent::AllWafersCompleted { carrier_id, total } => format!(
                "all {} wafers completed (carrier {})",
                total,
                carrier_id.as_deref().unwrap_or("-")
            )
            .bright_magenta()
            .bold(),
        };
        println!("      {} {}", "=>".dimmed(), line);
    }
}

fn drain_transfers(rx: &mut mpsc::UnboundedReceiver<TransferRequest>) {
    while let Ok(request) = rx.try_recv() {
        println!(
            "      {} transfer wafer {} {} -> {} (priority {}, robot {})",
            "=>".dimmed(),
            request.wafer_id,
            request.from,
            request.to,
            request.priority,
            request.preferred_robot.as_deref().unwrap_or("any")
        );
    }
}

fn print_status(status: &EngineStatus) {
    println!();
    println!("{}", "Engine status".bright_cyan());
    println!("  paused:          {}", status.paused);
    println!(
        "  carrier:         {}",
        status.carrier_id.as_deref().unwrap_or("-")
    );
    println!(
        "  wafers:          {} pending, {} / {} completed",
        status.pending, status.completed, status.total_wafers
    );
    println!(
        "  passes:          {} run, {} skipped",
        status.evaluation_passes, status.skipped_passes
    );
    println!("  rules executed:  {}", status.rules_executed);
    for (robot, destination) in &status.waiting_robots {
        println!("  waiting:         {} for {}", robot, destination);
    }
    if !status.pending_commands.is_empty() {
        println!("  busy:            {}", status.pending_commands.join(", "));
    }
}
