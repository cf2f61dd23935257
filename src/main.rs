//! Command-line entry point: dry-run brokerage over world snapshots.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::RngCore;
use serde::Serialize;

use taskbroker::broker::TaskMetadata;
use taskbroker::snapshot::WorldSnapshot;

/// Taskbroker: task-to-cloud assignment for a production workload grid.
///
/// Replays a serialised world snapshot through the full brokerage decision,
/// so operators can inspect and reproduce placements offline.
#[derive(Parser, Debug)]
#[command(name = "taskbroker")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one brokerage decision against a snapshot.
    #[command(after_help = r#"Examples:
  taskbroker assign --snapshot world.json               # decide with a random seed
  taskbroker assign --snapshot world.json --seed 42     # reproducible decision
  taskbroker --format json assign --snapshot world.json | jq .cloud
"#)]
    Assign {
        /// Path to the world snapshot JSON file.
        #[arg(short, long, env = "TASKBROKER_SNAPSHOT")]
        snapshot: PathBuf,

        /// Seed for the weighted draw and probe sampling.
        ///
        /// Defaults to a random seed; pass one to reproduce a decision.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the topology and claim state of a snapshot without probing.
    Inspect {
        /// Path to the world snapshot JSON file.
        #[arg(short, long, env = "TASKBROKER_SNAPSHOT")]
        snapshot: PathBuf,
    },
}

/// Outcome report for the `assign` command.
#[derive(Debug, Serialize)]
struct AssignReport {
    /// Task that was brokered.
    task_id: u64,
    /// Decision outcome: `assigned`, `unassigned`, or `failed`.
    outcome: &'static str,
    /// Chosen cloud, when assigned.
    cloud: Option<String>,
    /// Error description, when failed.
    error: Option<String>,
    /// Subscriptions registered during the decision.
    subscriptions: Vec<(String, String)>,
    /// Replica refreshes fired during the decision.
    refreshes: usize,
    /// Seed the decision ran with.
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("building runtime")?;
    match cli.command {
        Commands::Assign { snapshot, seed } => {
            let world = WorldSnapshot::load(&snapshot)?;
            let seed = seed.unwrap_or_else(|| rand::thread_rng().next_u64());
            let report = runtime.block_on(run_assign(&world, seed));
            emit(&cli.format, &report)
        }
        Commands::Inspect { snapshot } => {
            let world = WorldSnapshot::load(&snapshot)?;
            inspect(&cli.format, &world)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_assign(world: &WorldSnapshot, seed: u64) -> AssignReport {
    let task_id = world.task.task_id;
    let base = AssignReport {
        task_id,
        outcome: "failed",
        cloud: None,
        error: None,
        subscriptions: Vec::new(),
        refreshes: 0,
        seed,
    };
    let (mut assigner, state) = match world.assigner(seed) {
        Ok(pair) => pair,
        Err(err) => {
            return AssignReport {
                error: Some(err.to_string()),
                ..base
            };
        }
    };
    let meta = match TaskMetadata::parse(task_id, &world.metadata) {
        Ok(meta) => meta,
        Err(err) => {
            return AssignReport {
                error: Some(err.to_string()),
                ..base
            };
        }
    };
    let result = assigner.assign(&meta).await;
    let subscriptions = state.registered_subscriptions();
    let refreshes = state.refreshes().len();
    match result {
        Ok(Some(cloud)) => AssignReport {
            outcome: "assigned",
            cloud: Some(cloud),
            subscriptions,
            refreshes,
            ..base
        },
        Ok(None) => AssignReport {
            outcome: "unassigned",
            subscriptions,
            refreshes,
            ..base
        },
        Err(err) => AssignReport {
            error: Some(err.to_string()),
            subscriptions,
            refreshes,
            ..base
        },
    }
}

#[allow(clippy::print_stdout)]
fn emit(format: &str, report: &AssignReport) -> anyhow::Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("task {}: {}", report.task_id, report.outcome);
        if let Some(cloud) = &report.cloud {
            println!("  cloud: {cloud}");
        }
        if let Some(error) = &report.error {
            println!("  error: {error}");
        }
        for (dataset, endpoint) in &report.subscriptions {
            println!("  subscribed: {dataset} -> {endpoint}");
        }
        if report.refreshes > 0 {
            println!("  replica refreshes: {}", report.refreshes);
        }
        println!("  seed: {}", report.seed);
    }
    if report.outcome == "failed" {
        anyhow::bail!("decision failed");
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn inspect(format: &str, world: &WorldSnapshot) -> anyhow::Result<()> {
    if format == "json" {
        #[derive(Serialize)]
        struct InspectReport<'a> {
            task_id: u64,
            clouds: Vec<&'a str>,
            sites: Vec<&'a str>,
            claims: &'a [taskbroker::CloudTask],
        }
        let report = InspectReport {
            task_id: world.task.task_id,
            clouds: world.clouds.iter().map(|c| c.name.as_str()).collect(),
            sites: world.sites.iter().map(|s| s.name.as_str()).collect(),
            claims: &world.claims,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("task {}", world.task.task_id);
    for cloud in &world.clouds {
        println!(
            "cloud {:<6} status={:<10} mcshare={:<5} T1={} sites={}",
            cloud.name,
            cloud.status,
            cloud.mcshare,
            cloud.source,
            cloud.sites.join(",")
        );
    }
    for claim in &world.claims {
        println!(
            "claim task={} status={} cloud={}",
            claim.task_id,
            claim.status.as_str(),
            claim.cloud.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
