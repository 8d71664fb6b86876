use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use taskweave::core::{Agent, AtomicTask, TaskArena};
use taskweave::orchestration::AgentRegistry;
use taskweave::scheduling::{analyze, ExecutionPlanner};
use taskweave::{EngineConfig, Result};

/// Taskweave - dependency-aware task scheduler for agent workflows
#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKWEAVE_DEBUG=1     Enable debug logging (alternative to --debug)\n    TASKWEAVE_LOG=<filter> Full tracing filter directive (e.g. taskweave=trace)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build an execution plan and print it as JSON
    Plan {
        /// JSON file holding the task list
        #[arg(long)]
        tasks: PathBuf,

        /// JSON file holding the agent list
        #[arg(long)]
        agents: PathBuf,

        /// TOML config file (defaults to the user config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Report dependency cycles and the resolved topological order
    Analyze {
        /// JSON file holding the task list
        #[arg(long)]
        tasks: PathBuf,
    },

    /// Print the default configuration as TOML
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    taskweave::log::init(cli.debug);

    let outcome = match cli.command {
        Command::Plan {
            tasks,
            agents,
            config,
        } => run_plan(&tasks, &agents, config.as_deref()),
        Command::Analyze { tasks } => run_analyze(&tasks),
        Command::Config => run_config(),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            let report = serde_json::json!({
                "error": e.kind().as_str(),
                "message": e.to_string(),
            });
            println!("{}", report);
            ExitCode::FAILURE
        }
    }
}

/// Read a JSON array from disk.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    debug!(path = %path.display(), "reading input");
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn run_plan(tasks: &Path, agents: &Path, config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    let tasks: Vec<AtomicTask> = read_json(tasks)?;
    let agents: Vec<Agent> = read_json(agents)?;

    let registry = AgentRegistry::with_agents(config.health.clone(), agents);
    let plan = ExecutionPlanner::new(&config).plan(tasks, &registry)?;
    println!("{}", plan.to_json()?);
    Ok(())
}

fn run_analyze(tasks: &Path) -> Result<()> {
    let tasks: Vec<AtomicTask> = read_json(tasks)?;
    let mut arena = TaskArena::from_tasks(tasks);
    let analysis = analyze(&mut arena);

    let output = serde_json::json!({
        "report": analysis.report,
        "order": analysis.order,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_config() -> Result<()> {
    print!("{}", toml::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}
