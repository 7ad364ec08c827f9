use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dmoga::{
  broker::{amqp::AmqpBroker, Broker},
  config::{Settings, OPTIMIZATION_ID},
  orchestrator::Orchestrator,
  pool::docker::DockerRuntime,
  runner::{run_job, Outcome},
  worker::{run_worker, ProcessSimulator},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Distributed multi-objective optimization.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
  /// Json settings file, overridden by environment variables.
  #[arg(long, global = true, env = "DMOGA_CONFIG")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Accepts job requests and manages the containers of every job.
  Orchestrator,
  /// Runs the search engine of one job.
  Runner {
    #[arg(long, env = OPTIMIZATION_ID)]
    optimization_id: String,
  },
  /// Evaluates candidates of one job with an external simulation program.
  Worker {
    /// Program that reads a request on stdin and prints a fitness array.
    program: PathBuf,
    args: Vec<String>,
  },
}

async fn connect(settings: &Settings) -> Result<Arc<dyn Broker>> {
  let broker = AmqpBroker::connect(&settings.amqp_uri())
    .await
    .with_context(|| format!("failed to connect to {}", settings.rabbitmq_host))?;
  Ok(Arc::new(broker))
}

async fn run(cli: Cli) -> Result<ExitCode> {
  let settings = Settings::load(cli.config.as_deref()).context("invalid settings")?;
  let broker = connect(&settings).await?;

  match cli.command {
    Command::Orchestrator => {
      let runtime = DockerRuntime::connect().await?;
      Orchestrator::new(settings, broker, Arc::new(runtime))
        .serve()
        .await?;
      Ok(ExitCode::SUCCESS)
    }
    Command::Runner { optimization_id } => {
      match run_job(&settings, &optimization_id, broker).await? {
        Outcome::Succeeded => Ok(ExitCode::SUCCESS),
        // the failure is already published
        Outcome::Failed => Ok(ExitCode::from(1)),
      }
    }
    Command::Worker { program, args } => {
      let simulator = ProcessSimulator::new(program, args);
      let answered = run_worker(broker, &settings.scoped_queues(), &simulator).await?;
      info!(answered, "worker done");
      Ok(ExitCode::SUCCESS)
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  match run(Cli::parse()).await {
    Ok(code) => code,
    Err(err) => {
      error!("{err:#}");
      ExitCode::from(2)
    }
  }
}
