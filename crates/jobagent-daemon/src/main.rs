use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobagent_core::{config::JobAgentConfig, store::StoreConnector, JobId};
use jobagent_scheduler::{AgentContext, LogMailer, SchedulerEngine};
use jobagent_store::SqliteConnector;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "jobagent")]
#[command(version)]
#[command(about = "Runs scheduled SQL and batch jobs from a shared job store")]
struct Cli {
    /// Config file. Falls back to $JOBAGENT_CONFIG, then ~/.jobagent/jobagent.toml
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent until Ctrl-C (default)
    Run,

    /// Ask whichever agent is running a job to abort it
    Kill {
        /// Id of the job to abort
        job_id: JobId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobagent=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > JOBAGENT_CONFIG env > ~/.jobagent/jobagent.toml
    let config_path = cli.config.or_else(|| std::env::var("JOBAGENT_CONFIG").ok());
    let config = JobAgentConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobAgentConfig::default()
    });

    let connector = Arc::new(SqliteConnector::new(&config));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, connector).await,
        Command::Kill { job_id } => {
            let mut store = connector.connect()?;
            store.notify_kill_job(job_id)?;
            info!(job_id, "kill request published");
            Ok(())
        }
    }
}

async fn run(config: JobAgentConfig, connector: Arc<SqliteConnector>) -> anyhow::Result<()> {
    info!(
        data_dir = %config.database.data_dir.display(),
        store = %config.database.name,
        "starting job agent"
    );

    let mailer = Arc::new(LogMailer::new(&config.email));
    let ctx = AgentContext::new(config, connector, mailer);
    let engine = SchedulerEngine::new(ctx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping running jobs");

    // signal the engine, then wait for running jobs to record their status
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    info!("job agent stopped");
    Ok(())
}
