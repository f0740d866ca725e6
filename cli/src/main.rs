use std::{path::PathBuf, process::ExitCode, time::Duration};

use nbm::{
    config::Settings,
    driver::Pipeline,
    error::Result,
    queue::{QueueSet, RegistryClient, RegistryServer},
    servant::{Context, Servant},
    steps,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Distributed broadband coverage pipeline.
#[derive(Debug, clap::Parser)]
struct Args {
    /// Process configuration: steps, inputs, tiers and geographies.
    #[clap(long, env = "NBM_CONFIG", default_value = "nbm2_config.json")]
    config: PathBuf,

    /// Database and queue connection settings.
    #[clap(long, env = "NBM_DB_CONFIG", default_value = "nbm2_db_config.json")]
    db_config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve the shared queues to the master and every servant.
    Queue,
    /// Run work items until the master sends this process home.
    Servant {
        /// Name reported with every result.
        #[clap(long, env = "HOSTNAME")]
        name: Option<String>,
    },
    /// Run the enabled steps.
    Master,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = <Args as clap::Parser>::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let settings = Settings::load(&args.config, &args.db_config)?;
    info!(config = %settings.short_digest(), "configuration loaded");

    match args.command {
        Command::Queue => {
            let server = RegistryServer::bind(&settings.queue)?;
            tokio::signal::ctrl_c().await?;
            info!("closing queue registry");
            server.close();
            server.wait_idle().await;
            Ok(true)
        }
        Command::Servant { name } => {
            let host = name.unwrap_or_else(|| format!("servant-{}", std::process::id()));
            let client = RegistryClient::connect_with_retry(&settings.queue, 30, Duration::from_secs(2)).await?;
            let queues = QueueSet::remote(client);
            Servant::new(queues, Context::new(settings, host), steps::handlers())
                .run()
                .await?;
            Ok(true)
        }
        Command::Master => {
            let queues = QueueSet::connect(&settings.queue).await?;
            queues.purge_all().await?;
            Pipeline::new(settings, queues).run().await
        }
    }
}
