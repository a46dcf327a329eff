use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crs_core::Scope;
use crs_sync::{maybe_build_scheduler, EngineContext, SyncConfig};
use crs_web::{AppState, StaticTokenAuthenticator};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "crs-cli")]
#[command(about = "Carbon Record Store production summary tools")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API; also runs the daily job when the scheduler is enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Recompute summaries once, for one group or for every group.
    Recompute {
        #[arg(long)]
        group_id: Option<String>,
    },
    /// Create the entity tables in the configured database.
    Migrate,
    /// Run only the daily scheduler until interrupted.
    Schedule,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow::anyhow!("initializing tracing: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Recompute { group_id: None }) {
        Commands::Serve { port } => {
            let context = EngineContext::from_config(&config).await?;
            let scheduler = maybe_build_scheduler(&config, Arc::clone(&context.engine)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.summary_cron, "daily production sum scheduled");
            }

            let auth = StaticTokenAuthenticator::from_env();
            if !auth.is_enabled() {
                warn!("CRS_API_TOKEN not set; authenticated endpoints will reject every request");
            }
            let state = AppState::from_context(&context, Arc::new(auth));
            crs_web::serve(state, port.unwrap_or_else(crs_web::port_from_env)).await?;
        }
        Commands::Recompute { group_id } => {
            let scope = match group_id {
                Some(id) if !id.trim().is_empty() => Scope::Group(id.trim().to_string()),
                Some(_) => bail!("--group-id must not be empty"),
                None => Scope::All,
            };
            let context = EngineContext::from_config(&config).await?;
            let summary = context
                .engine
                .run(scope.clone())
                .await
                .with_context(|| format!("production sum run for {scope}"))?;
            println!(
                "recompute complete: run_id={} scope={} read={} dropped={} deleted={} inserted={} failed_deletes={}",
                summary.run_id,
                summary.scope,
                summary.records_read,
                summary.records_dropped,
                summary.report.deleted,
                summary.report.inserted,
                summary.report.failed_deletes.len()
            );
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; nothing to migrate");
            };
            let store = crs_storage::PgEntityStore::connect(url).await?;
            store.migrate().await.context("creating entity tables")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let context = EngineContext::from_config(&config).await?;
            let Some(sched) = maybe_build_scheduler(&config, Arc::clone(&context.engine)).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.summary_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
