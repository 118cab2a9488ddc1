use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use harvest_collectors::default_registry;
use harvest_core::{ConfigMap, Frequency, NewSchedule, WatermarkKey};
use harvest_storage::{MemoryStore, PgStore, Store};
use harvest_sync::{
    AgeThresholds, DomainTable, HarvestConfig, Orchestrator, RefreshQueue, Scheduler, SchedulerOptions, StaleEntity,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Ingestion orchestrator for public data sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one source now and wait for it.
    Run {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        source: String,
        /// Job config as a JSON object.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run every domain in order (or only the named ones).
    FullSync {
        #[arg(long = "domain")]
        domains: Vec<String>,
    },
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    #[command(subcommand)]
    Watermark(WatermarkCommand),
    /// Rank collected sources by staleness.
    QueueStale {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the scheduler until interrupted.
    Daemon,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Add(AddSchedule),
    List {
        #[arg(long)]
        active: bool,
    },
    Enable {
        id: Uuid,
    },
    Disable {
        id: Uuid,
    },
    Delete {
        id: Uuid,
    },
    /// Trigger a schedule immediately and wait for its job.
    Fire {
        id: Uuid,
    },
}

#[derive(Debug, Args)]
struct AddSchedule {
    #[arg(long)]
    name: String,
    #[arg(long)]
    source: String,
    /// hourly, daily, weekly, monthly, quarterly or custom
    #[arg(long)]
    frequency: String,
    #[arg(long)]
    hour: Option<u32>,
    /// 0 = Monday
    #[arg(long)]
    day_of_week: Option<u32>,
    #[arg(long)]
    day_of_month: Option<u32>,
    #[arg(long)]
    cron: Option<String>,
    #[arg(long)]
    priority: Option<i32>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Subcommand)]
enum WatermarkCommand {
    List,
    Clear {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        region: Option<String>,
    },
}

fn parse_config(raw: Option<&str>) -> Result<ConfigMap> {
    match raw {
        Some(text) => serde_json::from_str(text).context("--config must be a JSON object"),
        None => Ok(ConfigMap::new()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &HarvestConfig) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using an in-memory store; nothing will persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_orchestrator(config: HarvestConfig) -> Result<Orchestrator> {
    let domains_path = config.domains_path();
    let domains = DomainTable::load_or_builtin(&domains_path)
        .with_context(|| format!("loading {}", domains_path.display()))?;
    let store = open_store(&config).await?;
    Ok(Orchestrator::new(store, default_registry(), domains, config))
}

async fn schedule_command(scheduler: &Scheduler, command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::Add(add) => {
            let schedule = scheduler
                .register_schedule(NewSchedule {
                    name: add.name,
                    source: add.source,
                    config: parse_config(add.config.as_deref())?,
                    frequency: Frequency::from(add.frequency),
                    hour: add.hour,
                    day_of_week: add.day_of_week,
                    day_of_month: add.day_of_month,
                    cron_expression: add.cron,
                    priority: add.priority,
                    is_active: !add.inactive,
                })
                .await?;
            print_json(&schedule)
        }
        ScheduleCommand::List { active } => print_json(&scheduler.list_schedules(active).await?),
        ScheduleCommand::Enable { id } => print_json(&scheduler.set_active(id, true).await?),
        ScheduleCommand::Disable { id } => print_json(&scheduler.set_active(id, false).await?),
        ScheduleCommand::Delete { id } => {
            if !scheduler.delete_schedule(id).await? {
                bail!("schedule {id} not found");
            }
            println!("deleted {id}");
            Ok(())
        }
        ScheduleCommand::Fire { id } => match scheduler.run_scheduled_job(id).await? {
            Some(handle) => print_json(&handle.wait().await?),
            None => bail!("schedule {id} is missing or inactive"),
        },
    }
}

async fn run_daemon(scheduler: Scheduler) -> Result<()> {
    if !scheduler.orchestrator().config().scheduler_enabled {
        bail!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=true to run the daemon");
    }
    scheduler.start().await.context("starting scheduler")?;
    info!("daemon running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    if let Commands::Migrate = cli.command {
        let Some(url) = config.database_url.as_deref() else {
            bail!("DATABASE_URL is required for migrate");
        };
        PgStore::connect(url)
            .await
            .context("connecting to DATABASE_URL")?
            .migrate()
            .await
            .context("applying migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    let options = SchedulerOptions::from_config(&config);
    let orchestrator = build_orchestrator(config).await?;

    match cli.command {
        Commands::Run { domain, source, config } => {
            let job_config = parse_config(config.as_deref())?;
            let result = orchestrator.run_one(&domain, &source, job_config).await?;
            print_json(&result)?;
        }
        Commands::FullSync { domains } => {
            let selected = (!domains.is_empty()).then_some(domains.as_slice());
            print_json(&orchestrator.run_full_sync(selected).await)?;
        }
        Commands::Schedule(command) => {
            schedule_command(&Scheduler::new(orchestrator, options), command).await?;
        }
        Commands::Watermark(WatermarkCommand::List) => {
            print_json(&orchestrator.store().list_watermarks().await?)?;
        }
        Commands::Watermark(WatermarkCommand::Clear { domain, source, region }) => {
            let key = WatermarkKey::new(domain, source, region.as_deref());
            if orchestrator.store().clear_watermark(&key).await? {
                println!("cleared {key}");
            } else {
                println!("no watermark for {key}");
            }
        }
        Commands::QueueStale { limit } => {
            let watermarks = orchestrator.store().list_watermarks().await?;
            let queue = RefreshQueue::new();
            let queued = queue.enqueue_stale(
                watermarks.iter().map(StaleEntity::from),
                Utc::now(),
                &AgeThresholds::default(),
            );
            info!(queued, stats = ?queue.stats(), "stale entities ranked");
            let tasks: Vec<_> = std::iter::from_fn(|| queue.pop()).take(limit).collect();
            print_json(&tasks)?;
        }
        Commands::Daemon => run_daemon(Scheduler::new(orchestrator, options)).await?,
        Commands::Migrate => {}
    }

    Ok(())
}
