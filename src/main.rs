use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use sbkd::config::AppConfig;
use sbkd::context::AppContext;
use sbkd::core::schedule::{Schedule, calculate_next_run, parse_timezone};
use sbkd::core::{Dispatcher, JobStatus, Orchestrator, dispatcher, reconcile};
use sbkd::db::SqliteStore;
use sbkd::logging;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sbkd")]
#[command(about = "Site backup scheduler and pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, dispatcher and maintenance loops until Ctrl-C
    Daemon,
    /// Back up one site now and wait for the result
    Run {
        #[arg(long)]
        site: i64,
    },
    /// Compare tracked storage usage with the remote store
    Reconcile {
        #[arg(long)]
        site: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show when a schedule fires next
    NextRun(NextRunArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// TOML configuration file
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip)]
    #[arg(long, global = true)]
    verbose: bool,

    #[serde(skip)]
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    global: &'a GlobalArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<LogOverrides>,
}

#[derive(Serialize)]
struct LogOverrides {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    verbose: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    json: bool,
}

impl GlobalArgs {
    fn overrides(&self) -> Overrides<'_> {
        let log = (self.verbose || self.json).then_some(LogOverrides {
            verbose: self.verbose,
            json: self.json,
        });
        Overrides { global: self, log }
    }
}

#[derive(Args)]
struct NextRunArgs {
    /// manual, daily, weekly or monthly
    #[arg(long)]
    frequency: String,
    /// Local time of day, HH:MM
    #[arg(long, default_value = "02:00")]
    time: String,
    /// Weekday indices (0 = Monday) for weekly, day of month for monthly
    #[arg(long)]
    days: Option<String>,
    #[arg(long, default_value = "UTC")]
    timezone: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.global.config.as_deref(), Some(&cli.global.overrides()))?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::NextRun(args) => print_next_run(&args),
        Commands::Daemon => {
            logging::init(&config.log);
            let ctx = open_context(config).await?;
            Orchestrator::new(ctx)
                .start()
                .await
                .context("Failed to start daemon")
        }
        Commands::Run { site } => {
            logging::init(&config.log);
            let ctx = open_context(config).await?;
            run_site(ctx, site).await
        }
        Commands::Reconcile { site, dry_run } => {
            logging::init(&config.log);
            let dry_run = dry_run || config.retention.dry_run;
            let ctx = open_context(config).await?;
            run_reconcile(ctx, site, dry_run).await
        }
    }
}

async fn open_context(config: AppConfig) -> Result<AppContext> {
    let store = SqliteStore::open(&config.database_path).await?;
    Ok(AppContext::new(config, Arc::new(store)))
}

async fn run_site(ctx: AppContext, site_id: i64) -> Result<()> {
    let dispatcher = Dispatcher::new(ctx.clone());
    dispatcher::trigger_site(&ctx, site_id).await?;

    let (job, status) = loop {
        if let Some(done) = dispatcher.run_next().await {
            break done;
        }
    };

    println!("Job {} for {}: {}", job.id, job.target_name, status);
    for stage in &job.stages {
        if let Some(result) = job.stage_results.get(stage) {
            println!(
                "  {:<14} {:<9} {:>6}ms  {}",
                stage,
                format!("{:?}", result.status),
                result.duration.as_millis(),
                result.message
            );
        }
    }
    if let Some(error) = &job.error_message {
        println!("Error: {}", error);
    }

    ctx.governor.shutdown().await;
    if status != JobStatus::Completed {
        return Err(anyhow!("Backup of site {} ended {}", site_id, status));
    }
    Ok(())
}

async fn run_reconcile(ctx: AppContext, site_id: Option<i64>, dry_run: bool) -> Result<()> {
    let output = match site_id {
        Some(id) => {
            let site = ctx
                .store
                .get_site(id)
                .await?
                .ok_or_else(|| anyhow!("Site {} not found", id))?;
            let report = reconcile::reconcile_site(&ctx, &site, dry_run).await?;
            serde_json::to_string_pretty(&report)?
        }
        None => {
            let summary = reconcile::reconcile_all(&ctx, dry_run).await?;
            serde_json::to_string_pretty(&summary)?
        }
    };
    println!("{}", output);
    Ok(())
}

fn print_next_run(args: &NextRunArgs) -> Result<()> {
    let schedule = Schedule::parse(&args.frequency, &args.time, args.days.as_deref())?;
    let tz = parse_timezone(&args.timezone)?;
    let now = Utc::now().with_timezone(&tz);

    match calculate_next_run(&schedule, now) {
        Some(next) => {
            println!("{} ({})", next.to_rfc3339(), next.with_timezone(&tz));
            if schedule.is_fallback() {
                println!("Warning: --days was not usable, the default selection applies");
            }
        }
        None => println!("Manual schedule: no automatic run"),
    }
    Ok(())
}
