//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kwengine_api::AppState;
use kwengine_core::enrichment::{BatchOptions, EnrichmentProgress, run_recorded_batch};
use kwengine_core::reconcile;
use kwengine_limiter::RateLimiter;
use kwengine_shared::{
    AppConfig, Device, DynamicsPeriod, LimiterConfig, init_config, load_config,
    resolve_api_token,
};
use kwengine_stats::StatsClient;
use kwengine_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kwengine: search-volume enrichment and keyword cluster reconciliation.
#[derive(Parser)]
#[command(
    name = "kwengine",
    version,
    about = "Enrich keyword phrases with search-volume statistics and reconcile subcluster overlap.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch search volumes (and optionally regions and dynamics) for phrases.
    Enrich {
        /// Phrases to enrich.
        phrases: Vec<String>,

        /// File with one phrase per line.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Region ids (comma-separated). Defaults to the configured filter.
        #[arg(long, value_delimiter = ',')]
        regions: Option<Vec<u32>>,

        /// Devices: all, desktop, phone, tablet (comma-separated).
        #[arg(long, value_delimiter = ',')]
        devices: Option<Vec<Device>>,

        /// Also fetch the regional breakdown.
        #[arg(long)]
        include_regions: bool,

        /// Also fetch volume dynamics.
        #[arg(long)]
        include_dynamics: bool,

        /// Dynamics period: daily, weekly or monthly.
        #[arg(long)]
        period: Option<DynamicsPeriod>,

        /// Write the JSON outcome here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Resolve keyword overlap between all stored subclusters.
    Reconcile {
        /// Print the last stored result without recomputing.
        #[arg(long)]
        cached: bool,

        /// Print a readable per-pair summary instead of JSON.
        #[arg(long)]
        summary: bool,
    },

    /// Subcluster snapshot management.
    Snapshots {
        #[command(subcommand)]
        action: SnapshotsAction,
    },

    /// List recent enrichment batches.
    Jobs {
        /// How many jobs to show.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Start the HTTP API.
    Serve {
        /// Address to bind (defaults to `[server] bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Snapshot subcommands.
#[derive(Subcommand)]
pub(crate) enum SnapshotsAction {
    /// Import a JSON array of snapshots; malformed entries are skipped.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },
    /// List stored snapshots.
    List,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kwengine=info",
        1 => "kwengine=debug",
        _ => "kwengine=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Enrich {
            phrases,
            file,
            regions,
            devices,
            include_regions,
            include_dynamics,
            period,
            out,
        } => {
            let config = load_config()?;
            let mut options = BatchOptions::from(&config.enrichment);
            if let Some(regions) = regions {
                options.regions = regions;
            }
            if let Some(devices) = devices {
                options.devices = devices;
            }
            if let Some(period) = period {
                options.dynamics_period = period;
            }
            options.include_regions = include_regions;
            options.include_dynamics = include_dynamics;

            cmd_enrich(&config, phrases, file.as_deref(), &options, out.as_deref()).await
        }
        Command::Reconcile { cached, summary } => cmd_reconcile(cached, summary).await,
        Command::Snapshots { action } => match action {
            SnapshotsAction::Import { file } => cmd_snapshots_import(&file).await,
            SnapshotsAction::List => cmd_snapshots_list().await,
        },
        Command::Jobs { limit } => cmd_jobs(limit).await,
        Command::Serve { bind } => cmd_serve(bind).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = config.storage.resolved_db_path()?;
    Ok(Storage::open(&path).await?)
}

/// Storage for commands that only inspect.
async fn open_storage_for_reading(config: &AppConfig) -> Result<Storage> {
    let path = config.storage.resolved_db_path()?;
    Ok(Storage::open_for_reading(&path).await?)
}

fn stats_client(config: &AppConfig) -> Result<StatsClient> {
    let token = resolve_api_token(config);
    if token.is_none() {
        warn!(
            env = %config.stats.token_env,
            "no statistics token set; enrichment will fail"
        );
    }
    Ok(StatsClient::from_config(&config.stats, token)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_enrich(
    config: &AppConfig,
    mut phrases: Vec<String>,
    file: Option<&Path>,
    options: &BatchOptions,
    out: Option<&Path>,
) -> Result<()> {
    if let Some(file) = file {
        let content = std::fs::read_to_string(file)
            .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;
        phrases.extend(content.lines().map(String::from));
    }
    if phrases.is_empty() {
        return Err(eyre!("no phrases given: pass them as arguments or with --file"));
    }

    let storage = open_storage(config).await?;
    let provider = stats_client(config)?;
    let limiter = RateLimiter::new(LimiterConfig::from(config));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight calls");
                cancel.cancel();
            }
        });
    }

    info!(phrases = phrases.len(), "starting enrichment");
    let reporter = CliProgress::new();
    let outcome = run_recorded_batch(
        &storage,
        &provider,
        &limiter,
        &phrases,
        options,
        &cancel,
        &reporter,
    )
    .await;
    reporter.finish();
    let outcome = outcome?;

    let json = serde_json::to_string_pretty(&outcome)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| eyre!("cannot write {}: {e}", path.display()))?;
            println!();
            println!("  Enrichment finished{}", if outcome.cancelled { " (cancelled)" } else { "" });
            println!("  Total:     {}", outcome.total);
            println!("  Processed: {}", outcome.processed);
            println!("  Errors:    {}", outcome.errors.len());
            println!("  Output:    {}", path.display());
            println!();
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_reconcile(cached: bool, summary: bool) -> Result<()> {
    let config = load_config()?;

    if cached {
        let storage = open_storage_for_reading(&config).await?;
        if summary {
            let document = storage.read_reconciliation().await?;
            print!("{}", reconcile::summary(&document));
        } else {
            println!("{}", reconcile::cached_json(&storage).await?);
        }
        return Ok(());
    }

    let storage = open_storage(&config).await?;
    let document = reconcile::reconcile(&storage).await?;
    if summary {
        print!("{}", reconcile::summary(&document));
    } else {
        println!("{}", serde_json::to_string_pretty(&document)?);
    }
    Ok(())
}

async fn cmd_snapshots_import(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;
    let snapshots = reconcile::parse_snapshot_document(&content)?;

    let config = load_config()?;
    let storage = open_storage(&config).await?;
    for snapshot in &snapshots {
        storage.upsert_snapshot(snapshot).await?;
    }

    info!(imported = snapshots.len(), file = %file.display(), "snapshots imported");
    println!("Imported {} snapshot(s) from {}", snapshots.len(), file.display());
    Ok(())
}

async fn cmd_snapshots_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_for_reading(&config).await?;
    let snapshots = storage.list_snapshots().await?;

    if snapshots.is_empty() {
        println!("No snapshots stored.");
        return Ok(());
    }
    println!("{:<24} {:<28} {:<20} {:>8}", "ID", "NAME", "CLUSTER", "PHRASES");
    for s in snapshots {
        println!(
            "{:<24} {:<28} {:<20} {:>8}",
            s.subcluster_id,
            s.subcluster_name,
            s.cluster_name,
            s.filtered_queries.len()
        );
    }
    Ok(())
}

async fn cmd_jobs(limit: u32) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_for_reading(&config).await?;
    let jobs = storage.list_enrichment_jobs(limit).await?;

    if jobs.is_empty() {
        println!("No enrichment jobs recorded.");
        return Ok(());
    }
    for job in jobs {
        let finished = job
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "running".into());
        let stats = job.stats.map(|s| s.to_string()).unwrap_or_default();
        println!("{}  {}  {}  {}", job.id, job.started_at.to_rfc3339(), finished, stats);
    }
    Ok(())
}

async fn cmd_serve(bind: Option<String>) -> Result<()> {
    let config = load_config()?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let state = AppState::new(
        open_storage(&config).await?,
        stats_client(&config)?,
        RateLimiter::new(LimiterConfig::from(&config)),
        config.enrichment.clone(),
    );

    {
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    kwengine_api::serve(state, &bind).await?;
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl EnrichmentProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("Enriching [{current}/{total}] {detail}"));
    }
}
