use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use feedvault::config::{self, parse_duration, Config, Settings};
use feedvault::feed::{build_client, load_subscriptions};
use feedvault::storage::{Database, DatabaseError, ItemFilter};
use feedvault::sync::{OutcomeStatus, RunSummary, Scheduler};
use feedvault::util::canonicalize_feed_url;

#[derive(Parser, Debug)]
#[command(
    name = "feedvault",
    version,
    about = "Sync RSS/Atom/JSON feeds into an archival SQLite store"
)]
struct Args {
    /// Config file (default: ~/.config/feedvault/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (overrides the config file)
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch feeds and archive their items
    Fetch(FetchArgs),
    /// Delete archived items older than a cutoff
    Purge {
        /// e.g. 90d, 12h
        #[arg(long, value_name = "DURATION")]
        older_than: String,
    },
    /// List stored items of one feed
    Show {
        url: String,
        /// Show archived items instead of active ones
        #[arg(long)]
        archived: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct FetchArgs {
    /// Feed URLs to fetch
    urls: Vec<String>,

    /// OPML subscription file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["list", "urls"])]
    opml: Option<PathBuf>,

    /// Text subscription file, one URL per line
    #[arg(long, value_name = "FILE", conflicts_with = "urls")]
    list: Option<PathBuf>,

    /// Ignore stored ETag/Last-Modified and fetch everything
    #[arg(long)]
    force: bool,

    /// Skip feeds fetched more recently than this
    #[arg(long, value_name = "DURATION")]
    max_age: Option<String>,

    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Per-feed timeout
    #[arg(long, value_name = "DURATION")]
    timeout: Option<String>,

    /// Abandon the run after this long
    #[arg(long, value_name = "DURATION")]
    deadline: Option<String>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Remove stored feeds missing from the subscription file
    #[arg(long, conflicts_with = "urls")]
    prune: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedvault=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config_dir = config::config_dir();
    let config_path = args
        .config
        .clone()
        .or_else(|| config_dir.as_ref().map(|d| d.join("config.toml")));
    let mut file_config = match &config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let default_database = config_dir
        .as_ref()
        .map(|d| d.join("feedvault.db"))
        .unwrap_or_else(|| PathBuf::from("feedvault.db"));
    if let Some(db) = &args.database {
        file_config.database = Some(db.clone());
    }
    if let Command::Fetch(fetch) = &args.command {
        apply_fetch_overrides(&mut file_config, fetch);
    }
    let settings =
        Settings::resolve(&file_config, default_database).context("Invalid configuration")?;

    match args.command {
        Command::Fetch(fetch) => run_fetch(&settings, fetch).await,
        Command::Purge { older_than } => {
            let age = parse_duration(&older_than).context("Invalid --older-than")?;
            let db = open_database(&settings.database).await?;
            let removed = db.purge_archived(cutoff(age)).await?;
            println!("Purged {} archived items", removed);
            db.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Show {
            url,
            archived,
            json,
        } => {
            let url = canonicalize_feed_url(&url).context("Invalid feed URL")?;
            let db = open_database(&settings.database).await?;
            let filter = if archived {
                ItemFilter::Archived
            } else {
                ItemFilter::Active
            };
            let items = db.get_items_for_feed_url(&url, filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in &items {
                    let when = item.published.unwrap_or(item.first_seen);
                    let when = chrono::DateTime::from_timestamp(when, 0)
                        .map(|dt| dt.format("%Y-%m-%d").to_string())
                        .unwrap_or_default();
                    println!(
                        "{}  {}  {}",
                        when,
                        item.title,
                        item.link.as_deref().unwrap_or("")
                    );
                }
            }
            db.close().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply_fetch_overrides(config: &mut Config, fetch: &FetchArgs) {
    if let Some(n) = fetch.concurrency {
        config.concurrency = n;
    }
    if let Some(t) = &fetch.timeout {
        config.timeout = t.clone();
    }
    if fetch.max_age.is_some() {
        config.max_age = fetch.max_age.clone();
    }
    if fetch.deadline.is_some() {
        config.deadline = fetch.deadline.clone();
    }
}

async fn run_fetch(settings: &Settings, fetch: FetchArgs) -> Result<ExitCode> {
    let urls = subscription_urls(settings, &fetch).await?;
    if urls.is_empty() {
        anyhow::bail!("No feeds to fetch: pass URLs, --opml, --list, or set `subscriptions` in the config file");
    }

    let db = open_database(&settings.database).await?;
    let client = build_client().context("Failed to build HTTP client")?;

    if fetch.prune {
        let removed = prune_unsubscribed(&db, &urls).await?;
        if removed > 0 {
            eprintln!("Removed {} unsubscribed feeds", removed);
        }
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let scheduler = Scheduler::new(db.clone(), client, settings.scheduler_config(fetch.force));
    let summary = scheduler.run(&urls, cancel).await;

    if let Some(age) = settings.purge_after {
        match db.purge_archived(cutoff(age)).await {
            Ok(n) if n > 0 => tracing::info!(removed = n, "Purged old archived items"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to purge archived items"),
        }
    }
    db.close().await;

    if fetch.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.all_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Delete stored feeds missing from `subscribed`. Callers pass the loaded
/// subscription file, never ad-hoc URLs.
async fn prune_unsubscribed(db: &Database, subscribed: &[String]) -> Result<u64> {
    let keep: Vec<String> = subscribed
        .iter()
        .filter_map(|u| canonicalize_feed_url(u).ok())
        .collect();
    Ok(db.purge_orphaned_feeds(&keep).await?)
}

async fn subscription_urls(settings: &Settings, fetch: &FetchArgs) -> Result<Vec<String>> {
    if !fetch.urls.is_empty() {
        return Ok(fetch.urls.clone());
    }
    let path = fetch
        .opml
        .as_ref()
        .or(fetch.list.as_ref())
        .or(settings.subscriptions.as_ref());
    match path {
        Some(path) => load_subscriptions(path)
            .await
            .with_context(|| format!("Failed to load subscriptions from {}", path.display())),
        None => Ok(Vec::new()),
    }
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                {
                    tracing::warn!(path = %parent.display(), error = %e, "Failed to set directory permissions to 0700");
                }
            }
        }
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("Database {} is locked by another process", path.display())
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn cutoff(age: std::time::Duration) -> i64 {
    let secs = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp().saturating_sub(secs)
}

fn print_summary(summary: &RunSummary) {
    for o in &summary.outcomes {
        let status = match o.status {
            OutcomeStatus::Committed => "committed",
            OutcomeStatus::NotModified => "unchanged",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Failed => "FAILED",
        };
        match &o.error {
            Some(err) => println!("{:<10} {}  {}", status, o.url, err),
            None if o.status == OutcomeStatus::Committed => println!(
                "{:<10} {}  +{} ~{} -{} ^{}",
                status, o.url, o.inserted, o.updated, o.archived, o.resurrected
            ),
            None => println!("{:<10} {}", status, o.url),
        }
    }
    println!(
        "{} feeds: {} committed, {} unchanged, {} skipped, {} failed; {} new, {} updated, {} archived, {} restored{}",
        summary.outcomes.len(),
        summary.committed,
        summary.not_modified,
        summary.skipped,
        summary.failed,
        summary.inserted,
        summary.updated,
        summary.archived,
        summary.resurrected,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    if summary.unfurl_dropped > 0 {
        println!("{} new items were not queued for unfurling", summary.unfurl_dropped);
    }
}
