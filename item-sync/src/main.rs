use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use item_sync::{
    differing_fields, AppContext, Connectivity, DeleteOutcome, Item, LocalDatabase,
    ResolutionStrategy, SaveOutcome, SyncConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Offline-first item client
#[derive(Parser, Debug)]
#[command(name = "item-sync")]
#[command(about = "Browse and edit items against a local cache that syncs with the server")]
struct Args {
    /// Server base URL
    #[arg(long)]
    server_url: Option<String>,

    /// Push channel URL
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token
    #[arg(long)]
    token: Option<String>,

    /// Local SQLite database file
    #[arg(long)]
    db_path: Option<String>,

    /// Work from the local cache only; mutations are queued
    #[arg(long)]
    offline: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show one page of items
    List {
        #[arg(short, long, default_value_t = 0)]
        page: usize,
        /// Exact model name
        #[arg(short, long)]
        filter: Option<String>,
        /// Substring of the model name
        #[arg(short, long)]
        search: Option<String>,
    },
    /// Show one item
    Get { id: String },
    /// List distinct model names
    Filters,
    /// Create an item, or update it when --id is given
    Save {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        available: Option<bool>,
        /// RFC 3339 timestamp
        #[arg(long)]
        produced_on: Option<DateTime<Utc>>,
        #[arg(long)]
        latitude: Option<f64>,
        #[arg(long)]
        longitude: Option<f64>,
    },
    /// Delete an item
    Delete { id: String },
    /// Push queued mutations to the server
    Sync {
        /// Resolve every surfaced conflict with this side
        #[arg(long, value_enum)]
        resolve: Option<Side>,
    },
    /// Follow live updates and reconcile whenever the server comes back
    Watch,
    /// Reclaim space in the local database
    Compact,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Side {
    Local,
    Server,
}

impl From<Side> for ResolutionStrategy {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => ResolutionStrategy::AcceptLocal,
            Side::Server => ResolutionStrategy::AcceptServer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(args.verbose, args.json_logs)?;

    let config = load_config(&args)?;
    info!(
        server_url = %config.server_url,
        db_path = %config.local_db.db_path,
        offline = args.offline,
        "Starting item-sync"
    );

    let ctx = Arc::new(
        AppContext::open(config, Connectivity::new(!args.offline))
            .await
            .context("Failed to open item store")?,
    );

    run(&ctx, args.command, args.offline).await
}

async fn compact(config: &SyncConfig) -> Result<()> {
    let db = LocalDatabase::new(config.local_db.clone())
        .await
        .context("Failed to open item store")?;
    db.vacuum().await?;
    db.close().await?;
    info!(db_path = %config.local_db.db_path, "Compacted local database");
    Ok(())
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env().context("Invalid environment configuration")?;
    if let Some(url) = &args.server_url {
        config.server_url = url.clone();
    }
    if let Some(url) = &args.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.auth_token = Some(token.clone());
    }
    if let Some(path) = &args.db_path {
        config.local_db.db_path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(ctx: &Arc<AppContext>, command: Command, offline: bool) -> Result<()> {
    match command {
        Command::List { page, filter, search } => {
            ctx.set_page(page).await;
            ctx.set_filter(filter.unwrap_or_default()).await;
            ctx.set_search(search.unwrap_or_default()).await;
            for item in ctx.fetch_items().await? {
                print_item(&item)?;
            }
        }
        Command::Get { id } => match ctx.get_item(&id).await? {
            Some(item) => print_item(&item)?,
            None => bail!("Item {id} not found"),
        },
        Command::Filters => {
            for model in ctx.filter_values().await? {
                println!("{model}");
            }
        }
        Command::Save {
            id,
            model,
            price,
            available,
            produced_on,
            latitude,
            longitude,
        } => {
            let mut item = match &id {
                Some(id) => ctx
                    .get_item(id)
                    .await?
                    .with_context(|| format!("Item {id} not found"))?,
                None => Item::new(model.clone().context("--model is required for a new item")?),
            };
            if let Some(model) = model {
                item.model = model;
            }
            if let Some(price) = price {
                item.price = price;
            }
            if let Some(available) = available {
                item.available = available;
            }
            if produced_on.is_some() {
                item.produced_on = produced_on;
            }
            if latitude.is_some() {
                item.latitude = latitude;
            }
            if longitude.is_some() {
                item.longitude = longitude;
            }

            match ctx.save_item(item).await? {
                SaveOutcome::Confirmed(item) => print_item(&item)?,
                SaveOutcome::Queued(item) => {
                    println!("Saved offline, will sync when the server is reachable");
                    print_item(&item)?;
                }
                SaveOutcome::Conflict(_) => {
                    println!("The server has a newer version of this item");
                    report_conflicts(ctx, None).await?;
                }
            }
        }
        Command::Delete { id } => match ctx.delete_item(&id).await? {
            DeleteOutcome::Confirmed(_) => println!("Deleted {id}"),
            DeleteOutcome::Queued(_) => println!("Delete of {id} queued for sync"),
        },
        Command::Sync { resolve } => {
            let stats = ctx.reconcile_pending().await?;
            println!(
                "pushed: {}, failed: {}, deferred: {}, conflicts: {}",
                stats.pushed_operations,
                stats.failed_operations,
                stats.deferred_operations,
                stats.conflicts.len()
            );
            report_conflicts(ctx, resolve).await?;
        }
        Command::Watch => {
            let _sync = ctx.spawn_sync_on_reconnect();
            let _live = ctx.spawn_live_updates();
            let every = ctx.config().reachability_interval();
            let _reachability = (!offline).then(|| ctx.spawn_reachability_check(every));
            info!("Watching for live updates, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let state = ctx.state().await;
            info!(items = state.items.len(), "Stopped watching");
        }
        Command::Compact => compact(ctx.config()).await?,
    }
    Ok(())
}

/// Print waiting conflicts, resolving them with `side` when given.
async fn report_conflicts(ctx: &AppContext, side: Option<Side>) -> Result<()> {
    while let Some(pair) = ctx.current_conflict().await {
        println!("Conflict on item {}", pair.id().unwrap_or("<new>"));
        for diff in differing_fields(&pair)? {
            println!("  {}: local {} / server {}", diff.field, diff.local_value, diff.server_value);
        }

        let Some(side) = side else {
            println!("Run `item-sync sync --resolve local|server` to resolve");
            return Ok(());
        };
        let resolution = ctx.resolve_conflict(side.into(), None).await?;
        if let SaveOutcome::Conflict(_) = resolution.outcome {
            println!("Server moved on again; rerun sync to retry");
            return Ok(());
        }
    }
    Ok(())
}

fn print_item(item: &Item) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("item_sync={level},sqlx=warn,reqwest=info").into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}
