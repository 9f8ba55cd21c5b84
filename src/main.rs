use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cardex_engine::bulk_import::{ImportError, LAST_IMPORT_KEY};
use cardex_engine::config::{CliConfig, EngineConfig, FileConfig};
use cardex_engine::{CardQuery, EngineContext, ResolveError};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "cardex", version)]
struct CliArgs {
    /// Path to the SQLite card cache database file.
    #[clap(long, value_parser = parse_path)]
    db_path: Option<PathBuf>,

    /// Path to a TOML config file; its values override CLI flags.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Base URL of the upstream catalog API.
    #[clap(long)]
    upstream_url: Option<String>,

    /// URL of the optional accelerator service.
    #[clap(long)]
    accelerator_url: Option<String>,

    /// Minimum spacing between outbound upstream calls in milliseconds.
    #[clap(long, default_value_t = 100)]
    min_call_spacing_ms: u64,

    /// Timeout for accelerator and upstream requests in seconds.
    #[clap(long, default_value_t = 10)]
    request_timeout_secs: u64,

    /// Timeout for the accelerator reachability probe in seconds.
    #[clap(long, default_value_t = 2)]
    probe_timeout_secs: u64,

    /// Lifetime of cached upstream responses in seconds.
    #[clap(long, default_value_t = 3600)]
    response_cache_ttl_secs: u64,

    /// Records per bulk-import transaction.
    #[clap(long, default_value_t = 10_000)]
    import_batch_size: usize,

    /// Hours between import freshness checks in watch mode.
    #[clap(long, default_value_t = 6)]
    import_check_interval_hours: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one card by name, or by exact printing with --set/--number.
    Resolve {
        /// Card name (free text).
        name: Option<String>,

        /// Set code of an exact printing.
        #[clap(long)]
        set: Option<String>,

        /// Collector number of an exact printing.
        #[clap(long, requires = "set")]
        number: Option<String>,

        #[clap(long, default_value = "en")]
        language: String,
    },

    /// Run the bulk import now.
    Import {
        /// Import even if the cache is still fresh.
        #[clap(long, default_value_t = false)]
        force: bool,
    },

    /// Show cache counts, size, last import and call metrics.
    Status,

    /// Keep the import scheduler running until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    info!(
        "cardex {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        upstream_url: cli_args.upstream_url.clone(),
        accelerator_url: cli_args.accelerator_url.clone(),
        min_call_spacing_ms: cli_args.min_call_spacing_ms,
        request_timeout_secs: cli_args.request_timeout_secs,
        probe_timeout_secs: cli_args.probe_timeout_secs,
        response_cache_ttl_secs: cli_args.response_cache_ttl_secs,
        import_batch_size: cli_args.import_batch_size,
        import_check_interval_hours: cli_args.import_check_interval_hours,
    };
    let config = EngineConfig::resolve(&cli_config, file_config)?;
    let ctx = EngineContext::init(config)?;

    match cli_args.command {
        Command::Resolve {
            name,
            set,
            number,
            language,
        } => run_resolve(&ctx, name, set, number, language).await,
        Command::Import { force } => run_import(&ctx, force).await,
        Command::Status => run_status(&ctx),
        Command::Watch => run_watch(ctx).await,
    }
}

async fn run_resolve(
    ctx: &EngineContext,
    name: Option<String>,
    set: Option<String>,
    number: Option<String>,
    language: String,
) -> Result<()> {
    let query = match (name, set, number) {
        (_, Some(set), Some(number)) => CardQuery::by_set_number(&set, &number, &language),
        (Some(name), None, None) => CardQuery::by_name(&name, &language),
        _ => bail!("Provide a card name, or both --set and --number"),
    };

    match ctx.resolver().resolve(&query, &CancellationToken::new()).await {
        Ok(Some(card)) => {
            println!("{}", serde_json::to_string_pretty(&card)?);
            Ok(())
        }
        Ok(None) => {
            println!("not found");
            Ok(())
        }
        Err(ResolveError::Upstream(msg)) => bail!("upstream error (retryable): {msg}"),
        Err(e) => Err(e.into()),
    }
}

async fn run_import(ctx: &EngineContext, force: bool) -> Result<()> {
    let importer = ctx.importer();
    if !force && !importer.needs_refresh() {
        info!("Card cache is still fresh, skipping import (use --force to override)");
        return Ok(());
    }

    match importer.run(&ctx.shutdown_token()).await {
        Ok(stats) => {
            info!(
                "Imported {} records in {} batches ({:#} downloaded)",
                stats.records,
                stats.batches,
                byte_unit::Byte::from(stats.downloaded_bytes)
            );
            Ok(())
        }
        Err(ImportError::Cancelled) => {
            info!("Import cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_status(ctx: &EngineContext) -> Result<()> {
    let store = ctx.store();
    println!("Cached printings: {}", store.count());
    println!(
        "Database size:    {:#}",
        byte_unit::Byte::from(store.size_bytes())
    );
    println!("Type vocabulary:  {}", store.card_type_count());
    match store.get_metadata(LAST_IMPORT_KEY)? {
        Some(ts) => println!("Last bulk import: {ts} (unix)"),
        None => println!("Last bulk import: never"),
    }
    println!(
        "Metrics:          {}",
        serde_json::to_string_pretty(&ctx.metrics().summarize())?
    );
    Ok(())
}

async fn run_watch(mut ctx: EngineContext) -> Result<()> {
    ctx.spawn_import_scheduler();
    info!("Watching; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    ctx.shutdown().await;
    Ok(())
}
