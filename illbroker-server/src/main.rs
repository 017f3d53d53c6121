//! # ILL broker
//!
//! Runs the broker's event listener against PostgreSQL. Protocol messages
//! enter through [`illbroker_core::ProtocolIntake`]; everything after that
//! is driven by the event bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use illbroker_config::{Config, ConfigLoad, ConfigLoader};
use illbroker_core::{
    Archiver, Broker, BrokerSettings, Collaborators, DEFAULT_ARCHIVE_STATUSES, DatabaseContext,
    DirectoryLookup, FairnessRota, HoldingsLookup, HttpDirectoryLookup, HttpHoldingsLookup,
    HttpMessageSender, ListenerConfig, PatternHoldingsLookup, PoolSettings, PostgresDatabase,
    StaticDirectoryLookup,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "illbroker")]
#[command(about = "Interlibrary loan broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct CommonArgs {
    /// Path to the TOML config file (overrides ILLBROKER_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the event listener until interrupted (default)
    Serve,
    #[command(subcommand)]
    Db(DbCommand),
    /// Delete finished transactions older than the given age and exit
    Archive {
        /// Minimum age, e.g. "180days" or "6months"
        #[arg(long, value_parser = humantime::parse_duration, default_value = "180days")]
        older_than: Duration,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,illbroker=info,illbroker::notifications=info,bus::listener=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli.common)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_broker(config).await,
        Command::Db(DbCommand::Migrate) => {
            let database = connect(&config).await?;
            database
                .initialize_schema()
                .await
                .context("failed to apply migrations")?;
            info!("database migrations applied");
            Ok(())
        }
        Command::Archive { older_than } => run_archive(config, older_than).await,
    }
}

fn load_config(args: &CommonArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = args.config.as_ref() {
        loader = loader.with_config_path(path.clone());
    }
    let ConfigLoad { config, warnings } = loader
        .load()
        .context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "config file loaded");
    }
    warnings.log();
    Ok(config)
}

async fn connect(config: &Config) -> anyhow::Result<PostgresDatabase> {
    let Some(url) = config.database.primary_url.as_deref() else {
        bail!("no database configured: set DATABASE_URL or DATABASE_HOST/DATABASE_NAME");
    };
    let defaults = PoolSettings::default();
    let settings = PoolSettings {
        max_connections: config
            .database
            .max_connections
            .unwrap_or(defaults.max_connections),
        min_connections: config.database.min_connections,
    };
    PostgresDatabase::connect(url, settings)
        .await
        .context("failed to connect to PostgreSQL")
}

fn collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let timeout = config.lookup.timeout;

    let holdings: Arc<dyn HoldingsLookup> = match config.lookup.holdings_url.clone() {
        Some(url) => {
            info!(%url, "using holdings service");
            Arc::new(HttpHoldingsLookup::new(url, timeout).context("holdings client")?)
        }
        None => {
            warn!("no holdings service configured; using record id patterns");
            Arc::new(PatternHoldingsLookup)
        }
    };

    let directory: Arc<dyn DirectoryLookup> = match config.lookup.directory_url.clone() {
        Some(url) => {
            info!(%url, "using directory service");
            Arc::new(HttpDirectoryLookup::new(url, timeout).context("directory client")?)
        }
        None => {
            warn!("no directory service configured; only stored peers will be used");
            Arc::new(StaticDirectoryLookup::default())
        }
    };

    Ok(Collaborators {
        holdings,
        directory,
        rota: Arc::new(FairnessRota),
        sender: Arc::new(HttpMessageSender::new(timeout).context("message sender")?),
    })
}

async fn run_broker(config: Config) -> anyhow::Result<()> {
    let database = connect(&config).await?;
    database
        .initialize_schema()
        .await
        .context("failed to apply migrations")?;

    let context = DatabaseContext::from_postgres(&database, &config.bus.channel);
    let settings = BrokerSettings {
        broker_symbol: config.broker.symbol.clone(),
        supply_local: config.broker.supply_local,
        listener: ListenerConfig {
            reconnect_backoff: config.bus.reconnect_backoff,
            max_reconnect_attempts: config.bus.max_reconnect_attempts,
        },
    };
    let broker = Broker::assemble(context, collaborators(&config)?, settings);

    let cancel = CancellationToken::new();
    let notification_log = broker.spawn_notification_log(cancel.clone());
    let mut listener = broker.spawn_listener(cancel.clone());
    info!(
        broker_symbol = %config.broker.symbol,
        channel = %config.bus.channel,
        "broker started"
    );

    tokio::select! {
        result = &mut listener => {
            match result.context("listener task panicked")? {
                Ok(()) => info!("listener stopped"),
                Err(err) => {
                    error!(error = %err, "listener failed");
                    return Err(err.into());
                }
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            cancel.cancel();
            if let Ok(Err(err)) = listener.await {
                warn!(error = %err, "listener stopped with error during shutdown");
            }
        }
    }

    cancel.cancel();
    match notification_log.await {
        Ok(seen) => info!(notifications = seen, "notification log stopped"),
        Err(err) => warn!(error = %err, "notification log task failed"),
    }

    let stats = database.pool_stats();
    info!(size = stats.size, idle = stats.idle, "closing database pool");
    database.pool().close().await;
    Ok(())
}

async fn run_archive(config: Config, older_than: Duration) -> anyhow::Result<()> {
    let database = connect(&config).await?;
    let context = DatabaseContext::from_postgres(&database, &config.bus.channel);
    let archiver = Archiver::new(context.transactions, context.located_suppliers, context.events);

    let age = chrono::Duration::from_std(older_than).context("archive age out of range")?;
    let before = chrono::Utc::now() - age;
    let archived = archiver
        .archive_transactions(before, DEFAULT_ARCHIVE_STATUSES)
        .await
        .context("archival failed")?;
    info!(count = archived.len(), %before, "archival finished");
    Ok(())
}
