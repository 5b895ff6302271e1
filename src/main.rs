use alerter::{AlerterError, TelegramAlerter, run_alerter_service};
use anyhow::{Context, bail};
use api_client::{Exchange, GatewayClient, HttpSignalSource, IdleSignals, PaperExchange, SignalSource};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use configuration::{Config, StoreBackend, init_tracing, load_config};
use core_types::TradePosition;
use database::{
    LockStore, MemoryLockStore, MemoryPositionStore, PgLockStore, PgPositionStore, PositionStore,
    UpdateOutcome, connect, run_migrations,
};
use engine::{
    Clock, CycleSettings, LeaseDeadline, LiveTradingCycle, LockService, MonitorSettings, Scheduler,
    SystemClock, TradeMonitor, TradingHalt, retry_policy,
};
use events::EventBus;
use retry::Retry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Fee rate applied to simulated fills in dry runs.
const PAPER_FEE_RATE: Decimal = dec!(0.0004);

/// Lease-locked trade monitor for perpetual futures.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `database.backend` from the configuration.
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Run,
    /// Run a single trade-monitor tick and exit.
    Tick,
    /// Apply database migrations.
    Migrate,
    /// Show recent positions.
    Positions {
        /// Only positions that are currently open.
        #[arg(long)]
        open: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Flag a position to be closed on the next tick.
    Exit {
        id: Uuid,
        /// Clear the flag instead of setting it.
        #[arg(long)]
        clear: bool,
    },
    /// End the lease on a lock immediately.
    ReleaseLock {
        /// Defaults to the trade-monitor lock.
        #[arg(long)]
        name: Option<String>,
    },
}

/// The lock and position stores of the selected backend.
struct Stores {
    locks: Arc<dyn LockStore>,
    positions: Arc<dyn PositionStore>,
}

impl Stores {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        match config.database.backend {
            StoreBackend::Postgres => {
                let pool = connect(&config.database)
                    .await
                    .context("Failed to connect to the database")?;
                run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                Ok(Self {
                    locks: Arc::new(PgLockStore::new(pool.clone())),
                    positions: Arc::new(PgPositionStore::new(pool)),
                })
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; state is lost on exit and not shared between instances.");
                Ok(Self {
                    locks: Arc::new(MemoryLockStore::new()),
                    positions: Arc::new(MemoryPositionStore::new()),
                })
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may already be set.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config).context("Failed to load configuration")?;
    if let Some(backend) = cli.store {
        config.database.backend = backend;
    }
    let _log_guard = init_tracing(&config.logging)?;

    if let Commands::Migrate = cli.command {
        if config.database.backend != StoreBackend::Postgres {
            bail!("Migrations only apply to the postgres backend.");
        }
        Stores::open(&config).await?;
        println!("Migrations applied.");
        return Ok(());
    }

    let stores = Stores::open(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Run => handle_run(&config, &stores, clock).await,
        Commands::Tick => {
            let monitor = build_monitor(&config, &stores, clock.clone(), EventBus::new())?;
            let outcome = monitor.run_tick(clock.now()).await;
            println!("{outcome:?}");
            Ok(())
        }
        Commands::Migrate => Ok(()),
        Commands::Positions { open, limit } => {
            let positions = if open {
                stores.positions.list_open().await?
            } else {
                stores.positions.list_recent(limit).await?
            };
            println!("{}", positions_table(&positions));
            Ok(())
        }
        Commands::Exit { id, clear } => {
            match database::set_exit_flag(stores.positions.as_ref(), id, !clear).await? {
                UpdateOutcome::Updated(p) => println!("Exit flag on {} set to {}.", p.id, p.exit_flag),
                UpdateOutcome::Unchanged(p) => println!("Exit flag on {} already {}.", p.id, p.exit_flag),
                UpdateOutcome::Rejected { current, reason } => {
                    bail!("Position {} ({}) rejected the change: {reason}", current.id, current.status)
                }
                UpdateOutcome::NotFound => bail!("No position with id {id}."),
            }
            Ok(())
        }
        Commands::ReleaseLock { name } => {
            let name = name.unwrap_or_else(|| config.scheduler.lock_name.clone());
            if LockService::new(stores.locks.clone(), clock).force_release(&name).await? {
                println!("Lease on '{name}' ended.");
            } else {
                println!("No lock named '{name}'.");
            }
            Ok(())
        }
    }
}

async fn handle_run(config: &Config, stores: &Stores, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let events = EventBus::new();

    match TelegramAlerter::new(&config.telegram) {
        Ok(alerter) => {
            let subscription = events.subscribe("telegram", 256)?;
            tokio::spawn(run_alerter_service(alerter, subscription));
        }
        Err(AlerterError::NotConfigured) => info!("Telegram is not configured, alerts are disabled."),
        Err(e) => warn!(error = %e, "Failed to start the alerter."),
    }

    let monitor = build_monitor(config, stores, clock.clone(), events)?;
    let mut scheduler = Scheduler::new(clock);
    scheduler.register(Arc::new(monitor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing the current tick.");
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}

fn build_monitor(
    config: &Config,
    stores: &Stores,
    clock: Arc<dyn Clock>,
    events: EventBus,
) -> anyhow::Result<TradeMonitor> {
    let gateway: Arc<dyn Exchange> = Arc::new(GatewayClient::new(&config.exchange)?);
    let exchange: Arc<dyn Exchange> = if config.trading.dry_run {
        info!("Dry run: orders are simulated at live mark prices.");
        Arc::new(PaperExchange::new(PAPER_FEE_RATE).with_price_feed(gateway))
    } else {
        gateway
    };

    let signals: Arc<dyn SignalSource> = match &config.signals.url {
        Some(url) => Arc::new(HttpSignalSource::new(
            url.clone(),
            Duration::from_secs(config.exchange.timeout_secs),
        )?),
        None => {
            info!("No signal source configured; only monitoring open positions.");
            Arc::new(IdleSignals)
        }
    };

    // A step that starts before the deadline may take one call timeout plus one
    // retry delay, and must still finish inside the lease.
    let step = chrono::Duration::from_std(
        Duration::from_secs(config.exchange.timeout_secs) + config.retry.delay(),
    )
    .context("exchange.timeout_secs or retry.delay_ms is out of range")?;
    let deadline = LeaseDeadline::new(step);

    let (aborts_tx, aborts_rx) = broadcast::channel(64);
    let halt = Arc::new(TradingHalt::new(aborts_rx, events.clone()));
    let retry = Retry::new(retry_policy(&config.retry)).with_abort_channel(aborts_tx);

    let cycle = LiveTradingCycle::new(
        stores.positions.clone(),
        exchange,
        signals,
        retry,
        halt,
        events.clone(),
        clock.clone(),
        CycleSettings::from(&config.trading),
    )
    .with_deadline(deadline.clone());
    let locks = LockService::new(stores.locks.clone(), clock);

    Ok(TradeMonitor::new(
        locks,
        Arc::new(cycle),
        events,
        MonitorSettings::from_config(config)?,
    )
    .with_deadline(deadline))
}

fn positions_table(positions: &[TradePosition]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "ID", "Symbol", "Side", "Status", "Size", "In", "Out", "Entry", "Price", "PnL", "Exit", "Last error",
        ]);

    let opt = |v: Option<Decimal>| v.map(|d| d.to_string()).unwrap_or_default();
    for p in positions {
        let pnl = match p.realized_pnl {
            Some(pnl) if pnl.is_sign_negative() => Cell::new(pnl).fg(Color::Red),
            Some(pnl) => Cell::new(pnl).fg(Color::Green),
            None => Cell::new(""),
        };
        table.add_row(vec![
            Cell::new(p.id),
            Cell::new(p.symbol()),
            Cell::new(p.position_direction),
            Cell::new(p.status),
            Cell::new(p.size),
            Cell::new(p.amount_in),
            Cell::new(opt(p.amount_out)),
            Cell::new(p.entry_price),
            Cell::new(opt(p.current_price)),
            pnl,
            Cell::new(if p.exit_flag { "yes" } else { "" }),
            Cell::new(p.last_error.as_deref().unwrap_or("")),
        ]);
    }
    table
}
