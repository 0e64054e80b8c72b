use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradekeeper::application::actors::{MonitorConfig, MonitorMessage, PositionMonitor};
use tradekeeper::config::EngineConfig;
use tradekeeper::domain::entities::position::PositionSide;
use tradekeeper::domain::entities::signal::TradeSignal;
use tradekeeper::domain::repositories::notifier::Notifier;
use tradekeeper::domain::services::entry_executor::EntryExecutor;
use tradekeeper::domain::services::portfolio_reconciliation::ReconciliationService;
use tradekeeper::domain::services::position_ledger::PositionLedger;
use tradekeeper::domain::services::price_oracle::PriceOracle;
use tradekeeper::domain::value_objects::symbol_rules::SymbolRules;
use tradekeeper::infrastructure::notifier::LogNotifier;
use tradekeeper::infrastructure::paper_exchange::PaperExchange;
use tradekeeper::persistence::init_database;
use tradekeeper::persistence::reconciliation_audit::SqliteReconciliationAudit;
use tradekeeper::persistence::repository::SqliteLedgerStore;
use tradekeeper::rate_limit::create_rate_limiter;
use tradekeeper::retry::RetryExecutor;

/// Markets simulated by the paper session: symbol, starting mark, lot step decimals
const PAPER_MARKETS: [(&str, i64, u32); 3] = [
    ("BTCUSDT", 60_000, 3),
    ("ETHUSDT", 3_000, 3),
    ("SOLUSDT", 150, 2),
];

const FEED_INTERVAL: Duration = Duration::from_secs(1);
const SIGNAL_INTERVAL: Duration = Duration::from_secs(15);
/// Notional of each demo signal, in quote currency
const SIGNAL_NOTIONAL: i64 = 1_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradekeeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Tradekeeper starting ({} mode, max {} positions, {} per symbol)",
        if config.paper_trading { "paper" } else { "live-on-paper-exchange" },
        config.max_open_positions,
        config.max_positions_per_symbol
    );

    let pool = init_database(&config.database).await?;
    let ledger = Arc::new(
        PositionLedger::restore(
            Arc::new(SqliteLedgerStore::new(pool.clone())),
            config.position_limits(),
        )
        .await?,
    );

    let exchange = Arc::new(PaperExchange::new().with_protective_triggers());
    for (symbol, mark, step_decimals) in PAPER_MARKETS {
        let step = Decimal::new(1, step_decimals);
        exchange.set_mark(symbol, Decimal::from(mark));
        exchange.set_rules(symbol, SymbolRules::new(step, Decimal::new(1, 2), step));
    }

    let executor = RetryExecutor::new(config.retry_policy())
        .with_rate_limiter(create_rate_limiter(&config.rate_limiter_config()));
    let oracle = Arc::new(PriceOracle::new(
        exchange.clone(),
        executor.clone(),
        config.price_oracle_config(),
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let reconciler = Arc::new(
        ReconciliationService::new(
            ledger.clone(),
            exchange.clone(),
            oracle.clone(),
            executor.clone(),
            notifier.clone(),
            config.reconciliation_config(),
        )
        .with_audit(Arc::new(SqliteReconciliationAudit::new(pool.clone()))),
    );

    let monitor = PositionMonitor::new(
        ledger.clone(),
        exchange.clone(),
        oracle.clone(),
        executor.clone(),
        notifier.clone(),
        MonitorConfig {
            interval: config.monitor_interval(),
            reconcile_every: config.reconciliation_every_n_cycles,
            refresh_protective_orders: config.protective_orders_enabled,
            ..MonitorConfig::default()
        },
    )
    .with_reconciliation(reconciler);

    let entries = Arc::new(EntryExecutor::new(
        ledger.clone(),
        exchange.clone(),
        executor,
        notifier,
        config.entry_config(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (monitor_tx, monitor_handle) = monitor.spawn(shutdown_tx.subscribe());
    let feed_handle = tokio::spawn(run_price_feed(
        exchange.clone(),
        oracle.clone(),
        shutdown_tx.subscribe(),
    ));
    let signal_handle = tokio::spawn(run_signal_producer(
        entries,
        oracle,
        shutdown_tx.subscribe(),
    ));

    info!("✓ Paper session running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for tasks to finish the current cycle...");

    let (reply, stats) = oneshot::channel();
    if monitor_tx.send(MonitorMessage::GetStats { reply }).await.is_ok() {
        match stats.await {
            Ok(stats) => info!(
                "Monitor ran {} cycles ({} reconciliations, {} failed), closed {} positions, {} errors",
                stats.cycles,
                stats.reconciliations,
                stats.failed_reconciliations,
                stats.positions_closed,
                stats.errors
            ),
            Err(_) => warn!("Monitor stopped before reporting its stats"),
        }
    }
    let _ = shutdown_tx.send(());

    for (name, handle) in [
        ("monitor", monitor_handle),
        ("price feed", feed_handle),
        ("signal producer", signal_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task ended abnormally: {}", name, e);
        }
    }

    let history = ledger.closed_trades(20).await?;
    let realized: Decimal = history.iter().map(|t| t.pnl.amount).sum();
    info!(
        "Session ended: {} open positions, last {} closing events realized {}",
        ledger.open_count().await,
        history.len(),
        realized.round_dp(2)
    );

    pool.close().await;
    Ok(())
}

/// Random-walk marks, pushed to both the paper exchange and the price cache
async fn run_price_feed(
    exchange: Arc<PaperExchange>,
    oracle: Arc<PriceOracle>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(FEED_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                for (symbol, ..) in PAPER_MARKETS {
                    let Some(last) = oracle.last_known(symbol) else {
                        // First tick seeds the cache from the exchange
                        let _ = oracle.price(symbol).await;
                        continue;
                    };
                    let bps: i64 = rng.gen_range(-30..=30);
                    let next = (last * (Decimal::ONE + Decimal::new(bps, 4))).round_dp(2);
                    exchange.set_mark(symbol, next);
                    oracle.update(symbol, next);
                }
            }
        }
    }
    debug!("Price feed stopped");
}

/// Opens a random position now and then, standing in for a strategy
async fn run_signal_producer(
    entries: Arc<EntryExecutor>,
    oracle: Arc<PriceOracle>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(SIGNAL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let (symbol, ..) = PAPER_MARKETS[rng.gen_range(0..PAPER_MARKETS.len())];
                let Some(price) = oracle.price(symbol).await else {
                    warn!("No price for {}, skipping signal", symbol);
                    continue;
                };
                let side = if rng.gen_bool(0.5) { PositionSide::Long } else { PositionSide::Short };
                let two_percent = price * Decimal::new(2, 2);
                let (stop_loss, take_profit) = match side {
                    PositionSide::Long => (price - two_percent, price + two_percent * Decimal::TWO),
                    PositionSide::Short => (price + two_percent, price - two_percent * Decimal::TWO),
                };
                let size = Decimal::from(SIGNAL_NOTIONAL) / price;
                let signal = TradeSignal::new(symbol, side, price, stop_loss, take_profit, size);

                match entries.open_from_signal(signal).await {
                    Ok(position) => debug!("Signal accepted as #{}", position.id),
                    Err(e) if e.is_limit() => info!("Signal for {} skipped: {}", symbol, e),
                    Err(e) => warn!("Signal for {} rejected: {}", symbol, e),
                }
            }
        }
    }
    debug!("Signal producer stopped");
}
