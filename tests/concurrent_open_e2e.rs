//! Concurrent Access End-to-End Tests
//!
//! Many tasks race on one ledger from a multi-threaded runtime. The
//! position limits and the closing history must hold no matter how the
//! tasks interleave, and slow exchange I/O in the monitor must not hold up
//! ledger writers.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tradekeeper::application::actors::{MonitorConfig, PositionMonitor};
use tradekeeper::domain::entities::closed_trade::CloseReason;
use tradekeeper::domain::entities::position::{
    NewPosition, PositionSide, PositionStatus, ProtectiveOrders,
};
use tradekeeper::domain::errors::{LedgerError, PositionLimitType};
use tradekeeper::domain::services::position_ledger::{PositionLedger, PositionLimits};
use tradekeeper::domain::services::price_oracle::{PriceOracle, PriceOracleConfig};
use tradekeeper::infrastructure::notifier::LogNotifier;
use tradekeeper::infrastructure::paper_exchange::PaperExchange;
use tradekeeper::persistence::repository::SqliteLedgerStore;
use tradekeeper::persistence::{init_database, DatabaseConfig, DbPool};
use tradekeeper::retry::{RetryExecutor, RetryPolicy};

async fn ledger(limits: PositionLimits) -> (Arc<PositionLedger>, DbPool) {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
    let ledger = PositionLedger::restore(Arc::new(SqliteLedgerStore::new(pool.clone())), limits)
        .await
        .unwrap();
    (Arc::new(ledger), pool)
}

fn simulated(symbol: String) -> NewPosition {
    NewPosition {
        symbol,
        side: PositionSide::Short,
        status: PositionStatus::Simulated,
        entry_price: dec!(50),
        size: dec!(1),
        qty_step: dec!(0.01),
        leverage: 3,
        stop_loss: dec!(55),
        take_profit: Some(dec!(40)),
        trailing_distance: None,
        partial_levels: [None, None],
        protective_orders: ProtectiveOrders::default(),
        entry_order_id: None,
        opened_at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_opens_respect_total_limit() {
    let (ledger, pool) = ledger(PositionLimits {
        max_total: 5,
        max_per_symbol: 1,
    })
    .await;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.open(simulated(format!("COIN{}USDT", i))).await })
        })
        .collect();

    let mut opened = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => opened += 1,
            Err(LedgerError::LimitExceeded { limit_type, .. }) => {
                assert_eq!(limit_type, PositionLimitType::Total);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(opened, 5);
    assert_eq!(rejected, 15);
    assert_eq!(ledger.open_count().await, 5);

    // The store agrees with memory
    let reloaded = PositionLedger::restore(
        Arc::new(SqliteLedgerStore::new(pool)),
        PositionLimits::default(),
    )
    .await
    .unwrap();
    assert_eq!(reloaded.open_count().await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_opens_respect_per_symbol_limit() {
    let (ledger, _pool) = ledger(PositionLimits::default()).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.open(simulated("BTCUSDT".to_string())).await })
        })
        .collect();

    let results: Vec<_> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        LedgerError::LimitExceeded {
            limit_type: PositionLimitType::PerSymbol,
            ..
        }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_closes_record_one_trade() {
    let (ledger, _pool) = ledger(PositionLimits::default()).await;
    let id = ledger.open(simulated("ETHUSDT".to_string())).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.close(id, dec!(45), CloseReason::TakeProfit).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(trade) => {
                winners += 1;
                assert_eq!(trade.pnl.amount, dec!(5));
            }
            Err(e) => assert!(matches!(e, LedgerError::PositionNotFound(p) if p == id)),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(ledger.closed_trades_for(id).await.unwrap().len(), 1);
    assert_eq!(ledger.open_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_not_blocked_by_slow_price_fetch() {
    let (ledger, _pool) = ledger(PositionLimits::default()).await;
    let latency = Duration::from_millis(800);
    let exchange = Arc::new(PaperExchange::new().with_ticker_latency(latency));
    exchange.set_mark("SLOWUSDT", dec!(50));

    let executor = || {
        RetryExecutor::new(RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        })
    };
    let oracle = Arc::new(PriceOracle::new(
        exchange.clone(),
        executor(),
        PriceOracleConfig {
            max_age: Duration::from_millis(1),
            capacity: 16,
        },
    ));
    let mut monitor = PositionMonitor::new(
        ledger.clone(),
        exchange.clone(),
        oracle,
        executor(),
        Arc::new(LogNotifier),
        MonitorConfig {
            interval: Duration::from_millis(50),
            ..MonitorConfig::default()
        },
    );

    ledger.open(simulated("SLOWUSDT".to_string())).await.unwrap();
    let cycle = tokio::spawn(async move { monitor.run_cycle().await });

    // Let the cycle take its snapshot and block on the ticker
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exchange.ticker_calls(), 1);
    assert!(!cycle.is_finished());

    let started = Instant::now();
    let id = tokio::time::timeout(
        Duration::from_millis(300),
        ledger.open(simulated("FASTUSDT".to_string())),
    )
    .await
    .expect("open waited on the monitor's price fetch")
    .unwrap();
    assert!(started.elapsed() < latency);
    assert!(!cycle.is_finished());

    let report = cycle.await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert!(ledger.get(id).await.is_some());
    assert_eq!(ledger.open_count().await, 2);
}
