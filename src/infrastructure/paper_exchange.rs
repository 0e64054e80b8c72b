//! In-memory exchange used for paper trading and tests.
//!
//! Fills happen immediately at the current mark. Positions are netted per
//! symbol (one-way mode) and `close` is reduce-only. Resting SL/TP orders
//! are not cancelled when a position goes flat, as on a real venue. Failures
//! and ticker latency can be scripted to exercise retry and inconsistency paths.

use crate::domain::entities::position::{PositionSide, ProtectiveOrders};
use crate::domain::repositories::exchange_client::{
    AccountTrade, ExchangeClient, ExchangeError, ExchangePosition, ExchangeResult, Fill,
};
use crate::domain::value_objects::symbol_rules::SymbolRules;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const ANY_OPERATION: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    symbol: String,
    kind: ProtectiveKind,
    trigger: Decimal,
    qty: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct NetPosition {
    /// Signed: positive long, negative short
    amount: Decimal,
    entry_price: Decimal,
}

#[derive(Default)]
struct PaperState {
    marks: HashMap<String, Decimal>,
    rules: HashMap<String, SymbolRules>,
    positions: HashMap<String, NetPosition>,
    trades: Vec<AccountTrade>,
    orders: HashMap<String, RestingOrder>,
    failures: HashMap<&'static str, (ExchangeError, usize)>,
    next_order_id: u64,
    trigger_protective: bool,
    ticker_latency: Option<Duration>,
}

/// +1 for long, -1 for short
fn direction(amount: Decimal) -> Decimal {
    if amount.is_sign_negative() {
        Decimal::NEGATIVE_ONE
    } else {
        Decimal::ONE
    }
}

impl PaperState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_order_id += 1;
        format!("{}-{}", prefix, self.next_order_id)
    }

    fn take_failure(&mut self, operation: &'static str) -> ExchangeResult<()> {
        for key in [operation, ANY_OPERATION] {
            if let Some((error, remaining)) = self.failures.get_mut(key) {
                let error = error.clone();
                *remaining -= 1;
                if *remaining == 0 {
                    self.failures.remove(key);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn mark(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }

    /// Reduce the net position on `symbol` by `qty` at `price` and book the fill.
    fn reduce(&mut self, symbol: &str, qty: Decimal, price: Decimal, time: DateTime<Utc>) -> ExchangeResult<Fill> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| ExchangeError::OrderRejected(format!("reduce-only: no position on {}", symbol)))?;
        if qty > position.amount.abs() {
            return Err(ExchangeError::OrderRejected(format!(
                "reduce-only: {} exceeds open {}",
                qty,
                position.amount.abs()
            )));
        }

        let sign = direction(position.amount);
        let realized_pnl = (price - position.entry_price) * qty * sign;
        position.amount -= qty * sign;
        if position.amount.is_zero() {
            self.positions.remove(symbol);
        }

        let order_id = self.next_id("close");
        self.trades.push(AccountTrade {
            symbol: symbol.to_string(),
            order_id: order_id.clone(),
            price,
            qty,
            realized_pnl,
            time,
        });
        Ok(Fill {
            order_id,
            price,
            qty,
        })
    }

    fn run_triggers(&mut self, symbol: &str, mark: Decimal) {
        let Some(position) = self.positions.get(symbol).copied() else {
            return;
        };
        let long = position.amount > Decimal::ZERO;
        let hit = self.orders.iter().find_map(|(id, order)| {
            if order.symbol != symbol {
                return None;
            }
            let crossed = match (order.kind, long) {
                (ProtectiveKind::StopLoss, true) | (ProtectiveKind::TakeProfit, false) => mark <= order.trigger,
                (ProtectiveKind::StopLoss, false) | (ProtectiveKind::TakeProfit, true) => mark >= order.trigger,
            };
            crossed.then(|| (id.clone(), order.qty))
        });
        if let Some((order_id, qty)) = hit {
            debug!("Paper protective order {} triggered on {} at {}", order_id, symbol, mark);
            let qty = qty.min(position.amount.abs());
            self.orders.remove(&order_id);
            if let Err(e) = self.reduce(symbol, qty, mark, Utc::now()) {
                debug!("Paper protective order {} on {} not filled: {}", order_id, symbol, e);
            }
        }
    }
}

/// Paper trading exchange
#[derive(Default)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
    ticker_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute resting SL/TP orders when a new mark crosses them
    pub fn with_protective_triggers(self) -> Self {
        self.state().trigger_protective = true;
        self
    }

    /// Delay every ticker request by `latency`
    pub fn with_ticker_latency(self, latency: Duration) -> Self {
        self.state().ticker_latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        let mut state = self.state();
        state.marks.insert(symbol.to_string(), price);
        if state.trigger_protective {
            state.run_triggers(symbol, price);
        }
    }

    pub fn set_rules(&self, symbol: &str, rules: SymbolRules) {
        self.state().rules.insert(symbol.to_string(), rules);
    }

    /// Make the next `count` calls of `operation` fail with `error`
    pub fn fail_operation(&self, operation: &'static str, error: ExchangeError, count: usize) {
        if count > 0 {
            self.state().failures.insert(operation, (error, count));
        }
    }

    /// Make the next `count` calls of any operation fail with `error`
    pub fn fail_next_calls(&self, error: ExchangeError, count: usize) {
        self.fail_operation(ANY_OPERATION, error, count);
    }

    /// Seed a position as if it had been opened outside this process
    pub fn seed_position(&self, symbol: &str, amount: Decimal, entry_price: Decimal) {
        self.state()
            .positions
            .insert(symbol.to_string(), NetPosition { amount, entry_price });
    }

    /// Flatten a position the way an exchange-side stop would, booking a fill at `price`
    pub fn close_externally(&self, symbol: &str, price: Decimal, time: DateTime<Utc>) -> ExchangeResult<Fill> {
        let mut state = self.state();
        let qty = state
            .positions
            .get(symbol)
            .map(|p| p.amount.abs())
            .ok_or_else(|| ExchangeError::OrderRejected(format!("no position on {}", symbol)))?;
        state.reduce(symbol, qty, price, time)
    }

    pub fn position_amount(&self, symbol: &str) -> Decimal {
        self.state()
            .positions
            .get(symbol)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn resting_orders(&self, symbol: &str) -> usize {
        self.state()
            .orders
            .values()
            .filter(|order| order.symbol == symbol)
            .count()
    }

    pub fn ticker_calls(&self) -> usize {
        self.ticker_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        leverage: u32,
    ) -> ExchangeResult<Fill> {
        let mut state = self.state();
        state.take_failure("open")?;
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!("quantity must be positive, got {}", qty)));
        }
        if leverage == 0 {
            return Err(ExchangeError::InvalidOrder("leverage must be at least 1".to_string()));
        }
        let price = state.mark(symbol)?;
        let signed = match side {
            PositionSide::Long => qty,
            PositionSide::Short => -qty,
        };

        let net = state.positions.entry(symbol.to_string()).or_insert(NetPosition {
            amount: Decimal::ZERO,
            entry_price: price,
        });
        if !net.amount.is_zero() && direction(net.amount) != direction(signed) {
            return Err(ExchangeError::OrderRejected(format!(
                "{} already has an opposite position",
                symbol
            )));
        }
        let total = net.amount.abs() + qty;
        net.entry_price = (net.entry_price * net.amount.abs() + price * qty) / total;
        net.amount += signed;

        let order_id = state.next_id("open");
        state.trades.push(AccountTrade {
            symbol: symbol.to_string(),
            order_id: order_id.clone(),
            price,
            qty,
            realized_pnl: Decimal::ZERO,
            time: Utc::now(),
        });
        Ok(Fill {
            order_id,
            price,
            qty,
        })
    }

    async fn close(&self, symbol: &str, qty: Decimal) -> ExchangeResult<Fill> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.take_failure("close")?;
        let price = state.mark(symbol)?;
        state.reduce(symbol, qty, price, Utc::now())
    }

    async fn cancel(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut state = self.state();
        state.take_failure("cancel")?;
        state
            .orders
            .remove(order_id)
            .map(|_| ())
            .ok_or_else(|| ExchangeError::OrderRejected(format!("unknown order {}", order_id)))
    }

    async fn place_protective(
        &self,
        symbol: &str,
        stop_price: Decimal,
        tp_price: Option<Decimal>,
        qty: Decimal,
    ) -> ExchangeResult<ProtectiveOrders> {
        let mut state = self.state();
        state.take_failure("place_protective")?;
        if !state.positions.contains_key(symbol) {
            return Err(ExchangeError::OrderRejected(format!("no position on {}", symbol)));
        }

        let sl_id = state.next_id("sl");
        state.orders.insert(
            sl_id.clone(),
            RestingOrder {
                symbol: symbol.to_string(),
                kind: ProtectiveKind::StopLoss,
                trigger: stop_price,
                qty,
            },
        );
        let tp_id = match tp_price {
            Some(trigger) => {
                let id = state.next_id("tp");
                state.orders.insert(
                    id.clone(),
                    RestingOrder {
                        symbol: symbol.to_string(),
                        kind: ProtectiveKind::TakeProfit,
                        trigger,
                        qty,
                    },
                );
                Some(id)
            }
            None => None,
        };

        Ok(ProtectiveOrders {
            sl_order_id: Some(sl_id),
            tp_order_id: tp_id,
        })
    }

    async fn open_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let mut state = self.state();
        state.take_failure("open_positions")?;
        Ok(state
            .positions
            .iter()
            .filter(|(_, p)| !p.amount.is_zero())
            .map(|(symbol, p)| ExchangePosition {
                symbol: symbol.clone(),
                amount: p.amount,
                entry_price: p.entry_price,
                mark_price: state.marks.get(symbol).copied(),
            })
            .collect())
    }

    async fn account_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> ExchangeResult<Vec<AccountTrade>> {
        let mut state = self.state();
        state.take_failure("account_trades")?;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && t.time >= since)
            .cloned()
            .collect())
    }

    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.state().ticker_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.take_failure("ticker_price")?;
        state.mark(symbol)
    }

    async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let mut state = self.state();
        state.take_failure("symbol_rules")?;
        Ok(state.rules.get(symbol).copied().unwrap_or_default())
    }
}
