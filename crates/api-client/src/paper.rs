use crate::classify::ErrorKind;
use crate::error::ApiError;
use crate::exchange::{CloseOrder, Exchange, Fill, OpenOrder};
use async_trait::async_trait;
use core_types::precision::calculate_quote_amount;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// The calls a failure can be queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperCall {
    MarkPrice,
    Open,
    Close,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    liquidated: HashSet<String>,
    failures: HashMap<PaperCall, VecDeque<ErrorKind>>,
    next_order_id: u64,
}

/// A simulated exchange that fills every order at the current mark price.
///
/// Prices are set by the caller, or read from a live `Exchange` when one is
/// attached as a price feed. Used for dry runs and tests.
#[derive(Default)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
    /// Fee charged on the quote amount of every fill, e.g. `0.0004`.
    fee_rate: Decimal,
    feed: Option<Arc<dyn Exchange>>,
}

impl PaperExchange {
    pub fn new(fee_rate: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            fee_rate,
            feed: None,
        }
    }

    /// Takes mark prices from `feed`; orders are never sent to it.
    pub fn with_price_feed(mut self, feed: Arc<dyn Exchange>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.prices.insert(symbol.to_string(), price);
    }

    /// The next close of `symbol` reports a liquidation.
    pub async fn liquidate(&self, symbol: &str) {
        self.state.lock().await.liquidated.insert(symbol.to_string());
    }

    /// Queues an error for the next `call`; queued errors are consumed in order.
    pub async fn fail_next(&self, call: PaperCall, kind: ErrorKind) {
        self.state
            .lock()
            .await
            .failures
            .entry(call)
            .or_default()
            .push_back(kind);
    }

    fn price_of(state: &PaperState, symbol: &str) -> Result<Decimal, ApiError> {
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ApiError::exchange(ErrorKind::InvalidParameters, format!("no price for {symbol}")))
    }

    /// Refreshes the stored price of `symbol` from the feed, if there is one.
    async fn refresh(&self, symbol: &str) -> Result<(), ApiError> {
        if let Some(feed) = &self.feed {
            let price = feed.mark_price(symbol).await?;
            self.state.lock().await.prices.insert(symbol.to_string(), price);
        }
        Ok(())
    }

    fn fill(&self, state: &mut PaperState, symbol: &str, size: Decimal) -> Result<Fill, ApiError> {
        let price = Self::price_of(state, symbol)?;
        let fee = price
            .checked_mul(self.fee_rate)
            .ok_or_else(|| ApiError::InvalidData(format!("fee overflow at price {price}")))
            .and_then(|unit_fee| {
                calculate_quote_amount(size, unit_fee).map_err(|e| ApiError::InvalidData(e.to_string()))
            })?;
        state.next_order_id += 1;
        Ok(Fill {
            order_id: format!("paper-{}", state.next_order_id),
            price,
            size: size.abs(),
            fee,
            liquidated: false,
        })
    }

    fn take_failure(state: &mut PaperState, call: PaperCall) -> Result<(), ApiError> {
        match state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(kind) => Err(ApiError::exchange(kind, format!("simulated {call:?} failure"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        Self::take_failure(&mut *self.state.lock().await, PaperCall::MarkPrice)?;
        self.refresh(symbol).await?;
        Self::price_of(&*self.state.lock().await, symbol)
    }

    async fn open_position(&self, order: &OpenOrder) -> Result<Fill, ApiError> {
        self.refresh(&order.symbol).await?;
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, PaperCall::Open)?;
        if order.size.is_zero() {
            return Err(ApiError::exchange(ErrorKind::InvalidParameters, "zero quantity"));
        }
        let fill = self.fill(&mut state, &order.symbol, order.size)?;
        info!(symbol = %order.symbol, direction = %order.direction, size = %fill.size, price = %fill.price, "Paper open filled.");
        Ok(fill)
    }

    async fn close_position(&self, order: &CloseOrder) -> Result<Fill, ApiError> {
        self.refresh(&order.symbol).await?;
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, PaperCall::Close)?;
        let mut fill = self.fill(&mut state, &order.symbol, order.size)?;
        fill.liquidated = state.liquidated.remove(&order.symbol);
        info!(symbol = %order.symbol, size = %fill.size, price = %fill.price, liquidated = fill.liquidated, "Paper close filled.");
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::PositionDirection;
    use retry::Classify;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn open_order(size: Decimal) -> OpenOrder {
        OpenOrder {
            client_order_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            direction: PositionDirection::Long,
            size,
            leverage: 5,
            margin: dec!(100),
        }
    }

    #[tokio::test]
    async fn test_fills_at_mark_price_with_cent_fee() {
        let exchange = PaperExchange::new(dec!(0.0004));
        exchange.set_price("BTCUSDT", dec!(50000)).await;
        let fill = exchange.open_position(&open_order(dec!(0.01))).await.unwrap();
        assert_eq!(fill.price, dec!(50000));
        assert_eq!(fill.fee, dec!(0.20));
    }

    #[tokio::test]
    async fn test_queued_failure_is_consumed_once() {
        let exchange = PaperExchange::new(Decimal::ZERO);
        exchange.set_price("BTCUSDT", dec!(50000)).await;
        exchange.fail_next(PaperCall::MarkPrice, ErrorKind::Timeout).await;

        let err = exchange.mark_price("BTCUSDT").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(exchange.mark_price("BTCUSDT").await.unwrap(), dec!(50000));
    }

    #[tokio::test]
    async fn test_unknown_symbol_and_liquidation() {
        let exchange = PaperExchange::new(Decimal::ZERO);
        let err = exchange.mark_price("ETHUSDT").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);

        exchange.set_price("BTCUSDT", dec!(40000)).await;
        exchange.liquidate("BTCUSDT").await;
        let close = CloseOrder {
            client_order_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            direction: PositionDirection::Long,
            size: dec!(0.01),
        };
        assert!(exchange.close_position(&close).await.unwrap().liquidated);
        assert!(!exchange.close_position(&close).await.unwrap().liquidated);
    }

    #[tokio::test]
    async fn test_price_feed_drives_fills() {
        let feed = Arc::new(PaperExchange::new(Decimal::ZERO));
        feed.set_price("BTCUSDT", dec!(61000)).await;
        let exchange = PaperExchange::new(Decimal::ZERO).with_price_feed(feed.clone());

        assert_eq!(exchange.mark_price("BTCUSDT").await.unwrap(), dec!(61000));
        feed.set_price("BTCUSDT", dec!(62000)).await;
        let fill = exchange.open_position(&open_order(dec!(0.01))).await.unwrap();
        assert_eq!(fill.price, dec!(62000));
    }
}
