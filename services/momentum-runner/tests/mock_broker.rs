//! Mocked bridge for testing without external services
//!
//! Serves canned indicator frames per timeframe, a settable price and book,
//! and records every order call. Failure switches let tests drive the
//! fallback and orphan paths.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use momentum_runner::gateway::{AccountFeed, MarketData, OrderBookFeed, OrderGateway};
use momentum_runner::types::{
    Bar, BracketOrder, DepthSnapshot, Direction, IcebergLevel, IndicatorFrame, IndicatorSpec,
    TickMeta, Timeframe,
};
use momentum_runner::{GatewayError, GatewayResult};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Every order-side call the engine made
#[derive(Debug, Clone, PartialEq)]
pub enum OrderCall {
    Submit(BracketOrder),
    Modify { id: String, stop: Decimal },
    CancelStop(String),
    PlaceStop { id: String, stop: Decimal },
    Close(String),
}

pub struct MockState {
    pub price: Option<Decimal>,
    pub frames: HashMap<Timeframe, IndicatorFrame>,
    pub imbalance: Option<f64>,
    pub icebergs: Vec<IcebergLevel>,
    pub snapshot: DepthSnapshot,
    pub balance: Decimal,
    pub tick_meta: Option<TickMeta>,
    pub fail_modify: bool,
    pub fail_cancel: bool,
    pub fail_place: bool,
    /// Fail this many upcoming `place_stop` calls
    pub place_failures: u32,
    pub fail_close: bool,
    /// Fail this many upcoming `close_position` calls
    pub close_failures: u32,
    pub submit_error: Option<GatewayError>,
    pub submit_delay: Option<Duration>,
    pub calls: Vec<OrderCall>,
    pub next_order: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            price: Some(Decimal::from(5000)),
            frames: HashMap::new(),
            imbalance: Some(2.0),
            icebergs: Vec::new(),
            snapshot: DepthSnapshot::default(),
            balance: Decimal::from(100_000),
            tick_meta: Some(TickMeta {
                tick_size: Decimal::new(25, 2),
                tick_value: Decimal::new(1250, 2),
            }),
            fail_modify: false,
            fail_cancel: false,
            fail_place: false,
            place_failures: 0,
            fail_close: false,
            close_failures: 0,
            submit_error: None,
            submit_delay: None,
            calls: Vec::new(),
            next_order: 1,
        }
    }
}

/// Mock broker/feature bridge
#[derive(Default)]
pub struct MockBroker {
    pub state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn set_price(&self, price: Decimal) {
        self.state.lock().unwrap().price = Some(price);
    }

    pub fn set_frame(&self, timeframe: Timeframe, frame: IndicatorFrame) {
        self.state.lock().unwrap().frames.insert(timeframe, frame);
    }

    pub fn calls(&self) -> Vec<OrderCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Stops sent through `modify_stop`, in order
    pub fn modified_stops(&self) -> Vec<Decimal> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OrderCall::Modify { stop, .. } => Some(stop),
                _ => None,
            })
            .collect()
    }

    pub fn cancel_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, OrderCall::CancelStop(_)))
            .count()
    }

    /// Stops accepted through `place_stop`, in order
    pub fn placed_stops(&self) -> Vec<Decimal> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OrderCall::PlaceStop { stop, .. } => Some(stop),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OrderCall::Close(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: OrderCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn tail_frame(frame: &IndicatorFrame, count: usize) -> IndicatorFrame {
    let start = frame.bars.len().saturating_sub(count);
    let mut out = IndicatorFrame::new(frame.bars[start..].to_vec());
    for (name, values) in &frame.columns {
        let col_start = values.len().saturating_sub(count);
        out.columns.insert(name.clone(), values[col_start..].to_vec());
    }
    out
}

#[async_trait]
impl MarketData for MockBroker {
    async fn bars(&self, timeframe: Timeframe, count: usize) -> GatewayResult<Vec<Bar>> {
        let state = self.state.lock().unwrap();
        match state.frames.get(&timeframe) {
            Some(frame) => Ok(tail_frame(frame, count).bars),
            None => Ok(Vec::new()),
        }
    }

    async fn indicator_frame(
        &self,
        timeframe: Timeframe,
        count: usize,
        _indicators: &[IndicatorSpec],
    ) -> GatewayResult<IndicatorFrame> {
        let state = self.state.lock().unwrap();
        Ok(state
            .frames
            .get(&timeframe)
            .map(|f| tail_frame(f, count))
            .unwrap_or_default())
    }

    async fn current_price(&self) -> GatewayResult<Decimal> {
        self.state
            .lock()
            .unwrap()
            .price
            .ok_or_else(|| GatewayError::Unavailable("current_price".to_string()))
    }
}

#[async_trait]
impl OrderBookFeed for MockBroker {
    async fn depth_imbalance(&self, _levels: u32) -> GatewayResult<f64> {
        self.state
            .lock()
            .unwrap()
            .imbalance
            .ok_or_else(|| GatewayError::Unavailable("depth_imbalance".to_string()))
    }

    async fn detect_icebergs(&self) -> GatewayResult<Vec<IcebergLevel>> {
        Ok(self.state.lock().unwrap().icebergs.clone())
    }

    async fn depth_snapshot(&self, _levels: u32) -> GatewayResult<DepthSnapshot> {
        Ok(self.state.lock().unwrap().snapshot.clone())
    }
}

#[async_trait]
impl OrderGateway for MockBroker {
    async fn submit_bracket(&self, order: &BracketOrder) -> GatewayResult<String> {
        let delay = self.state.lock().unwrap().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(OrderCall::Submit(order.clone()));
        if let Some(err) = state.submit_error.clone() {
            return Err(err);
        }
        let id = format!("ord-{}", state.next_order);
        state.next_order += 1;
        Ok(id)
    }

    async fn modify_stop(&self, order_id: &str, new_stop: Decimal) -> GatewayResult<()> {
        if self.state.lock().unwrap().fail_modify {
            return Err(GatewayError::Rejected("modify not supported".to_string()));
        }
        self.record(OrderCall::Modify {
            id: order_id.to_string(),
            stop: new_stop,
        });
        Ok(())
    }

    async fn cancel_stop(&self, order_id: &str) -> GatewayResult<()> {
        if self.state.lock().unwrap().fail_cancel {
            return Err(GatewayError::Rejected("cancel failed".to_string()));
        }
        self.record(OrderCall::CancelStop(order_id.to_string()));
        Ok(())
    }

    async fn place_stop(
        &self,
        order_id: &str,
        _direction: Direction,
        _size: u32,
        stop_price: Decimal,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_place || state.place_failures > 0 {
            state.place_failures = state.place_failures.saturating_sub(1);
            return Err(GatewayError::Rejected("stop placement rejected".to_string()));
        }
        state.calls.push(OrderCall::PlaceStop {
            id: order_id.to_string(),
            stop: stop_price,
        });
        Ok(())
    }

    async fn close_position(&self, position_id: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(OrderCall::Close(position_id.to_string()));
        if state.fail_close || state.close_failures > 0 {
            state.close_failures = state.close_failures.saturating_sub(1);
            return Err(GatewayError::Rejected("close rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountFeed for MockBroker {
    async fn balance(&self) -> GatewayResult<Decimal> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn tick_meta(&self) -> GatewayResult<TickMeta> {
        self.state
            .lock()
            .unwrap()
            .tick_meta
            .ok_or_else(|| GatewayError::Unavailable("tick_meta".to_string()))
    }
}

/// `n` flat bars closing at `close`, oldest first
pub fn flat_bars(timeframe: Timeframe, n: usize, close: i64, volume: i64) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap();
    (0..n)
        .map(|i| Bar {
            timestamp: start + ChronoDuration::seconds(timeframe.to_seconds() * i as i64),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::from(volume),
        })
        .collect()
}

/// Column of `n` values ending in `last`, padded with `fill`
pub fn column(n: usize, fill: f64, last: &[f64]) -> Vec<Option<f64>> {
    let mut values = vec![Some(fill); n - last.len()];
    values.extend(last.iter().map(|v| Some(*v)));
    values
}
