//! Per-position exit management
//!
//! Each open position gets its own monitoring task. Every tick it checks, in
//! order: target/stop, time without progress, trend reversal; then tightens
//! risk (breakeven, then SAR trailing). The stop only ever moves in the
//! risk-reducing direction. A stop that was cancelled but not replaced is
//! re-placed at the last confirmed level before anything else moves it.
//!
//! Closing is monotonic: once an exit fires the position leaves the book
//! whether or not the close order was accepted.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ExitConfig, TimeframeConfig, TrendConfig};
use crate::error::{EngineError, GatewayResult};
use crate::gateway::{guarded, AccountFeed, Collaborators, MarketData, OrderGateway};
use crate::portfolio::{PositionBook, PositionSummary};
use crate::risk::realized_pnl;
use crate::types::{columns, Direction, IndicatorSpec, TickMeta, Timeframe};

/// Lifecycle phase of a managed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPhase {
    Armed,
    BreakevenPending,
    BreakevenActive,
    Trailing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TargetReached,
    StopLossHit,
    TimeExit,
    TrendReversal,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TargetReached => "Target reached",
            ExitReason::StopLossHit => "Stop loss hit",
            ExitReason::TimeExit => "Time exit - no progress",
            ExitReason::TrendReversal => "Trend reversal detected",
            ExitReason::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed position, owned by its monitoring task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub size: u32,
    pub entry_time: DateTime<Utc>,
    pub breakeven_activated: bool,
    pub trailing_activated: bool,
    pub phase: ExitPhase,
    /// Distance to the stop at entry; breakeven triggers are measured in it
    pub initial_risk: Decimal,
    /// Broker stop was cancelled and no replacement is confirmed
    pub stop_missing: bool,
}

impl Position {
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
        size: u32,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            entry_price,
            stop_price,
            target_price,
            size,
            entry_time,
            breakeven_activated: false,
            trailing_activated: false,
            phase: ExitPhase::Armed,
            initial_risk: (entry_price - stop_price).abs(),
            stop_missing: false,
        }
    }

    pub fn summary(&self) -> PositionSummary {
        PositionSummary {
            id: self.id.clone(),
            direction: self.direction,
            size: self.size,
            entry_price: self.entry_price,
        }
    }

    /// Recompute the phase from the activation flags
    fn sync_phase(&mut self) {
        if self.phase == ExitPhase::Closed {
            return;
        }
        self.phase = if self.trailing_activated {
            ExitPhase::Trailing
        } else if self.breakeven_activated {
            ExitPhase::BreakevenActive
        } else {
            ExitPhase::BreakevenPending
        };
    }

    /// True when `stop` is tighter than the current stop
    fn tightens(&self, stop: Decimal) -> bool {
        match self.direction {
            Direction::Long => stop > self.stop_price,
            Direction::Short => stop < self.stop_price,
        }
    }
}

/// Target or stop touched at `price`
pub fn price_exit(position: &Position, price: Decimal) -> Option<ExitReason> {
    match position.direction {
        Direction::Long if price >= position.target_price => Some(ExitReason::TargetReached),
        Direction::Long if price <= position.stop_price => Some(ExitReason::StopLossHit),
        Direction::Short if price <= position.target_price => Some(ExitReason::TargetReached),
        Direction::Short if price >= position.stop_price => Some(ExitReason::StopLossHit),
        _ => None,
    }
}

/// Time limit passed with no net progress versus entry
pub fn time_exit(position: &Position, price: Decimal, now: DateTime<Utc>, limit_minutes: i64) -> bool {
    if now - position.entry_time <= chrono::Duration::minutes(limit_minutes) {
        return false;
    }
    match position.direction {
        Direction::Long => price <= position.entry_price,
        Direction::Short => price >= position.entry_price,
    }
}

/// Medium-timeframe momentum opposing the position
pub fn reversal_signal(direction: Direction, hist: f64, threshold: f64) -> bool {
    match direction {
        Direction::Long => hist < -threshold,
        Direction::Short => hist > threshold,
    }
}

/// Unrealized profit has reached `initial_risk * ratio`
pub fn breakeven_triggered(position: &Position, price: Decimal, ratio: Decimal) -> bool {
    let trigger = position.initial_risk * ratio;
    match position.direction {
        Direction::Long => price >= position.entry_price + trigger,
        Direction::Short => price <= position.entry_price - trigger,
    }
}

/// Entry shifted by `offset` in the position's favor
pub fn breakeven_stop(position: &Position, offset: Decimal) -> Decimal {
    position.entry_price + position.direction.sign() * offset
}

/// Candidate trailing stop, accepted only if it tightens and stays behind price
pub fn trailing_candidate(position: &Position, candidate: Decimal, price: Decimal) -> Option<Decimal> {
    let behind_price = match position.direction {
        Direction::Long => candidate < price,
        Direction::Short => candidate > price,
    };
    (position.tightens(candidate) && behind_price).then_some(candidate)
}

/// Outcome of a finished position, consumed by the risk guard
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub position_id: String,
    pub direction: Direction,
    pub reason: ExitReason,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub size: u32,
    pub pnl: Option<Decimal>,
    /// False when the close order failed and the position was orphaned
    pub closed: bool,
}

/// Close order attempts before a position is reported orphaned
const CLOSE_ATTEMPTS: u32 = 2;

struct ExitContext {
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderGateway>,
    account: Arc<dyn AccountFeed>,
    config: ExitConfig,
    macd: IndicatorSpec,
    trailing_timeframe: Timeframe,
    reversal_timeframe: Timeframe,
    call_timeout: Duration,
    book: Arc<PositionBook>,
    reports: mpsc::Sender<ExitReport>,
}

impl ExitContext {
    async fn current_price(&self) -> Option<Decimal> {
        match guarded("current_price", self.call_timeout, self.market.current_price()).await {
            Ok(price) => Some(price),
            Err(e) => {
                debug!(error = %e, "Price unavailable, skipping tick");
                None
            }
        }
    }

    async fn tick_meta(&self) -> Option<TickMeta> {
        match guarded("tick_meta", self.call_timeout, self.account.tick_meta()).await {
            Ok(meta) if meta.is_valid() => Some(meta),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Tick metadata unavailable");
                None
            }
        }
    }

    async fn trend_reversed(&self, direction: Direction) -> bool {
        let count = self.config.reversal_min_bars.max(50);
        let call = self
            .market
            .indicator_frame(self.reversal_timeframe, count, std::slice::from_ref(&self.macd));
        let frame = match guarded("indicator_frame", self.call_timeout, call).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Reversal frame unavailable");
                return false;
            }
        };
        if !frame.has_window(self.config.reversal_min_bars) {
            return false;
        }
        frame
            .last(columns::MACD_HIST)
            .map(|hist| reversal_signal(direction, hist, self.config.reversal_hist_threshold))
            .unwrap_or(false)
    }

    /// One monitoring tick; returns the exit reason and price when an exit fires
    async fn tick(&self, position: &mut Position) -> Option<(ExitReason, Decimal)> {
        let price = self.current_price().await?;

        if let Some(reason) = price_exit(position, price) {
            return Some((reason, price));
        }
        if time_exit(position, price, Utc::now(), self.config.time_exit_minutes) {
            return Some((ExitReason::TimeExit, price));
        }
        if self.trend_reversed(position.direction).await {
            return Some((ExitReason::TrendReversal, price));
        }

        if position.stop_missing {
            self.restore_stop(position).await;
        }
        self.breakeven_step(position, price).await;
        if position.trailing_activated {
            self.trail(position, price).await;
        }
        position.sync_phase();
        None
    }

    async fn breakeven_step(&self, position: &mut Position, price: Decimal) {
        if position.breakeven_activated && (position.trailing_activated || !self.config.trailing_enabled) {
            return;
        }
        if !breakeven_triggered(position, price, self.config.breakeven_trigger_ratio) {
            return;
        }

        if !position.breakeven_activated {
            self.move_to_breakeven(position, price).await;
        }
        if self.config.trailing_enabled && !position.trailing_activated {
            position.trailing_activated = true;
            info!(position_id = %position.id, breakeven = position.breakeven_activated, "Trailing stop activated");
        }
    }

    async fn move_to_breakeven(&self, position: &mut Position, price: Decimal) {
        let Some(meta) = self.tick_meta().await else {
            warn!(position_id = %position.id, "Cannot move stop to breakeven without tick metadata");
            return;
        };
        let offset = Decimal::from(self.config.breakeven_offset_ticks) * meta.tick_size;
        let new_stop = breakeven_stop(position, offset);

        if !position.tightens(new_stop) {
            // trailing already carried the stop past breakeven
            position.breakeven_activated = true;
            return;
        }
        if trailing_candidate(position, new_stop, price).is_none() {
            debug!(position_id = %position.id, stop = %new_stop, "Breakeven stop not behind price yet");
            return;
        }

        match self.change_stop(position, new_stop).await {
            Ok(()) => self.apply_breakeven(position, new_stop),
            Err(e) => warn!(position_id = %position.id, stop = %new_stop, error = %e, "Failed to move stop to breakeven"),
        }
    }

    /// Move the broker stop: modify in place, else cancel and replace
    ///
    /// `position.stop_price` is left to the caller. Once a cancel went
    /// through, later attempts skip straight to placing a stop.
    async fn change_stop(&self, position: &mut Position, new_stop: Decimal) -> GatewayResult<()> {
        if !position.stop_missing {
            let modify = self.orders.modify_stop(&position.id, new_stop);
            match guarded("modify_stop", self.call_timeout, modify).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(position_id = %position.id, error = %e, "Stop modify failed, replacing"),
            }
            guarded("cancel_stop", self.call_timeout, self.orders.cancel_stop(&position.id)).await?;
            position.stop_missing = true;
        }

        let placed = self.place_stop(position, new_stop).await;
        if placed.is_ok() {
            position.stop_missing = false;
            return placed;
        }

        warn!(position_id = %position.id, stop = %new_stop, "Replacement stop rejected, restoring previous stop");
        self.restore_stop(position).await;
        placed
    }

    /// Re-place the last confirmed stop after a failed replacement
    async fn restore_stop(&self, position: &mut Position) {
        match self.place_stop(position, position.stop_price).await {
            Ok(()) => {
                position.stop_missing = false;
                info!(position_id = %position.id, stop = %position.stop_price, "Protective stop restored");
            }
            Err(e) => error!(position_id = %position.id, error = %e, "Position has no protective stop"),
        }
    }

    async fn place_stop(&self, position: &Position, stop: Decimal) -> GatewayResult<()> {
        let place = self
            .orders
            .place_stop(&position.id, position.direction, position.size, stop);
        guarded("place_stop", self.call_timeout, place).await
    }

    fn apply_breakeven(&self, position: &mut Position, new_stop: Decimal) {
        position.stop_price = new_stop;
        position.breakeven_activated = true;
        info!(position_id = %position.id, stop = %new_stop, "Moved stop to breakeven");
    }

    async fn trail(&self, position: &mut Position, price: Decimal) {
        let spec = IndicatorSpec::Sar {
            af: self.config.sar_af,
            max_af: self.config.sar_max_af,
        };
        let count = self.config.trailing_min_bars.max(100);
        let call = self
            .market
            .indicator_frame(self.trailing_timeframe, count, std::slice::from_ref(&spec));
        let frame = match guarded("indicator_frame", self.call_timeout, call).await {
            Ok(frame) if frame.has_window(self.config.trailing_min_bars) => frame,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "SAR frame unavailable");
                return;
            }
        };
        let Some(sar) = frame.last(columns::SAR).and_then(Decimal::from_f64) else {
            return;
        };
        let Some(new_stop) = trailing_candidate(position, sar, price) else {
            return;
        };

        match self.change_stop(position, new_stop).await {
            Ok(()) => {
                debug!(position_id = %position.id, from = %position.stop_price, to = %new_stop, "Trailing stop moved");
                position.stop_price = new_stop;
            }
            Err(e) => warn!(position_id = %position.id, error = %e, "Failed to update trailing stop"),
        }
    }

    async fn close(&self, position: &mut Position, reason: ExitReason, price: Option<Decimal>) {
        info!(position_id = %position.id, reason = %reason, "Exit triggered");

        let mut closed = false;
        for attempt in 1..=CLOSE_ATTEMPTS {
            let call = self.orders.close_position(&position.id);
            match guarded("close_position", self.call_timeout, call).await {
                Ok(()) => {
                    info!(position_id = %position.id, reason = %reason, "Position closed");
                    closed = true;
                    break;
                }
                Err(e) if attempt < CLOSE_ATTEMPTS => {
                    warn!(position_id = %position.id, attempt, error = %e, "Close failed, retrying");
                }
                Err(e) => {
                    error!(position_id = %position.id, reason = %reason, error = %e, "Close failed, position orphaned");
                }
            }
        }
        position.phase = ExitPhase::Closed;
        self.book.remove(&position.id).await;

        let exit_price = match price {
            Some(p) => Some(p),
            None if closed => self.current_price().await,
            None => None,
        };
        let pnl = match (closed, exit_price) {
            (true, Some(exit)) => self
                .tick_meta()
                .await
                .map(|meta| realized_pnl(position.direction, position.entry_price, exit, position.size, &meta)),
            _ => None,
        };

        let report = ExitReport {
            position_id: position.id.clone(),
            direction: position.direction,
            reason,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl,
            closed,
        };
        if self.reports.send(report).await.is_err() {
            debug!(position_id = %position.id, "Exit report dropped, receiver gone");
        }
    }
}

async fn monitor(ctx: Arc<ExitContext>, mut position: Position, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(ctx.config.tick_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (reason, price) = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break (ExitReason::Shutdown, None),
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break (ExitReason::Shutdown, None),
            outcome = ctx.tick(&mut position) => {
                if let Some((reason, price)) = outcome {
                    break (reason, Some(price));
                }
            }
        }
    };

    ctx.close(&mut position, reason, price).await;
}

/// Spawns and tracks monitoring tasks
pub struct ExitManager {
    ctx: Arc<ExitContext>,
}

impl ExitManager {
    pub fn new(
        collaborators: &Collaborators,
        config: ExitConfig,
        trend: &TrendConfig,
        timeframes: &TimeframeConfig,
        book: Arc<PositionBook>,
        reports: mpsc::Sender<ExitReport>,
    ) -> Self {
        Self {
            ctx: Arc::new(ExitContext {
                market: collaborators.market.clone(),
                orders: collaborators.orders.clone(),
                account: collaborators.account.clone(),
                config,
                macd: IndicatorSpec::Macd {
                    fast: trend.macd_fast,
                    slow: trend.macd_slow,
                    signal: trend.macd_signal,
                },
                trailing_timeframe: timeframes.entry,
                reversal_timeframe: timeframes.trend_medium,
                call_timeout: collaborators.call_timeout,
                book,
                reports,
            }),
        }
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.ctx.book
    }

    /// Start monitoring `position`; rejects an id that is already managed
    pub async fn manage(&self, position: Position) -> Result<(), EngineError> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ctx = self.ctx.clone();
        let summary = position.summary();
        self.ctx
            .book
            .insert_with(summary, cancel, move || tokio::spawn(monitor(ctx, position, token)))
            .await
    }

    pub async fn active_count(&self) -> usize {
        self.ctx.book.len().await
    }

    /// Cancel every monitoring task and wait for their closes, up to `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let detached = self.ctx.book.drain().await;
        if detached.is_empty() {
            return;
        }
        info!(count = detached.len(), "Closing active positions");

        let deadline = tokio::time::Instant::now() + grace;
        for task in detached {
            match tokio::time::timeout_at(deadline, task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(position_id = %task.id, error = %e, "Monitoring task failed"),
                Err(_) => warn!(position_id = %task.id, "Monitoring task did not finish within grace period"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn long() -> Position {
        Position::new(
            "p1",
            Direction::Long,
            dec!(5000),
            dec!(4995),
            dec!(5010),
            2,
            Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
        )
    }

    fn short() -> Position {
        Position::new(
            "p2",
            Direction::Short,
            dec!(5000),
            dec!(5005),
            dec!(4990),
            1,
            Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
        )
    }

    #[test]
    fn test_price_exits_long_and_short() {
        let p = long();
        assert_eq!(price_exit(&p, dec!(5010)), Some(ExitReason::TargetReached));
        assert_eq!(price_exit(&p, dec!(4995)), Some(ExitReason::StopLossHit));
        assert_eq!(price_exit(&p, dec!(5003)), None);

        let s = short();
        assert_eq!(price_exit(&s, dec!(4990)), Some(ExitReason::TargetReached));
        assert_eq!(price_exit(&s, dec!(5005)), Some(ExitReason::StopLossHit));
    }

    #[test]
    fn test_time_exit_requires_elapsed_and_no_progress() {
        let p = long();
        let later = p.entry_time + chrono::Duration::minutes(6);
        let early = p.entry_time + chrono::Duration::minutes(4);

        assert!(time_exit(&p, dec!(4999), later, 5));
        assert!(time_exit(&p, dec!(5000), later, 5));
        assert!(!time_exit(&p, dec!(5001), later, 5));
        assert!(!time_exit(&p, dec!(4999), early, 5));

        let s = short();
        assert!(time_exit(&s, dec!(5001), later, 5));
        assert!(!time_exit(&s, dec!(4999), later, 5));
    }

    #[test]
    fn test_breakeven_reference_case() {
        let p = long();
        assert!(!breakeven_triggered(&p, dec!(5004.75), dec!(1.0)));
        assert!(breakeven_triggered(&p, dec!(5005), dec!(1.0)));
        assert_eq!(breakeven_stop(&p, dec!(5) * dec!(0.25)), dec!(5001.25));

        let s = short();
        assert!(breakeven_triggered(&s, dec!(4995), dec!(1.0)));
        assert_eq!(breakeven_stop(&s, dec!(1.25)), dec!(4998.75));
    }

    #[test]
    fn test_trailing_never_loosens() {
        let mut p = long();
        p.stop_price = dec!(5001.25);
        // below the current stop
        assert_eq!(trailing_candidate(&p, dec!(5000.50), dec!(5006)), None);
        // above price
        assert_eq!(trailing_candidate(&p, dec!(5006.50), dec!(5006)), None);
        assert_eq!(trailing_candidate(&p, dec!(5003), dec!(5006)), Some(dec!(5003)));

        let mut s = short();
        s.stop_price = dec!(4998.75);
        assert_eq!(trailing_candidate(&s, dec!(4999), dec!(4994)), None);
        assert_eq!(trailing_candidate(&s, dec!(4997), dec!(4994)), Some(dec!(4997)));
    }

    #[test]
    fn test_reversal_threshold_is_exclusive() {
        assert!(reversal_signal(Direction::Long, -0.02, 0.01));
        assert!(!reversal_signal(Direction::Long, -0.01, 0.01));
        assert!(reversal_signal(Direction::Short, 0.02, 0.01));
        assert!(!reversal_signal(Direction::Short, -0.5, 0.01));
    }

    #[test]
    fn test_phase_follows_flags() {
        let mut p = long();
        assert_eq!(p.phase, ExitPhase::Armed);
        p.sync_phase();
        assert_eq!(p.phase, ExitPhase::BreakevenPending);
        p.breakeven_activated = true;
        p.sync_phase();
        assert_eq!(p.phase, ExitPhase::BreakevenActive);
        p.trailing_activated = true;
        p.sync_phase();
        assert_eq!(p.phase, ExitPhase::Trailing);
        p.phase = ExitPhase::Closed;
        p.sync_phase();
        assert_eq!(p.phase, ExitPhase::Closed);
    }

    #[test]
    fn test_exit_reason_messages() {
        assert_eq!(ExitReason::TimeExit.to_string(), "Time exit - no progress");
        assert_eq!(ExitReason::StopLossHit.as_str(), "Stop loss hit");
    }
}
