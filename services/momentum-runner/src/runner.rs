//! Strategy Runner - Main decision loop
//!
//! Reacts to bar events. Entry-timeframe bars drive decision cycles that run
//! strictly in order: risk gate, volume filter, trend, signal, order flow,
//! sizing, submission. Accepted entries are handed to the exit manager,
//! whose reports feed realized P&L back into the risk guard.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, TradingMode};
use crate::error::GatewayError;
use crate::exits::{ExitManager, ExitReport, Position};
use crate::gateway::{guarded, Collaborators};
use crate::intent::{EntryIntentState, IntentRegistry};
use crate::orderflow::OrderFlowConfirmer;
use crate::portfolio::PositionBook;
use crate::risk::{RiskGuard, RiskMetrics};
use crate::signal::SignalGenerator;
use crate::sizing::PositionSizer;
use crate::trend::TrendAnalyzer;
use crate::types::{Bar, BarEvent, BracketOrder, Direction};

/// Entry-bar volume against a rolling average of the volume timeframe
#[derive(Debug, Clone)]
pub struct VolumeFilter {
    threshold: Decimal,
    window: usize,
    average: Option<Decimal>,
}

impl VolumeFilter {
    pub fn new(threshold: Decimal, window: usize) -> Self {
        Self {
            threshold,
            window,
            average: None,
        }
    }

    /// Recompute the average from the latest bars; short windows keep the old value
    pub fn update(&mut self, bars: &[Bar]) {
        if self.window == 0 || bars.len() < self.window {
            return;
        }
        let recent = &bars[bars.len() - self.window..];
        let total: Decimal = recent.iter().map(|b| b.volume).sum();
        self.average = Some(total / Decimal::from(self.window as u64));
    }

    pub fn average(&self) -> Option<Decimal> {
        self.average
    }

    pub fn passes(&self, volume: Decimal) -> bool {
        match self.average {
            Some(avg) if avg > Decimal::ZERO => volume >= self.threshold * avg,
            _ => false,
        }
    }
}

/// What a decision cycle ended with
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped(String),
    NoTrade,
    Rejected { stage: &'static str, reason: String },
    Entered { position_id: String, direction: Direction, size: u32 },
    SubmitFailed(String),
}

/// Main runner that owns the decision pipeline
pub struct StrategyRunner {
    config: EngineConfig,
    collaborators: Collaborators,
    trend: TrendAnalyzer,
    signals: SignalGenerator,
    orderflow: OrderFlowConfirmer,
    sizer: PositionSizer,
    exits: ExitManager,
    risk: RiskGuard,
    intents: IntentRegistry,
    volume: VolumeFilter,
    reports: mpsc::Receiver<ExitReport>,
    cycles: u64,
    entries: u64,
}

impl StrategyRunner {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let timeout = collaborators.call_timeout;
        let (report_tx, report_rx) = mpsc::channel(64);
        let book = Arc::new(PositionBook::new());

        Self {
            trend: TrendAnalyzer::new(collaborators.market.clone(), config.trend, config.timeframes, timeout),
            signals: SignalGenerator::new(
                collaborators.market.clone(),
                config.signal,
                &config.timeframes,
                config.trend.wae_sensitivity,
                timeout,
            ),
            orderflow: OrderFlowConfirmer::new(collaborators.book.clone(), config.orderflow, timeout),
            sizer: PositionSizer::new(
                collaborators.market.clone(),
                collaborators.account.clone(),
                config.risk,
                config.timeframes.trend_fast,
                timeout,
            ),
            exits: ExitManager::new(
                &collaborators,
                config.exits,
                &config.trend,
                &config.timeframes,
                book,
                report_tx,
            ),
            risk: RiskGuard::new(config.risk, Utc::now()),
            intents: IntentRegistry::new(Duration::from_secs(config.runtime.intent_stale_secs)),
            volume: VolumeFilter::new(config.filters.volume_threshold, config.filters.volume_avg_bars),
            reports: report_rx,
            cycles: 0,
            entries: 0,
            config,
            collaborators,
        }
    }

    pub fn exits(&self) -> &ExitManager {
        &self.exits
    }

    pub fn volume_filter(&self) -> &VolumeFilter {
        &self.volume
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    /// Run until `shutdown` fires or the bar stream ends, then close everything
    pub async fn run(mut self, mut bars: mpsc::Receiver<BarEvent>, shutdown: CancellationToken) -> anyhow::Result<()> {
        match self.config.runtime.trading_mode {
            TradingMode::Paper => info!("Running in PAPER mode against {}", self.config.runtime.bridge_url),
            TradingMode::Live => warn!("Running in LIVE mode - REAL MONEY AT RISK"),
        }
        info!(
            instrument = %self.config.instrument,
            policy = self.signals.policy_name(),
            min_aligned = self.config.trend.min_aligned,
            "Strategy runner starting"
        );

        self.refresh_volume().await;

        // Intent cleanup interval (1 minute)
        let mut cleanup_interval = interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                Some(report) = self.reports.recv() => {
                    self.on_exit_report(report);
                }
                event = bars.recv() => match event {
                    Some(event) => self.on_bar(event).await,
                    None => {
                        warn!("Bar stream ended");
                        break;
                    }
                },
                _ = cleanup_interval.tick() => {
                    self.intents.cleanup();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn on_bar(&mut self, event: BarEvent) {
        let tf = self.config.timeframes;
        if event.timeframe == tf.volume {
            self.refresh_volume().await;
        }
        if event.timeframe == tf.entry {
            let outcome = self.run_cycle(&event.bar).await;
            debug!(outcome = ?outcome, "Decision cycle finished");
        }
    }

    /// Recompute the volume average from the volume timeframe
    pub async fn refresh_volume(&mut self) {
        let tf = self.config.timeframes.volume;
        let window = self.config.filters.volume_avg_bars;
        let call = self.collaborators.market.bars(tf, window);
        match guarded("bars", self.collaborators.call_timeout, call).await {
            Ok(bars) => {
                self.volume.update(&bars);
                debug!(average = ?self.volume.average(), "Volume average updated");
            }
            Err(e) => debug!(error = %e, "Volume bars unavailable"),
        }
    }

    fn on_exit_report(&mut self, report: ExitReport) {
        if let Some(pnl) = report.pnl {
            self.risk.record_pnl(pnl, Utc::now());
        }
        info!(
            position_id = %report.position_id,
            reason = %report.reason,
            pnl = ?report.pnl,
            closed = report.closed,
            "Position finished"
        );
    }

    /// One full decision cycle for a closed entry-timeframe bar
    pub async fn run_cycle(&mut self, entry_bar: &Bar) -> CycleOutcome {
        self.cycles += 1;
        let timeout = self.collaborators.call_timeout;

        // Collect finished positions before the risk check
        while let Ok(report) = self.reports.try_recv() {
            self.on_exit_report(report);
        }

        let open = self.exits.active_count().await;
        let balance = match guarded("balance", timeout, self.collaborators.account.balance()).await {
            Ok(b) => b,
            Err(e) => return self.skip(format!("balance unavailable: {e}")),
        };
        let (allowed, reason) = self.risk.can_trade(balance, open, Utc::now());
        if !allowed {
            return self.skip(reason);
        }

        if !self.volume.passes(entry_bar.volume) {
            return self.skip(format!(
                "volume filter: {} vs average {:?}",
                entry_bar.volume,
                self.volume.average()
            ));
        }

        let details = self.trend.get_trend_details().await;
        let Some(direction) = details.trade_mode.direction() else {
            debug!(slow = ?details.slow, medium = ?details.medium, fast = ?details.fast, "No trade mode");
            return CycleOutcome::NoTrade;
        };

        if let Some(intent) = self.intents.blocking(direction) {
            return self.skip(format!("entry {} for {} still unresolved", intent.id, direction));
        }

        let (accepted, signal) = self.signals.check_entry(direction).await;
        if !accepted {
            let reason = signal.rejection_reason.unwrap_or_default();
            return CycleOutcome::Rejected { stage: "signal", reason };
        }

        let (confirmed, confirmation) = self.orderflow.confirm_entry(direction).await;
        if !confirmed {
            return CycleOutcome::Rejected {
                stage: "orderflow",
                reason: confirmation.reason,
            };
        }

        let entry = match guarded("current_price", timeout, self.collaborators.market.current_price()).await {
            Ok(p) => p,
            Err(e) => return self.skip(format!("price unavailable: {e}")),
        };
        let Some(protected) = self.sizer.size_and_protect(entry, direction).await else {
            return CycleOutcome::Rejected {
                stage: "sizing",
                reason: "unsizeable".to_string(),
            };
        };

        let intent_id = self.intents.begin(direction, protected.size);
        let order = BracketOrder {
            client_order_id: intent_id,
            direction,
            size: protected.size,
            entry_price: entry,
            stop_price: protected.stop_price,
            target_price: protected.target_price,
        };

        info!(
            direction = %direction,
            size = order.size,
            entry = %order.entry_price,
            stop = %order.stop_price,
            target = %order.target_price,
            score = signal.score,
            imbalance = ?confirmation.imbalance,
            "Submitting bracket order"
        );

        let submitted = guarded("submit_bracket", timeout, self.collaborators.orders.submit_bracket(&order)).await;
        let order_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                let state = match &e {
                    GatewayError::Timeout { .. } => EntryIntentState::Unknown,
                    other => EntryIntentState::Failed { error: other.to_string() },
                };
                if let Err(err) = self.intents.update_state(&intent_id, state) {
                    warn!(error = %err, "Intent update failed");
                }
                error!(direction = %direction, error = %e, "Bracket submission failed");
                return CycleOutcome::SubmitFailed(e.to_string());
            }
        };
        if let Err(err) = self
            .intents
            .update_state(&intent_id, EntryIntentState::Accepted { order_id: order_id.clone() })
        {
            warn!(error = %err, "Intent update failed");
        }

        let position = Position::new(
            order_id.clone(),
            direction,
            entry,
            protected.stop_price,
            protected.target_price,
            protected.size,
            Utc::now(),
        );
        if let Err(e) = self.exits.manage(position).await {
            error!(position_id = %order_id, error = %e, "Position not managed");
            return CycleOutcome::SubmitFailed(e.to_string());
        }

        self.entries += 1;
        info!(position_id = %order_id, entries = self.entries, cycles = self.cycles, "Position opened");
        CycleOutcome::Entered {
            position_id: order_id,
            direction,
            size: protected.size,
        }
    }

    fn skip(&self, reason: String) -> CycleOutcome {
        debug!(reason = %reason, "Cycle skipped");
        CycleOutcome::Skipped(reason)
    }

    pub async fn risk_metrics(&mut self) -> Option<RiskMetrics> {
        let balance = guarded("balance", self.collaborators.call_timeout, self.collaborators.account.balance())
            .await
            .ok()?;
        let open = self.exits.active_count().await;
        Some(self.risk.metrics(balance, open, Utc::now()))
    }

    /// Close every open position and fold their reports into the risk state
    pub async fn shutdown(&mut self) {
        let grace = Duration::from_secs(self.config.runtime.shutdown_grace_secs);
        self.exits.shutdown(grace).await;
        while let Ok(report) = self.reports.try_recv() {
            self.on_exit_report(report);
        }
        if let Some(metrics) = self.risk_metrics().await {
            info!(
                daily_pnl = %metrics.daily_pnl,
                weekly_pnl = %metrics.weekly_pnl,
                cycles = self.cycles,
                entries = self.entries,
                "Strategy runner stopped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(volume: Decimal) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: dec!(5000),
            high: dec!(5001),
            low: dec!(4999),
            close: dec!(5000),
            volume,
        }
    }

    #[test]
    fn test_volume_filter_needs_full_window() {
        let mut filter = VolumeFilter::new(dec!(0.2), 3);
        assert!(!filter.passes(dec!(1000)));

        filter.update(&[bar(dec!(100)), bar(dec!(100))]);
        assert_eq!(filter.average(), None);

        filter.update(&[bar(dec!(50)), bar(dec!(100)), bar(dec!(100)), bar(dec!(100))]);
        assert_eq!(filter.average(), Some(dec!(100)));
        assert!(filter.passes(dec!(20)));
        assert!(!filter.passes(dec!(19)));
    }

    #[test]
    fn test_volume_filter_zero_average_blocks() {
        let mut filter = VolumeFilter::new(dec!(0.2), 2);
        filter.update(&[bar(dec!(0)), bar(dec!(0))]);
        assert!(!filter.passes(dec!(10)));
    }
}
