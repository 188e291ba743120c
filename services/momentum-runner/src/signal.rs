//! Entry signal scoring
//!
//! Factors are computed from the entry-timeframe frame (WAE, RSI, bar
//! breakout) and the pattern-timeframe frame (order blocks, fair value gaps),
//! mirrored by direction. An [`EntryPolicy`] turns the factor flags into an
//! accept/reject decision with a weighted score.

use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SignalConfig, SignalPolicyKind, TimeframeConfig};
use crate::gateway::{guarded, MarketData};
use crate::types::{columns, Direction, IndicatorFrame, IndicatorSpec, Timeframe};

/// Named entry factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    RsiCross,
    VolatilityExpansion,
    Breakout,
    Pattern,
}

/// Raw factor outcomes for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactorFlags {
    pub rsi_cross: bool,
    pub expansion: bool,
    pub breakout: bool,
    pub pattern: bool,
}

impl FactorFlags {
    pub fn to_map(&self) -> BTreeMap<Factor, bool> {
        BTreeMap::from([
            (Factor::RsiCross, self.rsi_cross),
            (Factor::VolatilityExpansion, self.expansion),
            (Factor::Breakout, self.breakout),
            (Factor::Pattern, self.pattern),
        ])
    }
}

/// Policy output
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub accepted: bool,
    pub score: f64,
    pub max_score: f64,
    pub signals_met: u32,
    pub rejection_reason: Option<String>,
}

/// Outcome of one entry check, immutable once returned
#[derive(Debug, Clone, Serialize)]
pub struct SignalResult {
    pub direction: Direction,
    pub policy: &'static str,
    pub factor_flags: BTreeMap<Factor, bool>,
    pub score: f64,
    pub max_score: f64,
    pub signals_met: u32,
    pub pattern_present: bool,
    pub rejection_reason: Option<String>,
    /// Diagnostic values only, never used for the decision
    pub details: Map<String, Value>,
}

impl SignalResult {
    fn insufficient(direction: Direction, policy: &dyn EntryPolicy, reason: String) -> Self {
        Self {
            direction,
            policy: policy.name(),
            factor_flags: FactorFlags::default().to_map(),
            score: 0.0,
            max_score: policy.max_score(),
            signals_met: 0,
            pattern_present: false,
            rejection_reason: Some(reason),
            details: Map::new(),
        }
    }
}

/// Entry decision strategy
pub trait EntryPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Total weight a perfect setup would score
    fn max_score(&self) -> f64;

    fn evaluate(&self, flags: &FactorFlags) -> PolicyDecision;
}

/// Pattern is mandatory; accept with pattern plus expansion or breakout
pub struct PatternGatedPolicy {
    pub weight_wae: f64,
    pub weight_price: f64,
    pub weight_pattern: f64,
}

impl EntryPolicy for PatternGatedPolicy {
    fn name(&self) -> &'static str {
        "pattern_gated"
    }

    fn max_score(&self) -> f64 {
        self.weight_wae + self.weight_price + self.weight_pattern
    }

    fn evaluate(&self, flags: &FactorFlags) -> PolicyDecision {
        let others = flags.expansion as u32 + flags.breakout as u32;

        if !flags.pattern {
            return PolicyDecision {
                accepted: false,
                score: 0.0,
                max_score: self.max_score(),
                signals_met: others,
                rejection_reason: Some("no pattern edge".to_string()),
            };
        }

        let mut score = self.weight_pattern;
        if flags.expansion {
            score += self.weight_wae;
        }
        if flags.breakout {
            score += self.weight_price;
        }

        let accepted = others >= 1;
        PolicyDecision {
            accepted,
            score,
            max_score: self.max_score(),
            signals_met: others + 1,
            rejection_reason: (!accepted)
                .then(|| "pattern without volatility expansion or breakout".to_string()),
        }
    }
}

/// Count-based policy over an RSI-inclusive factor set
pub struct MinSignalsPolicy {
    pub min_signals_required: u32,
    pub pattern_required: bool,
    pub weight_rsi: f64,
    pub weight_wae: f64,
    pub weight_price: f64,
    pub weight_pattern: f64,
}

impl EntryPolicy for MinSignalsPolicy {
    fn name(&self) -> &'static str {
        "min_signals"
    }

    fn max_score(&self) -> f64 {
        let core = self.weight_rsi + self.weight_wae + self.weight_price;
        if self.pattern_required {
            core + self.weight_pattern
        } else {
            core
        }
    }

    fn evaluate(&self, flags: &FactorFlags) -> PolicyDecision {
        let mut core = vec![
            (Factor::RsiCross, flags.rsi_cross, self.weight_rsi),
            (Factor::VolatilityExpansion, flags.expansion, self.weight_wae),
            (Factor::Breakout, flags.breakout, self.weight_price),
        ];
        if self.pattern_required {
            core.push((Factor::Pattern, flags.pattern, self.weight_pattern));
        }

        let mut score: f64 = core.iter().filter(|(_, met, _)| *met).map(|(_, _, w)| w).sum();
        if !self.pattern_required && flags.pattern {
            // half-weight bonus when the pattern is optional
            score += self.weight_pattern * 0.5;
        }

        let signals_met = core.iter().filter(|(_, met, _)| *met).count() as u32;
        let accepted = signals_met >= self.min_signals_required;
        let rejection_reason = (!accepted).then(|| {
            let missing: Vec<String> = core
                .iter()
                .filter(|(_, met, _)| !*met)
                .map(|(f, _, _)| format!("{f:?}"))
                .collect();
            format!(
                "{}/{} signals met (need {}), missing: {}",
                signals_met,
                core.len(),
                self.min_signals_required,
                missing.join(", ")
            )
        });

        PolicyDecision {
            accepted,
            score,
            max_score: self.max_score(),
            signals_met,
            rejection_reason,
        }
    }
}

/// Build the configured policy
pub fn policy_for(config: &SignalConfig) -> Box<dyn EntryPolicy> {
    match config.policy {
        SignalPolicyKind::PatternGated => Box::new(PatternGatedPolicy {
            weight_wae: config.weight_wae,
            weight_price: config.weight_price,
            weight_pattern: config.weight_pattern,
        }),
        SignalPolicyKind::MinSignals => Box::new(MinSignalsPolicy {
            min_signals_required: config.min_signals_required,
            pattern_required: config.pattern_required,
            weight_rsi: config.weight_rsi,
            weight_wae: config.weight_wae,
            weight_price: config.weight_price,
            weight_pattern: config.weight_pattern,
        }),
    }
}

/// Volatility expansion in the requested direction
pub fn expansion_factor(frame: &IndicatorFrame, direction: Direction) -> bool {
    let (Some(explosion), Some(trend), Some(deadzone)) = (
        frame.last(columns::WAE_EXPLOSION),
        frame.last(columns::WAE_TREND),
        frame.last(columns::WAE_DEADZONE),
    ) else {
        return false;
    };
    explosion > deadzone
        && match direction {
            Direction::Long => trend > 0.0,
            Direction::Short => trend < 0.0,
        }
}

/// Close beyond the previous bar's extreme
pub fn breakout_factor(frame: &IndicatorFrame, direction: Direction) -> bool {
    let (Some(prev), Some(last)) = (frame.previous_bar(), frame.last_bar()) else {
        return false;
    };
    match direction {
        Direction::Long => last.close > prev.high,
        Direction::Short => last.close < prev.low,
    }
}

/// Recent RSI extreme followed by a cross back through the cross level
pub fn rsi_cross_factor(frame: &IndicatorFrame, direction: Direction, config: &SignalConfig) -> bool {
    let Some(window) = frame.tail(columns::RSI, config.rsi_lookback_bars) else {
        return false;
    };
    let (history, latest) = window.split_at(window.len() - 1);
    let last = latest[0];
    let Some(&prev) = history.last() else {
        return false;
    };

    match direction {
        Direction::Long => {
            let recently_oversold = history.iter().any(|v| *v < config.rsi_oversold);
            recently_oversold && prev < config.rsi_long_cross && last >= config.rsi_long_cross
        }
        Direction::Short => {
            let recently_overbought = history.iter().any(|v| *v > config.rsi_overbought);
            recently_overbought && prev > config.rsi_short_cross && last <= config.rsi_short_cross
        }
    }
}

/// Order block still holding, or a fair value gap of matching polarity
pub fn pattern_factor(frame: &IndicatorFrame, current_price: f64, direction: Direction) -> bool {
    let (ob_flag, ob_edge, fvg_flag) = match direction {
        Direction::Long => (columns::OB_BULLISH, columns::OB_BOTTOM, columns::FVG_BULLISH),
        Direction::Short => (columns::OB_BEARISH, columns::OB_TOP, columns::FVG_BEARISH),
    };

    let order_block = frame.flag(ob_flag)
        && frame
            .last(ob_edge)
            .map(|edge| match direction {
                Direction::Long => current_price >= edge,
                Direction::Short => current_price <= edge,
            })
            .unwrap_or(false);

    order_block || frame.flag(fvg_flag)
}

/// RSI/price divergence scaled by WAE strength over the last five bars
pub fn microstructure_score(frame: &IndicatorFrame, wae_sensitivity: u32) -> f64 {
    let Some(rsi) = frame.tail(columns::RSI, 5) else {
        return 0.0;
    };
    if frame.len() < 5 || wae_sensitivity == 0 {
        return 0.0;
    }
    let closes: Vec<f64> = frame.bars[frame.len() - 5..]
        .iter()
        .filter_map(|b| b.close.to_f64())
        .collect();
    if closes.len() < 5 || closes[0] == 0.0 {
        return 0.0;
    }
    let Some(explosion) = frame.last(columns::WAE_EXPLOSION) else {
        return 0.0;
    };

    let price_trend = (closes[4] - closes[0]) / closes[0];
    let rsi_trend = (rsi[4] - rsi[0]) / 100.0;
    (rsi_trend - price_trend).abs() * (explosion / wae_sensitivity as f64)
}

/// Scores entries for one direction at a time
pub struct SignalGenerator {
    market: Arc<dyn MarketData>,
    config: SignalConfig,
    entry_timeframe: Timeframe,
    pattern_timeframe: Timeframe,
    wae_sensitivity: u32,
    policy: Box<dyn EntryPolicy>,
    call_timeout: Duration,
}

impl SignalGenerator {
    pub fn new(
        market: Arc<dyn MarketData>,
        config: SignalConfig,
        timeframes: &TimeframeConfig,
        wae_sensitivity: u32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            market,
            policy: policy_for(&config),
            config,
            entry_timeframe: timeframes.entry,
            pattern_timeframe: timeframes.pattern,
            wae_sensitivity,
            call_timeout,
        }
    }

    /// Swap the decision policy (the factor computation is unchanged)
    pub fn with_policy(mut self, policy: Box<dyn EntryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    async fn frame(&self, timeframe: Timeframe, count: usize, specs: &[IndicatorSpec]) -> Option<IndicatorFrame> {
        let call = self.market.indicator_frame(timeframe, count, specs);
        match guarded("indicator_frame", self.call_timeout, call).await {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(timeframe = %timeframe, error = %e, "Signal frame unavailable");
                None
            }
        }
    }

    async fn pattern_present(&self, direction: Direction, current_price: f64) -> bool {
        let specs = [
            IndicatorSpec::Fvg { min_gap_size: self.config.fvg_min_gap_size },
            IndicatorSpec::OrderBlock { min_volume_percentile: self.config.ob_volume_percentile },
        ];
        let Some(frame) = self.frame(self.pattern_timeframe, self.config.pattern_bars, &specs).await else {
            return false;
        };
        if !frame.has_window(self.config.pattern_min_bars) {
            debug!(got = frame.len(), "Pattern check: insufficient data");
            return false;
        }
        pattern_factor(&frame, current_price, direction)
    }

    /// Evaluate an entry in `direction`
    pub async fn check_entry(&self, direction: Direction) -> (bool, SignalResult) {
        let specs = [
            IndicatorSpec::Wae { sensitivity: self.wae_sensitivity },
            IndicatorSpec::Rsi { period: self.config.rsi_period },
        ];
        let frame = self
            .frame(self.entry_timeframe, self.config.entry_bars, &specs)
            .await
            .unwrap_or_default();

        if !frame.has_window(self.config.entry_min_bars) {
            let reason = format!(
                "insufficient data (got {} bars, need {})",
                frame.len(),
                self.config.entry_min_bars
            );
            debug!(direction = %direction, reason = %reason, "Entry check skipped");
            return (false, SignalResult::insufficient(direction, self.policy.as_ref(), reason));
        }

        let current_price = frame.last_close_f64().unwrap_or_default();
        let mut flags = FactorFlags {
            rsi_cross: rsi_cross_factor(&frame, direction, &self.config),
            expansion: expansion_factor(&frame, direction),
            breakout: breakout_factor(&frame, direction),
            pattern: false,
        };
        flags.pattern = self.pattern_present(direction, current_price).await;

        let decision = self.policy.evaluate(&flags);

        let mut details = Map::new();
        details.insert(
            "wae".to_string(),
            json!({
                "explosion": frame.last(columns::WAE_EXPLOSION),
                "trend": frame.last(columns::WAE_TREND),
                "deadzone": frame.last(columns::WAE_DEADZONE),
            }),
        );
        details.insert("rsi".to_string(), json!(frame.last(columns::RSI)));
        details.insert(
            "price".to_string(),
            json!({
                "close": current_price,
                "prev_high": frame.previous_bar().and_then(|b| b.high.to_f64()),
                "prev_low": frame.previous_bar().and_then(|b| b.low.to_f64()),
            }),
        );
        details.insert(
            "microstructure".to_string(),
            json!(microstructure_score(&frame, self.wae_sensitivity)),
        );

        let result = SignalResult {
            direction,
            policy: self.policy.name(),
            factor_flags: flags.to_map(),
            score: decision.score,
            max_score: decision.max_score,
            signals_met: decision.signals_met,
            pattern_present: flags.pattern,
            rejection_reason: decision.rejection_reason,
            details,
        };

        if decision.accepted {
            info!(
                direction = %direction,
                score = result.score,
                max_score = result.max_score,
                signals_met = result.signals_met,
                "Entry signal accepted"
            );
        } else {
            debug!(
                direction = %direction,
                score = result.score,
                reason = result.rejection_reason.as_deref().unwrap_or(""),
                "Entry signal rejected"
            );
        }

        (decision.accepted, result)
    }
}
