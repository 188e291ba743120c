//! Multi-timeframe trend analysis
//!
//! Each timeframe's state is a pure function of its latest indicator frame:
//! - slow: EMA fast/slow stack with price above/below the fast EMA
//! - medium: last three MACD histogram values, sign and monotonic slope
//! - fast: WAE explosion above the dead zone, signed by the WAE trend
//!
//! The slow trend is the primary filter; `min_aligned` timeframes (slow
//! included) must agree with it before a direction is allowed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{TimeframeConfig, TrendConfig};
use crate::gateway::{guarded, MarketData};
use crate::types::{columns, IndicatorFrame, IndicatorSpec, Timeframe, TradeMode, TrendState};

/// Trend per timeframe plus the aggregated mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendDetails {
    pub slow: TrendState,
    pub medium: TrendState,
    pub fast: TrendState,
    pub trade_mode: TradeMode,
}

/// Slow trend from the EMA stack
pub fn slow_trend(frame: &IndicatorFrame, min_bars: usize) -> TrendState {
    if !frame.has_window(min_bars) {
        return TrendState::Neutral;
    }
    let (Some(fast), Some(slow), Some(price)) = (
        frame.last(columns::EMA_FAST),
        frame.last(columns::EMA_SLOW),
        frame.last_close_f64(),
    ) else {
        return TrendState::Neutral;
    };

    if fast > slow && price > fast {
        TrendState::Bullish
    } else if fast < slow && price < fast {
        TrendState::Bearish
    } else {
        TrendState::Neutral
    }
}

/// Medium trend from MACD histogram momentum
pub fn medium_trend(frame: &IndicatorFrame, min_bars: usize) -> TrendState {
    if !frame.has_window(min_bars) {
        return TrendState::Neutral;
    }
    let Some(hist) = frame.tail(columns::MACD_HIST, 3) else {
        return TrendState::Neutral;
    };

    let increasing = hist.windows(2).all(|w| w[0] < w[1]);
    let decreasing = hist.windows(2).all(|w| w[0] > w[1]);
    let latest = hist[2];

    if latest > 0.0 && increasing {
        TrendState::Bullish
    } else if latest < 0.0 && decreasing {
        TrendState::Bearish
    } else {
        TrendState::Neutral
    }
}

/// Fast trend from WAE explosion vs dead zone
pub fn fast_trend(frame: &IndicatorFrame, min_bars: usize) -> TrendState {
    if !frame.has_window(min_bars) {
        return TrendState::Neutral;
    }
    let (Some(explosion), Some(trend), Some(deadzone)) = (
        frame.last(columns::WAE_EXPLOSION),
        frame.last(columns::WAE_TREND),
        frame.last(columns::WAE_DEADZONE),
    ) else {
        return TrendState::Neutral;
    };

    if explosion > deadzone {
        if trend > 0.0 {
            return TrendState::Bullish;
        } else if trend < 0.0 {
            return TrendState::Bearish;
        }
    }
    TrendState::Neutral
}

/// Aggregate three trend states into a trade mode
pub fn trade_mode(slow: TrendState, medium: TrendState, fast: TrendState, min_aligned: u8) -> TradeMode {
    let states = [slow, medium, fast];
    let bullish = states.iter().filter(|s| **s == TrendState::Bullish).count();
    let bearish = states.iter().filter(|s| **s == TrendState::Bearish).count();
    let needed = min_aligned as usize;

    match slow {
        TrendState::Bullish if bullish >= needed => TradeMode::LongOnly,
        TrendState::Bearish if bearish >= needed => TradeMode::ShortOnly,
        _ => TradeMode::NoTrade,
    }
}

/// Fetches the three trend frames and classifies them
pub struct TrendAnalyzer {
    market: Arc<dyn MarketData>,
    config: TrendConfig,
    timeframes: TimeframeConfig,
    call_timeout: Duration,
}

impl TrendAnalyzer {
    pub fn new(
        market: Arc<dyn MarketData>,
        config: TrendConfig,
        timeframes: TimeframeConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            market,
            config,
            timeframes,
            call_timeout,
        }
    }

    /// Fetch a frame; collaborator failure yields an empty (insufficient) frame
    async fn frame(&self, timeframe: Timeframe, count: usize, spec: IndicatorSpec) -> IndicatorFrame {
        let call = self.market.indicator_frame(timeframe, count, std::slice::from_ref(&spec));
        match guarded("indicator_frame", self.call_timeout, call).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(timeframe = %timeframe, error = %e, "Trend frame unavailable");
                IndicatorFrame::default()
            }
        }
    }

    pub async fn slow(&self) -> TrendState {
        let c = &self.config;
        let spec = IndicatorSpec::Ema { fast: c.ema_fast, slow: c.ema_slow };
        let frame = self.frame(self.timeframes.trend_slow, c.slow_min_bars, spec).await;
        slow_trend(&frame, c.slow_min_bars)
    }

    pub async fn medium(&self) -> TrendState {
        let c = &self.config;
        let spec = IndicatorSpec::Macd {
            fast: c.macd_fast,
            slow: c.macd_slow,
            signal: c.macd_signal,
        };
        let count = c.medium_min_bars.max(50);
        let frame = self.frame(self.timeframes.trend_medium, count, spec).await;
        medium_trend(&frame, c.medium_min_bars)
    }

    pub async fn fast(&self) -> TrendState {
        let c = &self.config;
        let spec = IndicatorSpec::Wae { sensitivity: c.wae_sensitivity };
        let frame = self.frame(self.timeframes.trend_fast, c.fast_min_bars, spec).await;
        fast_trend(&frame, c.fast_min_bars)
    }

    /// Classify all three timeframes once and aggregate
    pub async fn get_trend_details(&self) -> TrendDetails {
        let slow = self.slow().await;
        let medium = self.medium().await;
        let fast = self.fast().await;
        let mode = trade_mode(slow, medium, fast, self.config.min_aligned);

        debug!(slow = ?slow, medium = ?medium, fast = ?fast, mode = ?mode, "Trend details");

        TrendDetails {
            slow,
            medium,
            fast,
            trade_mode: mode,
        }
    }

    pub async fn get_trade_mode(&self) -> TradeMode {
        self.get_trend_details().await.trade_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use TrendState::*;

    fn bars(n: usize, close: i64) -> Vec<Bar> {
        (0..n)
            .map(|_| Bar {
                timestamp: Utc::now(),
                open: Decimal::from(close),
                high: Decimal::from(close),
                low: Decimal::from(close),
                close: Decimal::from(close),
                volume: Decimal::from(10),
            })
            .collect()
    }

    fn col(n: usize, last: &[f64]) -> Vec<Option<f64>> {
        let mut v = vec![Some(0.0); n - last.len()];
        v.extend(last.iter().map(|x| Some(*x)));
        v
    }

    fn ema_frame(close: i64, fast: f64, slow: f64) -> IndicatorFrame {
        IndicatorFrame::new(bars(200, close))
            .with_column(columns::EMA_FAST, col(200, &[fast]))
            .with_column(columns::EMA_SLOW, col(200, &[slow]))
    }

    fn macd_frame(hist: &[f64]) -> IndicatorFrame {
        IndicatorFrame::new(bars(35, 100)).with_column(columns::MACD_HIST, col(35, hist))
    }

    fn wae_frame(explosion: f64, trend: f64, deadzone: f64) -> IndicatorFrame {
        IndicatorFrame::new(bars(20, 100))
            .with_column(columns::WAE_EXPLOSION, col(20, &[explosion]))
            .with_column(columns::WAE_TREND, col(20, &[trend]))
            .with_column(columns::WAE_DEADZONE, col(20, &[deadzone]))
    }

    #[test]
    fn test_slow_trend_requires_stack_and_price() {
        assert_eq!(slow_trend(&ema_frame(5010, 5000.0, 4990.0), 200), Bullish);
        assert_eq!(slow_trend(&ema_frame(4980, 4990.0, 5000.0), 200), Bearish);
        // stacked bullish but price below fast EMA
        assert_eq!(slow_trend(&ema_frame(4995, 5000.0, 4990.0), 200), Neutral);
    }

    #[test]
    fn test_slow_trend_short_window_is_neutral() {
        assert_eq!(slow_trend(&ema_frame(5010, 5000.0, 4990.0), 201), Neutral);
        assert_eq!(slow_trend(&IndicatorFrame::default(), 200), Neutral);
    }

    #[test]
    fn test_medium_trend_needs_strict_monotonic_histogram() {
        assert_eq!(medium_trend(&macd_frame(&[0.1, 0.2, 0.3]), 35), Bullish);
        assert_eq!(medium_trend(&macd_frame(&[-0.1, -0.2, -0.3]), 35), Bearish);
        assert_eq!(medium_trend(&macd_frame(&[0.1, 0.3, 0.3]), 35), Neutral);
        // rising but still negative
        assert_eq!(medium_trend(&macd_frame(&[-0.3, -0.2, -0.1]), 35), Neutral);
    }

    #[test]
    fn test_fast_trend_deadzone_dominates_sign() {
        assert_eq!(fast_trend(&wae_frame(12.0, 3.0, 10.0), 20), Bullish);
        assert_eq!(fast_trend(&wae_frame(12.0, -3.0, 10.0), 20), Bearish);
        assert_eq!(fast_trend(&wae_frame(9.0, 3.0, 10.0), 20), Neutral);
        assert_eq!(fast_trend(&wae_frame(10.0, -3.0, 10.0), 20), Neutral);
        assert_eq!(fast_trend(&wae_frame(12.0, 0.0, 10.0), 20), Neutral);
    }

    fn expected(slow: TrendState, medium: TrendState, fast: TrendState, min_aligned: usize) -> TradeMode {
        let all = [slow, medium, fast];
        let bull = all.iter().filter(|s| **s == Bullish).count();
        let bear = all.iter().filter(|s| **s == Bearish).count();
        if slow == Bullish && bull >= min_aligned {
            TradeMode::LongOnly
        } else if slow == Bearish && bear >= min_aligned {
            TradeMode::ShortOnly
        } else {
            TradeMode::NoTrade
        }
    }

    #[test]
    fn test_trade_mode_all_27_combinations_both_regimes() {
        let states = [Bullish, Bearish, Neutral];
        for min_aligned in [2u8, 3u8] {
            let mut long_count = 0;
            for slow in states {
                for medium in states {
                    for fast in states {
                        let mode = trade_mode(slow, medium, fast, min_aligned);
                        assert_eq!(
                            mode,
                            expected(slow, medium, fast, min_aligned as usize),
                            "{slow:?}/{medium:?}/{fast:?} with {min_aligned}"
                        );
                        if mode == TradeMode::LongOnly {
                            long_count += 1;
                        }
                    }
                }
            }
            // relaxed: slow bullish plus any one of the other two
            let want = if min_aligned == 2 { 5 } else { 1 };
            assert_eq!(long_count, want);
        }
    }

    #[test]
    fn test_relaxed_and_strict_disagree_on_two_of_three() {
        assert_eq!(trade_mode(Bullish, Bullish, Neutral, 2), TradeMode::LongOnly);
        assert_eq!(trade_mode(Bullish, Bullish, Neutral, 3), TradeMode::NoTrade);
        assert_eq!(trade_mode(Bearish, Neutral, Bearish, 2), TradeMode::ShortOnly);
        assert_eq!(trade_mode(Bearish, Neutral, Bearish, 3), TradeMode::NoTrade);
        // primary filter: slow neutral never trades
        assert_eq!(trade_mode(Neutral, Bullish, Bullish, 2), TradeMode::NoTrade);
    }
}
