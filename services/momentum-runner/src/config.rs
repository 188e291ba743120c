//! Engine Configuration
//!
//! A flat-ish tree of tunables loaded once at startup and passed explicitly
//! into every component. Nothing here is mutated after `load`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::Timeframe;

/// Environment variable holding an explicit config file path
pub const CONFIG_PATH_ENV: &str = "MOMENTUM_CONFIG";

/// Prefix for environment overrides (`MOMENTUM__RISK__RR_RATIO=3`)
const ENV_PREFIX: &str = "MOMENTUM";

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instrument: String,
    pub timeframes: TimeframeConfig,
    pub trend: TrendConfig,
    pub signal: SignalConfig,
    pub orderflow: OrderFlowConfig,
    pub risk: RiskConfig,
    pub filters: FilterConfig,
    pub exits: ExitConfig,
    pub runtime: RuntimeConfig,
}

/// Which bar series feeds which analysis
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeframeConfig {
    /// Fastest series; its bar closes drive decision cycles
    pub entry: Timeframe,
    pub trend_fast: Timeframe,
    pub trend_medium: Timeframe,
    pub trend_slow: Timeframe,
    pub pattern: Timeframe,
    pub volume: Timeframe,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            entry: Timeframe::Sec15,
            trend_fast: Timeframe::Min1,
            trend_medium: Timeframe::Min5,
            trend_slow: Timeframe::Min15,
            pattern: Timeframe::Min5,
            volume: Timeframe::Min1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrendConfig {
    pub ema_fast: u32,
    pub ema_slow: u32,
    pub macd_fast: u32,
    pub macd_slow: u32,
    pub macd_signal: u32,
    pub wae_sensitivity: u32,
    pub slow_min_bars: usize,
    pub medium_min_bars: usize,
    pub fast_min_bars: usize,
    /// Timeframes that must agree with the slow trend, slow included (2 or 3)
    pub min_aligned: u8,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            ema_fast: 50,
            ema_slow: 200,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            wae_sensitivity: 150,
            slow_min_bars: 200,
            medium_min_bars: 35,
            fast_min_bars: 20,
            min_aligned: 2,
        }
    }
}

/// Entry policy generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalPolicyKind {
    /// Mandatory pattern plus at least one of expansion / breakout
    #[default]
    PatternGated,
    /// RSI-inclusive factor count against `min_signals_required`
    MinSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalConfig {
    pub policy: SignalPolicyKind,
    pub min_signals_required: u32,
    pub pattern_required: bool,
    pub weight_rsi: f64,
    pub weight_wae: f64,
    pub weight_price: f64,
    pub weight_pattern: f64,
    pub rsi_period: u32,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_long_cross: f64,
    pub rsi_short_cross: f64,
    pub rsi_lookback_bars: usize,
    pub entry_bars: usize,
    pub entry_min_bars: usize,
    pub pattern_bars: usize,
    pub pattern_min_bars: usize,
    pub fvg_min_gap_size: f64,
    pub ob_volume_percentile: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            policy: SignalPolicyKind::PatternGated,
            min_signals_required: 2,
            pattern_required: true,
            weight_rsi: 1.0,
            weight_wae: 1.0,
            weight_price: 1.0,
            weight_pattern: 2.0,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            rsi_long_cross: 40.0,
            rsi_short_cross: 60.0,
            rsi_lookback_bars: 10,
            entry_bars: 120,
            entry_min_bars: 100,
            pattern_bars: 120,
            pattern_min_bars: 120,
            fvg_min_gap_size: 0.001,
            ob_volume_percentile: 70,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrderFlowConfig {
    /// Minimum bid/ask depth ratio for longs
    pub imbalance_long: f64,
    /// Maximum bid/ask depth ratio for shorts
    pub imbalance_short: f64,
    pub depth_levels: u32,
    pub iceberg_check: bool,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self {
            imbalance_long: 1.5,
            imbalance_short: 0.6667,
            depth_levels: 5,
            iceberg_check: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of balance risked per trade
    pub risk_per_trade: Decimal,
    /// Reward:risk multiple for targets
    pub rr_ratio: Decimal,
    pub max_position_size: u32,
    pub atr_period: u32,
    pub stop_ticks: u32,
    /// Stop distance as a fraction of price when tick metadata is missing
    pub percent_stop: Decimal,
    pub max_daily_loss: Decimal,
    pub max_weekly_loss: Decimal,
    pub max_concurrent_trades: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.005),
            rr_ratio: dec!(2),
            max_position_size: 10,
            atr_period: 14,
            stop_ticks: 10,
            percent_stop: dec!(0.01),
            max_daily_loss: dec!(0.03),
            max_weekly_loss: dec!(0.05),
            max_concurrent_trades: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Entry bar volume must reach this fraction of the average volume
    pub volume_threshold: Decimal,
    pub volume_avg_bars: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            volume_threshold: dec!(0.2),
            volume_avg_bars: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExitConfig {
    pub time_exit_minutes: i64,
    pub breakeven_trigger_ratio: Decimal,
    pub breakeven_offset_ticks: u32,
    pub trailing_enabled: bool,
    pub sar_af: f64,
    pub sar_max_af: f64,
    pub trailing_min_bars: usize,
    pub reversal_hist_threshold: f64,
    pub reversal_min_bars: usize,
    pub tick_interval_ms: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            time_exit_minutes: 5,
            breakeven_trigger_ratio: dec!(1.0),
            breakeven_offset_ticks: 5,
            trailing_enabled: true,
            sar_af: 0.02,
            sar_max_af: 0.2,
            trailing_min_bars: 10,
            reversal_hist_threshold: 0.01,
            reversal_min_bars: 35,
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Upper bound on any single collaborator call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_bar_poll_ms")]
    pub bar_poll_ms: u64,
    #[serde(default = "default_intent_stale_secs")]
    pub intent_stale_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub trading_mode: TradingMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            bar_poll_ms: default_bar_poll_ms(),
            intent_stale_secs: default_intent_stale_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            bridge_url: default_bridge_url(),
            log_level: default_log_level(),
            trading_mode: TradingMode::Paper,
        }
    }
}

fn default_call_timeout_ms() -> u64 { 3000 }
fn default_bar_poll_ms() -> u64 { 500 }
fn default_intent_stale_secs() -> u64 { 60 }
fn default_shutdown_grace_secs() -> u64 { 10 }
fn default_bridge_url() -> String { "http://localhost:8090".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl EngineConfig {
    /// Load from an optional YAML file layered under `MOMENTUM__*` env overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        let raw = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: EngineConfig = raw.try_deserialize()?;
        if cfg.instrument.is_empty() {
            cfg.instrument = "ES".to_string();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Default config location: `$MOMENTUM_CONFIG`, else the user config dir
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("momentum-runner").join("engine.yaml"))
    }

    /// Render the effective configuration for startup logs
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::invalid("*", e.to_string()))
    }

    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.trend;
        if !(2..=3).contains(&t.min_aligned) {
            return Err(ConfigError::invalid("trend.min_aligned", "must be 2 or 3"));
        }
        if t.ema_fast == 0 || t.ema_fast >= t.ema_slow {
            return Err(ConfigError::invalid("trend.ema_fast", "must be positive and below ema_slow"));
        }
        if t.macd_fast == 0 || t.macd_fast >= t.macd_slow || t.macd_signal == 0 {
            return Err(ConfigError::invalid("trend.macd_fast", "must be positive and below macd_slow"));
        }
        if t.medium_min_bars < 3 {
            return Err(ConfigError::invalid("trend.medium_min_bars", "needs at least 3 histogram values"));
        }

        let s = &self.signal;
        if s.min_signals_required == 0 {
            return Err(ConfigError::invalid("signal.min_signals_required", "must be at least 1"));
        }
        for (key, w) in [
            ("signal.weight_rsi", s.weight_rsi),
            ("signal.weight_wae", s.weight_wae),
            ("signal.weight_price", s.weight_price),
            ("signal.weight_pattern", s.weight_pattern),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(key, "weights must be finite and non-negative"));
            }
        }
        if s.entry_min_bars < 2 || s.entry_bars < s.entry_min_bars {
            return Err(ConfigError::invalid("signal.entry_min_bars", "need 2..=entry_bars"));
        }
        if s.pattern_bars < s.pattern_min_bars {
            return Err(ConfigError::invalid("signal.pattern_bars", "must cover pattern_min_bars"));
        }
        if s.rsi_lookback_bars < 2 {
            return Err(ConfigError::invalid("signal.rsi_lookback_bars", "must be at least 2"));
        }

        let o = &self.orderflow;
        if o.imbalance_long <= 0.0 || o.imbalance_short <= 0.0 || o.depth_levels == 0 {
            return Err(ConfigError::invalid("orderflow", "thresholds and depth must be positive"));
        }

        let r = &self.risk;
        for (key, v) in [
            ("risk.risk_per_trade", r.risk_per_trade),
            ("risk.percent_stop", r.percent_stop),
            ("risk.max_daily_loss", r.max_daily_loss),
            ("risk.max_weekly_loss", r.max_weekly_loss),
        ] {
            if v <= Decimal::ZERO || v > Decimal::ONE {
                return Err(ConfigError::invalid(key, "must be in (0, 1]"));
            }
        }
        if r.rr_ratio <= Decimal::ZERO {
            return Err(ConfigError::invalid("risk.rr_ratio", "must be positive"));
        }
        if r.max_position_size == 0 || r.atr_period == 0 || r.stop_ticks == 0 {
            return Err(ConfigError::invalid("risk", "sizes and periods must be positive"));
        }
        if r.max_concurrent_trades == 0 {
            return Err(ConfigError::invalid("risk.max_concurrent_trades", "must be positive"));
        }

        if self.filters.volume_avg_bars == 0 || self.filters.volume_threshold < Decimal::ZERO {
            return Err(ConfigError::invalid("filters", "invalid volume filter"));
        }

        let e = &self.exits;
        if e.time_exit_minutes <= 0 || e.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("exits", "time limit and tick interval must be positive"));
        }
        if e.breakeven_trigger_ratio <= Decimal::ZERO {
            return Err(ConfigError::invalid("exits.breakeven_trigger_ratio", "must be positive"));
        }

        let rt = &self.runtime;
        if rt.call_timeout_ms == 0 || rt.bar_poll_ms == 0 {
            return Err(ConfigError::invalid("runtime", "timeouts and poll interval must be positive"));
        }
        if rt.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::invalid("runtime.log_level", format!("unknown level {}", rt.log_level)));
        }
        Ok(())
    }
}
