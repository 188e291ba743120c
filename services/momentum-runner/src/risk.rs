//! Account-level risk limits
//!
//! Realized P&L is tracked per UTC day and ISO week and compared against the
//! configured loss fractions of the current balance.

use chrono::{DateTime, Datelike, IsoWeek, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::config::RiskConfig;
use crate::types::{Direction, TickMeta};

/// Realized P&L in account currency
pub fn realized_pnl(
    direction: Direction,
    entry: Decimal,
    exit: Decimal,
    size: u32,
    tick_meta: &TickMeta,
) -> Decimal {
    if !tick_meta.is_valid() {
        return Decimal::ZERO;
    }
    let ticks = (exit - entry) * direction.sign() / tick_meta.tick_size;
    ticks * tick_meta.tick_value * Decimal::from(size)
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
    pub open_positions: usize,
    pub max_positions: usize,
    pub risk_per_trade: Decimal,
    pub can_trade: bool,
}

pub struct RiskGuard {
    config: RiskConfig,
    day: NaiveDate,
    week: IsoWeek,
    daily_pnl: Decimal,
    weekly_pnl: Decimal,
}

impl RiskGuard {
    pub fn new(config: RiskConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            day: now.date_naive(),
            week: now.iso_week(),
            daily_pnl: Decimal::ZERO,
            weekly_pnl: Decimal::ZERO,
        }
    }

    /// Reset counters when the day or week has changed
    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            if self.daily_pnl != Decimal::ZERO {
                info!(day = %self.day, pnl = %self.daily_pnl, "Daily P&L reset");
            }
            self.day = day;
            self.daily_pnl = Decimal::ZERO;
        }
        let week = now.iso_week();
        if week != self.week {
            if self.weekly_pnl != Decimal::ZERO {
                info!(pnl = %self.weekly_pnl, "Weekly P&L reset");
            }
            self.week = week;
            self.weekly_pnl = Decimal::ZERO;
        }
    }

    pub fn record_pnl(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.roll(now);
        self.daily_pnl += pnl;
        self.weekly_pnl += pnl;
    }

    /// Gate a new decision cycle
    pub fn can_trade(&mut self, balance: Decimal, open_positions: usize, now: DateTime<Utc>) -> (bool, String) {
        self.roll(now);

        let daily_limit = balance * self.config.max_daily_loss;
        if self.daily_pnl <= -daily_limit {
            return (false, format!("Daily loss limit reached: {}", self.daily_pnl));
        }
        let weekly_limit = balance * self.config.max_weekly_loss;
        if self.weekly_pnl <= -weekly_limit {
            return (false, format!("Weekly loss limit reached: {}", self.weekly_pnl));
        }
        if open_positions >= self.config.max_concurrent_trades {
            return (false, format!("Max concurrent trades reached: {open_positions}"));
        }
        (true, "Trading allowed".to_string())
    }

    pub fn metrics(&mut self, balance: Decimal, open_positions: usize, now: DateTime<Utc>) -> RiskMetrics {
        let (can_trade, _) = self.can_trade(balance, open_positions, now);
        RiskMetrics {
            daily_pnl: self.daily_pnl,
            weekly_pnl: self.weekly_pnl,
            open_positions,
            max_positions: self.config.max_concurrent_trades,
            risk_per_trade: self.config.risk_per_trade,
            can_trade,
        }
    }
}
