//! Cross-module checks for momentum-runner

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, SignalPolicyKind};
    use crate::exits::{breakeven_stop, price_exit, ExitReason, Position};
    use crate::risk::realized_pnl;
    use crate::signal::{policy_for, FactorFlags};
    use crate::sizing::{position_size, target_price};
    use crate::trend::trade_mode;
    use crate::types::{Direction, TickMeta, TradeMode, TrendState};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn es() -> TickMeta {
        TickMeta {
            tick_size: dec!(0.25),
            tick_value: dec!(12.50),
        }
    }

    #[test]
    fn test_policy_selection_follows_config() {
        let mut cfg = EngineConfig::default();
        assert_eq!(policy_for(&cfg.signal).name(), "pattern_gated");

        cfg.signal.policy = SignalPolicyKind::MinSignals;
        let policy = policy_for(&cfg.signal);
        assert_eq!(policy.name(), "min_signals");

        // RSI counts under the legacy policy but never under the gate
        let flags = FactorFlags { rsi_cross: true, expansion: true, breakout: false, pattern: true };
        assert!(policy.evaluate(&flags).accepted);
        let gated = policy_for(&EngineConfig::default().signal);
        let no_pattern = FactorFlags { pattern: false, ..flags };
        assert!(!gated.evaluate(&no_pattern).accepted);
    }

    #[test]
    fn test_target_hit_pays_reward_multiple_of_risk() {
        let cfg = EngineConfig::default();
        let entry = dec!(5000);
        let stop = dec!(4995);
        let size = position_size(dec!(100000), cfg.risk.risk_per_trade, entry, stop, &es(), 10).unwrap();
        let target = target_price(entry, stop, Direction::Long, cfg.risk.rr_ratio);

        let position = Position::new("p1", Direction::Long, entry, stop, target, size, Utc::now());
        assert_eq!(price_exit(&position, target), Some(ExitReason::TargetReached));

        let win = realized_pnl(Direction::Long, entry, target, size, &es());
        let loss = realized_pnl(Direction::Long, entry, stop, size, &es());
        assert_eq!(win, dec!(1000));
        assert_eq!(loss, dec!(-500));
        assert_eq!(win, -loss * cfg.risk.rr_ratio);
    }

    #[test]
    fn test_breakeven_stop_locks_in_offset_profit() {
        let cfg = EngineConfig::default();
        let position = Position::new("p1", Direction::Short, dec!(5000), dec!(5005), dec!(4990), 1, Utc::now());
        let offset = rust_decimal::Decimal::from(cfg.exits.breakeven_offset_ticks) * es().tick_size;
        let stop = breakeven_stop(&position, offset);
        assert_eq!(stop, dec!(4998.75));
        assert_eq!(realized_pnl(Direction::Short, dec!(5000), stop, 1, &es()), dec!(62.50));
    }

    #[test]
    fn test_trade_mode_maps_to_direction() {
        use TrendState::*;
        assert_eq!(trade_mode(Bullish, Bullish, Neutral, 2).direction(), Some(Direction::Long));
        assert_eq!(trade_mode(Bearish, Bearish, Bearish, 3).direction(), Some(Direction::Short));
        assert_eq!(trade_mode(Neutral, Bearish, Bearish, 2), TradeMode::NoTrade);
        assert_eq!(TradeMode::NoTrade.direction(), None);
    }
}
