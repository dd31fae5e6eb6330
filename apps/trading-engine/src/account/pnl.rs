//! P&L episode tracking.
//!
//! Win/loss statistics are computed over closed position episodes, not
//! individual fills: an episode opens when a flat symbol gains exposure and
//! closes when it returns to flat (or flips sign, which closes one episode
//! and opens the next).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::fill::Fill;
use crate::domain::position::FillEffect;

/// A closed position episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedEpisode {
    /// Trading pair symbol.
    pub symbol: String,
    /// When exposure opened.
    pub opened_at: DateTime<Utc>,
    /// When the position returned to flat.
    pub closed_at: DateTime<Utc>,
    /// Realized P&L over the episode, gross of fees.
    pub realized_pnl: Decimal,
    /// Fees paid over the episode.
    pub fees: Decimal,
    /// Net result (`realized_pnl - fees`).
    pub net_pnl: Decimal,
}

impl ClosedEpisode {
    /// Whether the episode was profitable net of fees.
    #[must_use]
    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }
}

#[derive(Debug, Clone)]
struct OpenEpisode {
    opened_at: DateTime<Utc>,
    realized_pnl: Decimal,
    fees: Decimal,
}

/// Aggregate win/loss statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnlStats {
    /// Closed episodes.
    pub episodes: u64,
    /// Profitable episodes.
    pub wins: u64,
    /// Losing episodes.
    pub losses: u64,
    /// Total realized P&L, gross of fees.
    pub realized_pnl: Decimal,
    /// Total fees.
    pub total_fees: Decimal,
    /// Win rate in [0, 1], zero when no episodes closed.
    pub win_rate: Decimal,
}

/// Tracks open episodes per symbol and accumulates closed ones.
#[derive(Debug, Default)]
pub struct PnlTracker {
    open: HashMap<String, OpenEpisode>,
    closed: Vec<ClosedEpisode>,
}

impl PnlTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the effect a fill had on its symbol's position.
    ///
    /// Returns the episode that closed, if any.
    pub fn record(&mut self, fill: &Fill, effect: &FillEffect) -> Option<ClosedEpisode> {
        let episode = self
            .open
            .entry(fill.symbol.clone())
            .or_insert_with(|| OpenEpisode {
                opened_at: fill.timestamp,
                realized_pnl: Decimal::ZERO,
                fees: Decimal::ZERO,
            });

        episode.realized_pnl += effect.realized_delta;
        episode.fees += fill.fee;

        if !effect.episode_closed {
            return None;
        }

        let finished = self.open.remove(&fill.symbol)?;
        let closed = ClosedEpisode {
            symbol: fill.symbol.clone(),
            opened_at: finished.opened_at,
            closed_at: fill.timestamp,
            realized_pnl: finished.realized_pnl,
            fees: finished.fees,
            net_pnl: finished.realized_pnl - finished.fees,
        };
        self.closed.push(closed.clone());

        // A flip immediately opens the next episode at the same timestamp.
        // The caller's position carries the flipped quantity; fees and
        // realized P&L for it start from zero.
        Some(closed)
    }

    /// A flipped fill leaves residual exposure: open the follow-up episode.
    pub fn reopen_after_flip(&mut self, symbol: &str, timestamp: DateTime<Utc>) {
        self.open.insert(
            symbol.to_string(),
            OpenEpisode {
                opened_at: timestamp,
                realized_pnl: Decimal::ZERO,
                fees: Decimal::ZERO,
            },
        );
    }

    /// Closed episodes, oldest first.
    #[must_use]
    pub fn closed_episodes(&self) -> &[ClosedEpisode] {
        &self.closed
    }

    /// Aggregate statistics over closed episodes.
    #[must_use]
    pub fn stats(&self) -> PnlStats {
        let mut stats = PnlStats::default();
        for episode in &self.closed {
            stats.episodes += 1;
            if episode.is_win() {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }
            stats.realized_pnl += episode.realized_pnl;
            stats.total_fees += episode.fees;
        }
        if stats.episodes > 0 {
            stats.win_rate = Decimal::from(stats.wins) / Decimal::from(stats.episodes);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::order::OrderSide;
    use crate::domain::position::Position;

    fn fill(symbol: &str, side: OrderSide, qty: Decimal, price: Decimal, fee: Decimal) -> Fill {
        Fill {
            fill_id: format!("f-{side}-{qty}"),
            order_id: "o".to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity: qty,
            fee,
            fee_asset: "USDT".to_string(),
            is_maker: false,
            timestamp: Utc::now(),
        }
    }

    /// Drive a position and tracker together the way the monitor does.
    fn apply(
        position: &mut Position,
        tracker: &mut PnlTracker,
        f: &Fill,
    ) -> Option<ClosedEpisode> {
        let effect = position.apply_fill(f);
        let closed = tracker.record(f, &effect);
        if effect.episode_closed && !position.is_flat() {
            tracker.reopen_after_flip(&f.symbol, f.timestamp);
        }
        closed
    }

    #[test]
    fn round_trip_closes_one_episode() {
        let mut position = Position::flat("BTCUSDT");
        let mut tracker = PnlTracker::new();

        assert!(apply(
            &mut position,
            &mut tracker,
            &fill("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100), dec!(0.1))
        )
        .is_none());
        let closed = apply(
            &mut position,
            &mut tracker,
            &fill("BTCUSDT", OrderSide::Sell, dec!(1), dec!(110), dec!(0.1)),
        )
        .unwrap();

        assert_eq!(closed.realized_pnl, dec!(10));
        assert_eq!(closed.fees, dec!(0.2));
        assert_eq!(closed.net_pnl, dec!(9.8));
        assert!(closed.is_win());
    }

    #[test]
    fn stats_aggregate_wins_and_losses() {
        let mut position = Position::flat("BTCUSDT");
        let mut tracker = PnlTracker::new();

        // Win: +10.
        apply(&mut position, &mut tracker, &fill("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100), dec!(0)));
        apply(&mut position, &mut tracker, &fill("BTCUSDT", OrderSide::Sell, dec!(1), dec!(110), dec!(0)));
        // Loss: -5.
        apply(&mut position, &mut tracker, &fill("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100), dec!(0)));
        apply(&mut position, &mut tracker, &fill("BTCUSDT", OrderSide::Sell, dec!(1), dec!(95), dec!(0)));

        let stats = tracker.stats();
        assert_eq!(stats.episodes, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.realized_pnl, dec!(5));
        assert_eq!(stats.win_rate, dec!(0.5));
    }

    #[test]
    fn flip_closes_and_reopens() {
        let mut position = Position::flat("BTCUSDT");
        let mut tracker = PnlTracker::new();

        apply(&mut position, &mut tracker, &fill("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100), dec!(0)));
        // Sell 3: closes the 1-long (+10) and opens a 2-short.
        let closed = apply(
            &mut position,
            &mut tracker,
            &fill("BTCUSDT", OrderSide::Sell, dec!(3), dec!(110), dec!(0)),
        )
        .unwrap();
        assert_eq!(closed.realized_pnl, dec!(10));

        // Close the short for another episode.
        let second = apply(
            &mut position,
            &mut tracker,
            &fill("BTCUSDT", OrderSide::Buy, dec!(2), dec!(105), dec!(0)),
        )
        .unwrap();
        assert_eq!(second.realized_pnl, dec!(10));
        assert_eq!(tracker.stats().episodes, 2);
    }

    #[test]
    fn losing_episode_counts_fees() {
        let mut position = Position::flat("ETHUSDT");
        let mut tracker = PnlTracker::new();

        apply(&mut position, &mut tracker, &fill("ETHUSDT", OrderSide::Buy, dec!(1), dec!(100), dec!(1)));
        let closed = apply(
            &mut position,
            &mut tracker,
            &fill("ETHUSDT", OrderSide::Sell, dec!(1), dec!(100.5), dec!(1)),
        )
        .unwrap();

        // Gross +0.5, fees 2, net -1.5: a loss.
        assert!(!closed.is_win());
    }
}
