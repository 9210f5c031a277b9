// src/confirmation/mod.rs
use log::*;

use crate::models::{Candle, ConfirmationResult, Direction, OrderSide, Pattern, ZoneSet};

/// Evaluates the three entry gates against finer-timeframe data. Entry fires
/// only when every gate passes; there is no partial-majority path.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPipeline;

impl ConfirmationPipeline {
    pub fn new() -> Self {
        Self
    }

    pub fn confirm(
        &self,
        _coarse: &[Candle],
        fine: &[Candle],
        pattern: &Pattern,
        zones: &ZoneSet,
    ) -> ConfirmationResult {
        let direction = match pattern.direction {
            Direction::Bearish => OrderSide::Sell,
            Direction::Bullish => OrderSide::Buy,
        };

        let last_close = fine.last().map(|candle| candle.close);

        let candle_close = self.candle_close_gate(fine, zones);
        let trendline_break = self.trendline_break_gate(fine, zones);
        let zone_break = self.zone_break_gate(fine, zones);

        let score =
            u8::from(candle_close) + u8::from(trendline_break) + u8::from(zone_break);
        let entry_signal = score >= 3;

        // The confirming close when the candle gate fired, otherwise the
        // latest close available to the caller.
        let entry_price = if candle_close { last_close } else { None };
        let entry_price = if entry_signal {
            entry_price.or(last_close)
        } else {
            entry_price
        };

        debug!(
            "Confirmation for {}: candle={}, trendline={}, zone={}, score={}/3",
            pattern.dedup_key(),
            candle_close,
            trendline_break,
            zone_break,
            score
        );

        ConfirmationResult {
            candle_close,
            trendline_break,
            zone_break,
            score,
            entry_signal,
            direction,
            entry_price,
        }
    }

    /// Gate 1: the last fine candle closed beyond the 0.886 level in the
    /// pattern's direction.
    fn candle_close_gate(&self, fine: &[Candle], zones: &ZoneSet) -> bool {
        let (last, level_886) = match (fine.last(), zones.level_886()) {
            (Some(last), Some(level)) => (last, level),
            _ => return false,
        };

        match zones.direction {
            Direction::Bearish => last.close < level_886,
            Direction::Bullish => last.close > level_886,
        }
    }

    /// Gate 2: a valid trendline (>= 3 touches) whose projected price the
    /// last fine close crossed against the line's role.
    fn trendline_break_gate(&self, fine: &[Candle], zones: &ZoneSet) -> bool {
        let trendline = match &zones.trendline {
            Some(trendline) if trendline.is_valid => trendline,
            _ => return false,
        };
        let last = match fine.last() {
            Some(last) => last,
            None => return false,
        };

        match zones.direction {
            // Resistance line: a close above it breaks the bearish structure
            // outward.
            Direction::Bearish => last.close > trendline.projected_price,
            // Support line: a close below it breaks the bullish structure.
            Direction::Bullish => last.close < trendline.projected_price,
        }
    }

    /// Gate 3: the last fine close sits strictly outside the entry zone in
    /// the trade direction.
    fn zone_break_gate(&self, fine: &[Candle], zones: &ZoneSet) -> bool {
        let last = match fine.last() {
            Some(last) => last,
            None => return false,
        };

        match zones.direction {
            Direction::Bearish => last.close < zones.entry_zone.lower,
            Direction::Bullish => last.close > zones.entry_zone.upper,
        }
    }
}
