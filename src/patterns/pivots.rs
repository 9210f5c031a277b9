// src/patterns/pivots.rs
use crate::models::{Candle, Pivot, PivotKind};

/// Scans a candle series for local price extrema over a symmetric window.
#[derive(Debug, Clone)]
pub struct PivotScanner {
    window: usize,
}

impl PivotScanner {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// A bar is a High pivot when its high is >= every high within `window`
    /// bars on both sides; Low pivots symmetrically on lows. Ties keep the
    /// status, so flat stretches can mark several neighboring bars. Bars
    /// closer than `window` to either end are never evaluated. Returns an
    /// empty list when the series is shorter than 2*window+1.
    pub fn find_pivots(&self, candles: &[Candle]) -> Vec<Pivot> {
        let mut pivots = Vec::new();

        if self.window == 0 || candles.len() < 2 * self.window + 1 {
            return pivots;
        }

        for i in self.window..candles.len() - self.window {
            let neighborhood = &candles[i - self.window..=i + self.window];

            let is_high = neighborhood
                .iter()
                .all(|candle| candles[i].high >= candle.high);
            let is_low = neighborhood
                .iter()
                .all(|candle| candles[i].low <= candle.low);

            if is_high {
                pivots.push(Pivot {
                    index: i,
                    price: candles[i].high,
                    kind: PivotKind::High,
                    timestamp: candles[i].timestamp,
                });
            }

            if is_low {
                pivots.push(Pivot {
                    index: i,
                    price: candles[i].low,
                    kind: PivotKind::Low,
                    timestamp: candles[i].timestamp,
                });
            }
        }

        // Emitted high-before-low per bar above; keep overall index order.
        pivots.sort_by_key(|pivot| pivot.index);
        pivots
    }
}
