// src/patterns/zones.rs
use chrono::{DateTime, Duration, Utc};
use log::*;
use std::collections::HashMap;

use crate::config::ZonesConfig;
use crate::models::{
    Candle, Direction, FibLevels, Pattern, Pivot, PivotKind, PriceZone, Trendline, ZoneSet,
};

/// Derives Fibonacci retracement levels and entry/rebound zones from a
/// completed pattern, and fits the pattern's trendline.
#[derive(Debug, Clone)]
pub struct ZoneCalculator {
    config: ZonesConfig,
}

impl ZoneCalculator {
    pub fn new(config: ZonesConfig) -> Self {
        Self { config }
    }

    /// Pure function of (D, C, direction): levels step from D toward C by
    /// each configured ratio of the D-C distance. The entry zone spans D to
    /// the 0.886 level, the rebound zone 0.886 to C.
    pub fn build_zones(&self, pattern: &Pattern) -> ZoneSet {
        let d = pattern.points.d.price;
        let c = pattern.points.c.price;
        let distance = (d - c).abs();

        let mut levels = FibLevels::new();
        for &ratio in &self.config.fib_levels {
            let permille = (ratio * 1000.0).round() as u32;
            levels.insert(permille, level_price(d, distance, ratio, pattern.direction));
        }

        // The 0.886 level anchors both zones even if the configured level
        // set omits it.
        let level_886 = levels
            .get(&886)
            .copied()
            .unwrap_or_else(|| level_price(d, distance, 0.886, pattern.direction));

        ZoneSet {
            pattern_id: pattern.dedup_key(),
            direction: pattern.direction,
            base_price: d,
            target_price: c,
            levels,
            entry_zone: PriceZone::between(d, level_886),
            rebound_zone: PriceZone::between(level_886, c),
            trendline: None,
        }
    }

    /// Fits a line through the pattern points playing the support or
    /// resistance role: High pivots of {X, B, D} for a bearish structure,
    /// Low pivots for a bullish one. Needs at least two qualifying points.
    pub fn build_trendline(&self, candles: &[Candle], pattern: &Pattern) -> Option<Trendline> {
        let role_kind = match pattern.direction {
            Direction::Bearish => PivotKind::High,
            Direction::Bullish => PivotKind::Low,
        };

        let anchors: Vec<&Pivot> = [
            &pattern.points.x,
            &pattern.points.b,
            &pattern.points.d,
        ]
        .into_iter()
        .filter(|pivot| pivot.kind == role_kind)
        .collect();

        if anchors.len() < 2 || candles.is_empty() {
            return None;
        }

        let (slope, intercept) = least_squares(&anchors)?;
        let last_index = candles.len() - 1;
        let projected_price = slope * last_index as f64 + intercept;

        let touches = self.count_touches(candles, slope, intercept, pattern.direction);
        let is_valid = touches >= self.config.trendline_min_touches;

        debug!(
            "Trendline for {}: slope={:.6}, touches={}, valid={}",
            pattern.dedup_key(),
            slope,
            touches,
            is_valid
        );

        Some(Trendline {
            slope,
            intercept,
            touches,
            projected_price,
            is_valid,
        })
    }

    /// A bar touches the line when its relevant extreme (high for
    /// resistance, low for support) sits within the relative tolerance of
    /// the fitted price at that index.
    fn count_touches(
        &self,
        candles: &[Candle],
        slope: f64,
        intercept: f64,
        direction: Direction,
    ) -> usize {
        let tolerance = self.config.trendline_tolerance;
        candles
            .iter()
            .enumerate()
            .filter(|(i, candle)| {
                let line = slope * *i as f64 + intercept;
                if line <= 0.0 {
                    return false;
                }
                let extreme = match direction {
                    Direction::Bearish => candle.high,
                    Direction::Bullish => candle.low,
                };
                (extreme - line).abs() / line <= tolerance
            })
            .count()
    }
}

fn level_price(d: f64, distance: f64, ratio: f64, direction: Direction) -> f64 {
    match direction {
        Direction::Bearish => d - distance * ratio,
        Direction::Bullish => d + distance * ratio,
    }
}

/// Ordinary least squares over (index, price). None when the points share a
/// single index, which cannot anchor a line.
fn least_squares(points: &[&Pivot]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| p.index as f64).sum();
    let sum_y: f64 = points.iter().map(|p| p.price).sum();
    let sum_xy: f64 = points.iter().map(|p| p.index as f64 * p.price).sum();
    let sum_x2: f64 = points.iter().map(|p| (p.index as f64).powi(2)).sum();

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

#[derive(Debug, Clone)]
pub struct TrackedPattern {
    pub pattern: Pattern,
    pub zones: ZoneSet,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
}

/// Single-writer registry of detected patterns and their zones, keyed by the
/// pattern dedup id. All mutation goes through these methods.
#[derive(Debug, Default)]
pub struct PatternStore {
    entries: HashMap<String, TrackedPattern>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, pattern: Pattern, zones: ZoneSet, now: DateTime<Utc>) {
        let key = pattern.dedup_key();
        self.entries.insert(
            key,
            TrackedPattern {
                pattern,
                zones,
                detected_at: now,
                processed: false,
            },
        );
    }

    pub fn mark_processed(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.processed = true;
        }
    }

    pub fn get(&self, key: &str) -> Option<&TrackedPattern> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deactivates the zones of entries older than the zone retention; their
    /// pattern record stays for dedup until pattern cleanup removes it.
    pub fn expire_zones(&mut self, now: DateTime<Utc>, zone_retention: Duration) {
        for entry in self.entries.values_mut() {
            if now - entry.detected_at > zone_retention {
                entry.zones.entry_zone.active = false;
                entry.zones.rebound_zone.active = false;
            }
        }
    }

    /// Drops entries past the pattern retention window.
    pub fn cleanup(&mut self, now: DateTime<Utc>, pattern_retention: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now - entry.detected_at <= pattern_retention);
        let removed = before - self.entries.len();
        if removed > 0 {
            info!("Removed {} stale pattern records", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PatternPoints, Ratios};
    use chrono::TimeZone;

    fn pivot(index: usize, price: f64, kind: PivotKind) -> Pivot {
        Pivot {
            index,
            price,
            kind,
            timestamp: Utc
                .timestamp_opt(1_700_000_000 + index as i64 * 3600, 0)
                .unwrap(),
        }
    }

    fn bearish_pattern(d_price: f64, c_price: f64) -> Pattern {
        let points = PatternPoints {
            x: pivot(0, 104.0, PivotKind::High),
            a: pivot(5, 95.0, PivotKind::Low),
            b: pivot(10, 102.0, PivotKind::High),
            c: pivot(15, c_price, PivotKind::Low),
            d: pivot(20, d_price, PivotKind::High),
        };
        Pattern::new("butterfly", points, Ratios::default(), 90.0).unwrap()
    }

    fn calculator() -> ZoneCalculator {
        ZoneCalculator::new(ZonesConfig::default())
    }

    #[test]
    fn bearish_levels_step_down_from_d() {
        let calc = calculator();
        let pattern = bearish_pattern(100.0, 90.0);
        let zones = calc.build_zones(&pattern);

        assert_eq!(zones.base_price, 100.0);
        assert_eq!(zones.target_price, 90.0);
        assert!((zones.level(618).unwrap() - 93.82).abs() < 1e-9);
        assert!((zones.level(886).unwrap() - 91.14).abs() < 1e-9);

        assert!((zones.entry_zone.lower - 91.14).abs() < 1e-9);
        assert_eq!(zones.entry_zone.upper, 100.0);
        assert_eq!(zones.rebound_zone.lower, 90.0);
        assert!((zones.rebound_zone.upper - 91.14).abs() < 1e-9);
    }

    #[test]
    fn zone_build_is_deterministic() {
        let calc = calculator();
        let pattern = bearish_pattern(100.0, 90.0);
        let first = calc.build_zones(&pattern);
        let second = calc.build_zones(&pattern);
        assert_eq!(first, second);
    }

    #[test]
    fn bullish_levels_mirror_upward() {
        let calc = calculator();
        let points = PatternPoints {
            x: pivot(0, 96.0, PivotKind::Low),
            a: pivot(5, 105.0, PivotKind::High),
            b: pivot(10, 98.0, PivotKind::Low),
            c: pivot(15, 110.0, PivotKind::High),
            d: pivot(20, 100.0, PivotKind::Low),
        };
        let pattern = Pattern::new("butterfly", points, Ratios::default(), 90.0).unwrap();
        let zones = calc.build_zones(&pattern);

        assert!((zones.level(886).unwrap() - 108.86).abs() < 1e-9);
        assert_eq!(zones.entry_zone.lower, 100.0);
        assert!((zones.entry_zone.upper - 108.86).abs() < 1e-9);
    }

    #[test]
    fn trendline_fits_aligned_support() {
        let calc = calculator();
        // Lows on the exact line 90 + 0.5*i; highs well away from it.
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
                open: 95.0,
                high: 120.0 + i as f64,
                low: 90.0 + 0.5 * i as f64,
                close: 95.0,
                volume: 1.0,
            })
            .collect();

        let points = PatternPoints {
            x: pivot(2, 91.0, PivotKind::Low),
            a: pivot(6, 140.0, PivotKind::High),
            b: pivot(10, 95.0, PivotKind::Low),
            c: pivot(14, 150.0, PivotKind::High),
            d: pivot(20, 100.0, PivotKind::Low),
        };
        let pattern = Pattern::new("butterfly", points, Ratios::default(), 90.0).unwrap();

        let trendline = calc.build_trendline(&candles, &pattern).unwrap();
        assert!((trendline.slope - 0.5).abs() < 1e-9);
        assert!((trendline.intercept - 90.0).abs() < 1e-9);
        assert!((trendline.projected_price - (90.0 + 0.5 * 29.0)).abs() < 1e-9);
        assert_eq!(trendline.touches, 30);
        assert!(trendline.is_valid);
    }

    #[test]
    fn trendline_needs_two_role_points() {
        let calc = calculator();
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();

        // X, B, D forced away from the support role by marking the pattern
        // bearish: only High pivots of {X,B,D} qualify, and only D is one.
        let points = PatternPoints {
            x: pivot(0, 104.0, PivotKind::High),
            a: pivot(2, 95.0, PivotKind::Low),
            b: pivot(4, 102.0, PivotKind::High),
            c: pivot(6, 96.0, PivotKind::Low),
            d: pivot(8, 103.0, PivotKind::High),
        };
        let mut pattern = Pattern::new("butterfly", points, Ratios::default(), 90.0).unwrap();
        // Hollow out the qualifying anchors: repoint X and B as lows.
        pattern.points.x.kind = PivotKind::Low;
        pattern.points.b.kind = PivotKind::Low;

        assert!(calc.build_trendline(&candles, &pattern).is_none());
    }

    #[test]
    fn rebound_targets_order_follows_direction() {
        let calc = calculator();
        let bearish = calc.build_zones(&bearish_pattern(100.0, 90.0));
        let targets = bearish.rebound_targets(3);
        // Ordered low-to-high for a short: C first, then deep retracements.
        assert_eq!(targets.len(), 3);
        assert!(targets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(targets[0], 90.0);

        let points = PatternPoints {
            x: pivot(0, 96.0, PivotKind::Low),
            a: pivot(5, 105.0, PivotKind::High),
            b: pivot(10, 98.0, PivotKind::Low),
            c: pivot(15, 110.0, PivotKind::High),
            d: pivot(20, 100.0, PivotKind::Low),
        };
        let bullish_pattern =
            Pattern::new("butterfly", points, Ratios::default(), 90.0).unwrap();
        let bullish = calc.build_zones(&bullish_pattern);
        let targets = bullish.rebound_targets(3);
        assert!(targets.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(targets[0], 110.0);
    }

    #[test]
    fn store_dedup_and_cleanup() {
        let calc = calculator();
        let pattern = bearish_pattern(100.0, 90.0);
        let zones = calc.build_zones(&pattern);
        let key = pattern.dedup_key();

        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut store = PatternStore::new();
        assert!(!store.is_known(&key));
        store.insert(pattern.clone(), zones.clone(), t0);
        assert!(store.is_known(&key));
        assert_eq!(store.len(), 1);

        store.mark_processed(&key);
        assert!(store.get(&key).unwrap().processed);

        // Zones expire before the pattern record does.
        store.expire_zones(t0 + Duration::hours(25), Duration::hours(24));
        assert!(!store.get(&key).unwrap().zones.entry_zone.active);
        assert!(store.is_known(&key));

        store.cleanup(t0 + Duration::hours(49), Duration::hours(48));
        assert!(!store.is_known(&key));

        // Idempotent on a second pass.
        store.cleanup(t0 + Duration::hours(49), Duration::hours(48));
        assert!(store.is_empty());
    }
}
