// src/patterns/harmonic.rs
use log::*;

use crate::config::{PatternConfig, PatternTemplate, RatioRule};
use crate::models::{Candle, Pattern, PatternPoints, Pivot, PivotKind, Ratios};
use crate::patterns::pivots::PivotScanner;

/// Scans pivot quintuples for conformance to the configured harmonic
/// ratio templates.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    config: PatternConfig,
}

impl PatternMatcher {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Detects completed patterns in the series. Produces nothing when there
    /// are fewer than the configured minimum candles or fewer than 5 pivots.
    pub fn detect(&self, candles: &[Candle]) -> Vec<Pattern> {
        let mut patterns = Vec::new();

        if candles.len() < self.config.min_candles {
            debug!(
                "Skipping pattern scan: {} candles, need {}",
                candles.len(),
                self.config.min_candles
            );
            return patterns;
        }

        let scanner = PivotScanner::new(self.config.pivot_window);
        let pivots = scanner.find_pivots(candles);

        if pivots.len() < 5 {
            debug!("Skipping pattern scan: only {} pivots", pivots.len());
            return patterns;
        }

        for window in pivots.windows(5) {
            if let Some(pattern) = self.match_quintuple(window) {
                info!(
                    "{} pattern at D={:.4} ({}, confidence {:.1})",
                    pattern.name, pattern.points.d.price, pattern.direction, pattern.confidence
                );
                patterns.push(pattern);
            }
        }

        patterns
    }

    /// Classifies one consecutive X,A,B,C,D quintuple against the template
    /// table. The kinds must strictly alternate; degenerate geometry only
    /// drops the affected ratio, never the whole scan.
    pub fn match_quintuple(&self, window: &[Pivot]) -> Option<Pattern> {
        if window.len() != 5 {
            return None;
        }

        let points = PatternPoints {
            x: window[0].clone(),
            a: window[1].clone(),
            b: window[2].clone(),
            c: window[3].clone(),
            d: window[4].clone(),
        };
        points.template_direction()?;

        let ratios = compute_ratios(&points);

        for template in &self.config.templates {
            if self.matches_template(&ratios, template) {
                let confidence = self.confidence(&ratios, template);
                return Pattern::new(template.name.clone(), points, ratios, confidence);
            }
        }

        None
    }

    /// A template matches when at least 3 of its 4 ratio checks fall inside
    /// the band widened by the absolute tolerance. An absent ratio cannot
    /// pass its check.
    fn matches_template(&self, ratios: &Ratios, template: &PatternTemplate) -> bool {
        let tolerance = self.config.ratio_tolerance;
        let checks = [
            in_band(ratios.ab_xa, &template.ab_xa, tolerance),
            in_band(ratios.bc_ab, &template.bc_ab, tolerance),
            in_band(ratios.cd_bc, &template.cd_bc, tolerance),
            in_band(ratios.ad_xa, &template.ad_xa, tolerance),
        ];
        checks.iter().filter(|&&passed| passed).count() >= 3
    }

    /// Mean of per-ratio proximity scores over the ratios that exist, each
    /// measured to the nearest of the rule's targets.
    fn confidence(&self, ratios: &Ratios, template: &PatternTemplate) -> f64 {
        let scores: Vec<f64> = [
            (ratios.ab_xa, &template.ab_xa),
            (ratios.bc_ab, &template.bc_ab),
            (ratios.cd_bc, &template.cd_bc),
            (ratios.ad_xa, &template.ad_xa),
        ]
        .iter()
        .filter_map(|(ratio, rule)| ratio.map(|value| proximity_score(value, rule)))
        .collect();

        if scores.is_empty() {
            return 0.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn compute_ratios(points: &PatternPoints) -> Ratios {
    let xa = (points.a.price - points.x.price).abs();
    let ab = (points.b.price - points.a.price).abs();
    let bc = (points.c.price - points.b.price).abs();
    let cd = (points.d.price - points.c.price).abs();
    let ad = (points.d.price - points.a.price).abs();

    let mut ratios = Ratios::default();
    if xa != 0.0 {
        ratios.ab_xa = Some(ab / xa);
        ratios.ad_xa = Some(ad / xa);
    }
    if ab != 0.0 {
        ratios.bc_ab = Some(bc / ab);
    }
    if bc != 0.0 {
        ratios.cd_bc = Some(cd / bc);
    }
    ratios
}

fn in_band(ratio: Option<f64>, rule: &RatioRule, tolerance: f64) -> bool {
    match ratio {
        Some(value) => rule.min - tolerance <= value && value <= rule.max + tolerance,
        None => false,
    }
}

fn proximity_score(value: f64, rule: &RatioRule) -> f64 {
    let distance = rule
        .targets
        .iter()
        .map(|target| (value - target).abs())
        .fold(f64::INFINITY, f64::min);
    if !distance.is_finite() {
        return 0.0;
    }
    (100.0 - distance * rule.scale).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

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

    fn matcher() -> PatternMatcher {
        PatternMatcher::new(PatternConfig::default())
    }

    /// Bullish butterfly geometry landing every ratio inside its band:
    /// XA=10, AB=7.86, BC=0.618*AB, CD=2*BC, and AD/XA follows at ~1.272.
    fn butterfly_quintuple() -> Vec<Pivot> {
        let x = 100.0;
        let a = 110.0;
        let b = a - 7.86;
        let c = b + 0.618 * 7.86;
        let d = c - 2.0 * (c - b);
        vec![
            pivot(0, x, PivotKind::Low),
            pivot(6, a, PivotKind::High),
            pivot(12, b, PivotKind::Low),
            pivot(18, c, PivotKind::High),
            pivot(24, d, PivotKind::Low),
        ]
    }

    #[test]
    fn rejects_non_alternating_sequences() {
        let m = matcher();
        let mut window = butterfly_quintuple();
        window[2].kind = PivotKind::High;
        assert!(m.match_quintuple(&window).is_none());
    }

    #[test]
    fn accepts_centered_ratios_with_high_confidence() {
        let m = matcher();
        let pattern = m
            .match_quintuple(&butterfly_quintuple())
            .expect("centered ratios should match");

        assert_eq!(pattern.name, "butterfly");
        assert_eq!(pattern.direction, crate::models::Direction::Bullish);
        assert!(
            pattern.confidence >= 90.0,
            "confidence {} too low",
            pattern.confidence
        );

        let ab_xa = pattern.ratios.ab_xa.unwrap();
        assert!((ab_xa - 0.786).abs() < 1e-9);
        let cd_bc = pattern.ratios.cd_bc.unwrap();
        assert!((cd_bc - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_ratios_far_from_every_band() {
        let m = matcher();
        // AB/XA = 0.3, BC/AB = 1.5, CD/BC = 0.5, AD/XA ~ 0.075: every check
        // is at least 0.3 outside its widened band.
        let x = 100.0;
        let a = 110.0;
        let b = a - 3.0;
        let c = b + 4.5;
        let d = c - 2.25;
        let window = vec![
            pivot(0, x, PivotKind::Low),
            pivot(6, a, PivotKind::High),
            pivot(12, b, PivotKind::Low),
            pivot(18, c, PivotKind::High),
            pivot(24, d, PivotKind::Low),
        ];
        assert!(m.match_quintuple(&window).is_none());
    }

    #[test]
    fn zero_length_leg_omits_ratio_instead_of_dividing() {
        let points = PatternPoints {
            x: pivot(0, 100.0, PivotKind::Low),
            a: pivot(6, 100.0, PivotKind::High),
            b: pivot(12, 95.0, PivotKind::Low),
            c: pivot(18, 98.0, PivotKind::High),
            d: pivot(24, 94.0, PivotKind::Low),
        };
        let ratios = compute_ratios(&points);
        assert!(ratios.ab_xa.is_none());
        assert!(ratios.ad_xa.is_none());
        assert!(ratios.bc_ab.is_some());
    }

    #[test]
    fn direction_follows_point_d() {
        let m = matcher();
        // Mirror the bullish butterfly downward to get a bearish structure.
        let x = 110.0;
        let a = 100.0;
        let b = a + 7.86;
        let c = b - 0.618 * 7.86;
        let d = c + 2.0 * (b - c);
        let window = vec![
            pivot(0, x, PivotKind::High),
            pivot(6, a, PivotKind::Low),
            pivot(12, b, PivotKind::High),
            pivot(18, c, PivotKind::Low),
            pivot(24, d, PivotKind::High),
        ];
        let pattern = m.match_quintuple(&window).expect("mirrored match");
        assert_eq!(pattern.direction, crate::models::Direction::Bearish);
        assert_eq!(pattern.completed_at, window[4].timestamp);
    }

    #[test]
    fn detect_needs_minimum_history() {
        let m = matcher();
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        assert!(m.detect(&candles).is_empty());
    }
}
