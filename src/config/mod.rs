// src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::venue::VenueConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub venue: VenueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub symbol: String,
    /// Timeframe patterns are detected on.
    pub timeframe_main: String,
    /// Finer timeframe used for entry confirmation.
    pub timeframe_entry: String,
    pub coarse_history: usize,
    pub fine_history: usize,
    pub analysis_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub status_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe_main: "1h".to_string(),
            timeframe_entry: "5m".to_string(),
            coarse_history: 200,
            fine_history: 100,
            analysis_interval_secs: 300,
            monitor_interval_secs: 10,
            status_interval_secs: 4 * 3600,
            cleanup_interval_secs: 24 * 3600,
        }
    }
}

/// Acceptance band and confidence scoring for one named leg ratio.
/// `targets` holds the valid ratio values confidence is measured against;
/// distance to the nearest one is scaled by `scale` and subtracted from 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioRule {
    pub min: f64,
    pub max: f64,
    pub targets: Vec<f64>,
    pub scale: f64,
}

impl RatioRule {
    pub fn point(target: f64, scale: f64) -> Self {
        Self {
            min: target,
            max: target,
            targets: vec![target],
            scale,
        }
    }

    pub fn band(min: f64, max: f64, targets: Vec<f64>, scale: f64) -> Self {
        Self {
            min,
            max,
            targets,
            scale,
        }
    }
}

/// One harmonic family as a pure data table. Adding a family means adding a
/// template, not touching the scan algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTemplate {
    pub name: String,
    pub ab_xa: RatioRule,
    pub bc_ab: RatioRule,
    pub cd_bc: RatioRule,
    pub ad_xa: RatioRule,
}

impl PatternTemplate {
    pub fn butterfly() -> Self {
        Self {
            name: "butterfly".to_string(),
            ab_xa: RatioRule::point(0.786, 100.0),
            bc_ab: RatioRule::band(
                0.382,
                0.886,
                vec![0.382, 0.5, 0.618, 0.786, 0.886],
                100.0,
            ),
            cd_bc: RatioRule::band(1.618, 2.618, vec![1.618, 2.618], 50.0),
            ad_xa: RatioRule::band(1.27, 1.618, vec![1.27, 1.618], 100.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub pivot_window: usize,
    pub min_candles: usize,
    /// Absolute widening applied to every ratio band.
    pub ratio_tolerance: f64,
    pub templates: Vec<PatternTemplate>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            pivot_window: 5,
            min_candles: 50,
            ratio_tolerance: 0.05,
            templates: vec![PatternTemplate::butterfly()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonesConfig {
    pub fib_levels: Vec<f64>,
    /// Relative distance from the fitted line that still counts as a touch.
    pub trendline_tolerance: f64,
    pub trendline_min_touches: usize,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            fib_levels: vec![0.236, 0.382, 0.5, 0.618, 0.786, 0.886, 1.0],
            trendline_tolerance: 0.002,
            trendline_min_touches: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Percent of available balance risked per trade.
    pub risk_percentage: f64,
    pub max_positions: usize,
    /// Stop distance beyond D as a fraction of D's price.
    pub stop_buffer_fraction: f64,
    pub max_take_profits: usize,
    pub balance_currency: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_percentage: 1.0,
            max_positions: 3,
            stop_buffer_fraction: 0.0005,
            max_take_profits: 3,
            balance_currency: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub pattern_hours: i64,
    pub zone_hours: i64,
    pub closed_position_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            pattern_hours: 48,
            zone_hours: 24,
            closed_position_days: 7,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut file = File::open(path.as_ref()).context("Failed to open config file")?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .context("Failed to read config file")?;
    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [general]
            symbol = "ETHUSDT"
            timeframe_main = "1h"
            timeframe_entry = "5m"
            coarse_history = 200
            fine_history = 100
            analysis_interval_secs = 300
            monitor_interval_secs = 10
            status_interval_secs = 14400
            cleanup_interval_secs = 86400
            "#,
        )
        .unwrap();

        assert_eq!(config.general.symbol, "ETHUSDT");
        assert_eq!(config.pattern.pivot_window, 5);
        assert_eq!(config.risk.max_positions, 3);
        assert_eq!(config.retention.zone_hours, 24);
    }

    #[test]
    fn butterfly_template_bands() {
        let template = PatternTemplate::butterfly();
        assert_eq!(template.ab_xa.min, template.ab_xa.max);
        assert_eq!(template.bc_ab.targets.len(), 5);
        assert_eq!(template.cd_bc.scale, 50.0);
    }
}
