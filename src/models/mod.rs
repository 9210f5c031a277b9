// src/models/mod.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PivotKind {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub index: usize,
    pub price: f64,
    pub kind: PivotKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bullish => write!(f, "bullish"),
            Direction::Bearish => write!(f, "bearish"),
        }
    }
}

/// Leg ratios of an XABCD structure. A zero-length reference leg leaves the
/// ratio absent rather than dividing by zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ratios {
    pub ab_xa: Option<f64>,
    pub bc_ab: Option<f64>,
    pub cd_bc: Option<f64>,
    pub ad_xa: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPoints {
    pub x: Pivot,
    pub a: Pivot,
    pub b: Pivot,
    pub c: Pivot,
    pub d: Pivot,
}

impl PatternPoints {
    pub fn kinds(&self) -> [PivotKind; 5] {
        [
            self.x.kind,
            self.a.kind,
            self.b.kind,
            self.c.kind,
            self.d.kind,
        ]
    }

    /// The direction implied by the kind sequence, or None when the points
    /// do not strictly alternate as one of the two valid templates.
    pub fn template_direction(&self) -> Option<Direction> {
        use PivotKind::{High, Low};
        match self.kinds() {
            [Low, High, Low, High, Low] => Some(Direction::Bullish),
            [High, Low, High, Low, High] => Some(Direction::Bearish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub points: PatternPoints,
    pub ratios: Ratios,
    pub confidence: f64,
    pub direction: Direction,
    pub completed_at: DateTime<Utc>,
}

impl Pattern {
    /// Builds a pattern, deriving direction from the point sequence.
    /// Returns None for a non-alternating quintuple.
    pub fn new(
        name: impl Into<String>,
        points: PatternPoints,
        ratios: Ratios,
        confidence: f64,
    ) -> Option<Self> {
        let direction = points.template_direction()?;
        let completed_at = points.d.timestamp;
        Some(Self {
            name: name.into(),
            points,
            ratios,
            confidence: confidence.clamp(0.0, 100.0),
            direction,
            completed_at,
        })
    }

    /// Key used to avoid reprocessing the same completed structure.
    pub fn dedup_key(&self) -> String {
        format!("{}_{}", self.name, self.completed_at.timestamp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceZone {
    pub lower: f64,
    pub upper: f64,
    pub active: bool,
}

impl PriceZone {
    pub fn between(a: f64, b: f64) -> Self {
        Self {
            lower: a.min(b),
            upper: a.max(b),
            active: true,
        }
    }

    pub fn contains(&self, price: f64) -> bool {
        self.lower <= price && price <= self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trendline {
    pub slope: f64,
    pub intercept: f64,
    pub touches: usize,
    pub projected_price: f64,
    pub is_valid: bool,
}

impl Trendline {
    pub fn price_at(&self, index: usize) -> f64 {
        self.slope * index as f64 + self.intercept
    }
}

/// Fibonacci level map keyed by the ratio in permille (618 for 0.618),
/// keeping the levels ordered by ratio.
pub type FibLevels = BTreeMap<u32, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSet {
    pub pattern_id: String,
    pub direction: Direction,
    pub base_price: f64,
    pub target_price: f64,
    pub levels: FibLevels,
    pub entry_zone: PriceZone,
    pub rebound_zone: PriceZone,
    pub trendline: Option<Trendline>,
}

impl ZoneSet {
    pub fn level(&self, permille: u32) -> Option<f64> {
        self.levels.get(&permille).copied()
    }

    /// The 0.886 retracement, the key level for entry confirmation.
    pub fn level_886(&self) -> Option<f64> {
        self.level(886)
    }

    /// Candidate take-profit prices: the 0.618/0.5/0.382/0.236 retracements
    /// that exist plus the pattern's C price, ordered toward the trade's
    /// favorable direction and truncated to `max`.
    pub fn rebound_targets(&self, max: usize) -> Vec<f64> {
        let mut targets: Vec<f64> = [618, 500, 382, 236]
            .iter()
            .filter_map(|permille| self.level(*permille))
            .collect();
        targets.push(self.target_price);

        match self.direction {
            Direction::Bearish => targets.sort_by(|a, b| a.partial_cmp(b).unwrap()),
            Direction::Bullish => targets.sort_by(|a, b| b.partial_cmp(a).unwrap()),
        }

        targets.truncate(max);
        targets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub candle_close: bool,
    pub trendline_break: bool,
    pub zone_break: bool,
    pub score: u8,
    pub entry_signal: bool,
    pub direction: OrderSide,
    pub entry_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TargetsFilled,
    Forced(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "stop-loss"),
            CloseReason::TargetsFilled => write!(f, "all targets filled"),
            CloseReason::Forced(reason) => write!(f, "forced: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    pub order_id: Option<String>,
    pub price: f64,
    pub size: f64,
    pub level: usize,
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub side: OrderSide,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLeg>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: f64,
    pub entry_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub entry_order_id: Option<String>,
    pub stop_order_id: Option<String>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn mark_closed(&mut self, reason: CloseReason, at: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.close_time = Some(at);
    }

    /// Directional PnL for `size` units exiting at `exit_price`.
    pub fn pnl_at(&self, exit_price: f64, size: f64) -> f64 {
        match self.side {
            OrderSide::Buy => (exit_price - self.entry_price) * size,
            OrderSide::Sell => (self.entry_price - exit_price) * size,
        }
    }

    /// Size not yet taken out by executed take-profit legs.
    pub fn remaining_size(&self) -> f64 {
        let executed: f64 = self
            .take_profits
            .iter()
            .filter(|leg| leg.executed)
            .map(|leg| leg.size)
            .sum();
        (self.size - executed).max(0.0)
    }
}
