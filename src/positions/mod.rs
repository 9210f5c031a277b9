// src/positions/mod.rs
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::*;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RiskConfig;
use crate::models::{
    CloseReason, ConfirmationResult, Direction, Pattern, Position, PositionStatus,
    TakeProfitLeg, ZoneSet,
};
use crate::notify::{Notifier, NotifyEvent};
use crate::venue::Venue;

/// Owns the position registry and drives every state transition. Positions
/// are kept in insertion order; nothing outside this type mutates them.
pub struct PositionLifecycleManager {
    venue: Arc<dyn Venue>,
    notifier: Notifier,
    config: RiskConfig,
    symbol: String,
    positions: Vec<Position>,
}

impl PositionLifecycleManager {
    pub fn new(
        venue: Arc<dyn Venue>,
        notifier: Notifier,
        config: RiskConfig,
        symbol: String,
    ) -> Self {
        Self {
            venue,
            notifier,
            config,
            symbol,
            positions: Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_active()).count()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn get(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Realized PnL of positions closed or partially filled today.
    pub fn daily_pnl(&self, now: DateTime<Utc>) -> f64 {
        let today = now.date_naive();
        self.positions
            .iter()
            .filter(|p| match p.close_time {
                Some(closed) => closed.date_naive() == today,
                None => p.is_active(),
            })
            .map(|p| p.realized_pnl)
            .sum()
    }

    /// Opens a bracket position from a confirmed entry signal. Returns
    /// Ok(false) when the signal is rejected (no entry, capacity, zero
    /// size); Err only on a venue failure before the entry order, which
    /// leaves no partial state behind.
    pub async fn open(
        &mut self,
        pattern: &Pattern,
        zones: &ZoneSet,
        confirmation: &ConfirmationResult,
    ) -> Result<bool> {
        if !confirmation.entry_signal {
            return Ok(false);
        }

        if self.active_count() >= self.config.max_positions {
            warn!(
                "Position limit reached ({}/{}), skipping entry",
                self.active_count(),
                self.config.max_positions
            );
            return Ok(false);
        }

        let entry_price = match confirmation.entry_price {
            Some(price) => price,
            None => self.venue.get_current_price(&self.symbol).await?,
        };

        let stop_loss = stop_loss_level(pattern, self.config.stop_buffer_fraction);
        let targets = zones.rebound_targets(self.config.max_take_profits);

        let balance = self
            .venue
            .get_available_balance(&self.config.balance_currency)
            .await?;
        let risk_amount = balance * self.config.risk_percentage / 100.0;
        let size = self
            .venue
            .calculate_position_size(&self.symbol, risk_amount, entry_price, stop_loss)
            .await?;

        if size <= 0.0 {
            warn!("Computed position size {} is not tradeable", size);
            return Ok(false);
        }

        let side = confirmation.direction;
        let entry_order = self.venue.place_market_order(&self.symbol, side, size).await?;

        let now = Utc::now();
        let mut position = Position {
            id: format!("{}_{}", pattern.name, now.format("%Y%m%d_%H%M%S")),
            symbol: self.symbol.clone(),
            direction: pattern.direction,
            side,
            entry_price,
            size,
            stop_loss,
            take_profits: Vec::new(),
            status: PositionStatus::Active,
            close_reason: None,
            realized_pnl: 0.0,
            entry_time: now,
            close_time: None,
            entry_order_id: Some(entry_order.id),
            stop_order_id: None,
        };

        // The entry is live from here on: a failed bracket leg is recorded
        // as absent and the position is kept with whichever legs succeeded.
        let exit_side = side.opposite();
        match self
            .venue
            .place_stop_order(&self.symbol, exit_side, size, stop_loss)
            .await
        {
            Ok(order) => position.stop_order_id = Some(order.id),
            Err(e) => {
                error!("Failed to place stop-loss leg: {}", e);
                self.notifier.publish(NotifyEvent::Error {
                    context: "stop-loss placement".to_string(),
                    message: e.to_string(),
                });
            }
        }

        if !targets.is_empty() {
            let leg_size = size / targets.len() as f64;
            for (i, &target) in targets.iter().enumerate() {
                let order_id = match self
                    .venue
                    .place_limit_order(&self.symbol, exit_side, leg_size, target)
                    .await
                {
                    Ok(order) => Some(order.id),
                    Err(e) => {
                        error!("Failed to place take-profit leg {}: {}", i + 1, e);
                        None
                    }
                };
                position.take_profits.push(TakeProfitLeg {
                    order_id,
                    price: target,
                    size: leg_size,
                    level: i + 1,
                    executed: false,
                });
            }
        }

        info!(
            "Opened {} {} position {}: entry={:.4}, size={:.6}, stop={:.4}, targets={}",
            position.side,
            position.symbol,
            position.id,
            entry_price,
            size,
            stop_loss,
            position.take_profits.len()
        );

        self.notifier.publish(NotifyEvent::TradeEntry {
            symbol: position.symbol.clone(),
            direction: side,
            price: entry_price,
            size,
            stop_loss,
            take_profit: targets.first().copied(),
        });

        self.positions.push(position);
        Ok(true)
    }

    /// Walks Active positions in insertion order, reconciling recorded order
    /// ids against the venue's open set. A fault on one position is logged
    /// and never prevents later positions from being processed.
    pub async fn monitor(&mut self) {
        for index in 0..self.positions.len() {
            if !self.positions[index].is_active() {
                continue;
            }
            let id = self.positions[index].id.clone();
            if let Err(e) = self.monitor_one(index).await {
                error!("Error monitoring position {}: {}", id, e);
                self.notifier.publish(NotifyEvent::Error {
                    context: format!("monitoring {}", id),
                    message: e.to_string(),
                });
            }
        }
    }

    async fn monitor_one(&mut self, index: usize) -> Result<()> {
        let symbol = self.positions[index].symbol.clone();

        let open_orders = self.venue.get_open_orders(Some(&symbol)).await?;
        let open_ids: HashSet<String> =
            open_orders.into_iter().map(|order| order.id).collect();

        // Take-profit legs first, then the stop: a leg that vanished from
        // the open set has filled.
        let mut filled_legs = Vec::new();
        for (leg_index, leg) in self.positions[index].take_profits.iter().enumerate() {
            if leg.executed {
                continue;
            }
            match &leg.order_id {
                Some(order_id) if !open_ids.contains(order_id) => filled_legs.push(leg_index),
                _ => {}
            }
        }

        for leg_index in filled_legs {
            let (price, size, level) = {
                let leg = &self.positions[index].take_profits[leg_index];
                (leg.price, leg.size, leg.level)
            };
            let pnl = self.positions[index].pnl_at(price, size);
            let position = &mut self.positions[index];
            position.take_profits[leg_index].executed = true;
            position.realized_pnl += pnl;

            info!(
                "Take-profit {} filled for {} at {:.4}, PnL {:.2}",
                level, position.id, price, pnl
            );
            self.notifier.publish(NotifyEvent::TradeExit {
                symbol: position.symbol.clone(),
                direction: position.side,
                entry_price: position.entry_price,
                exit_price: price,
                size,
                pnl,
                reason: format!("take-profit {}", level),
            });
        }

        // All targets out: retire the position and pull the stop.
        if !self.positions[index].take_profits.is_empty()
            && self.positions[index]
                .take_profits
                .iter()
                .all(|leg| leg.executed)
        {
            let now = Utc::now();
            let stop_order_id = self.positions[index].stop_order_id.clone();
            self.positions[index].mark_closed(CloseReason::TargetsFilled, now);
            info!("Position {} closed: all targets filled", self.positions[index].id);

            if let Some(stop_id) = stop_order_id {
                if open_ids.contains(&stop_id) {
                    if let Err(e) = self.venue.cancel_order(&stop_id, &symbol).await {
                        error!("Failed to cancel stop after exhaustion: {}", e);
                    }
                }
            }
            return Ok(());
        }

        let stop_hit = match &self.positions[index].stop_order_id {
            Some(stop_id) => !open_ids.contains(stop_id),
            None => false,
        };
        if stop_hit {
            let now = Utc::now();
            let stop_price = self.positions[index].stop_loss;
            let full_size = self.positions[index].size;
            let pnl = self.positions[index].pnl_at(stop_price, full_size);

            let remaining: Vec<String> = self.positions[index]
                .take_profits
                .iter()
                .filter(|leg| !leg.executed)
                .filter_map(|leg| leg.order_id.clone())
                .collect();

            {
                let position = &mut self.positions[index];
                position.realized_pnl += pnl;
                position.mark_closed(CloseReason::StopLoss, now);
                warn!(
                    "Stop-loss filled for {} at {:.4}, PnL {:.2}",
                    position.id, stop_price, pnl
                );
            }

            for order_id in remaining {
                if let Err(e) = self.venue.cancel_order(&order_id, &symbol).await {
                    error!("Failed to cancel take-profit leg {}: {}", order_id, e);
                }
            }

            let position = &self.positions[index];
            self.notifier.publish(NotifyEvent::TradeExit {
                symbol: position.symbol.clone(),
                direction: position.side,
                entry_price: position.entry_price,
                exit_price: stop_price,
                size: full_size,
                pnl,
                reason: "stop-loss".to_string(),
            });
        }

        Ok(())
    }

    /// Cancels the remaining legs and flattens the position at market.
    pub async fn force_close(&mut self, id: &str, reason: &str) -> Result<()> {
        let index = self
            .positions
            .iter()
            .position(|p| p.id == id && p.is_active())
            .ok_or_else(|| anyhow::anyhow!("No active position {}", id))?;

        let symbol = self.positions[index].symbol.clone();

        let mut order_ids: Vec<String> = self.positions[index]
            .take_profits
            .iter()
            .filter(|leg| !leg.executed)
            .filter_map(|leg| leg.order_id.clone())
            .collect();
        if let Some(stop_id) = self.positions[index].stop_order_id.clone() {
            order_ids.push(stop_id);
        }
        for order_id in order_ids {
            if let Err(e) = self.venue.cancel_order(&order_id, &symbol).await {
                error!("Failed to cancel order {} during close: {}", order_id, e);
            }
        }

        let remaining = self.positions[index].remaining_size();
        let close_side = self.positions[index].side.opposite();
        if remaining > 0.0 {
            self.venue
                .place_market_order(&symbol, close_side, remaining)
                .await?;
        }

        let current_price = self.venue.get_current_price(&symbol).await?;
        let pnl = self.positions[index].pnl_at(current_price, remaining);
        let now = Utc::now();

        let position = &mut self.positions[index];
        position.realized_pnl += pnl;
        position.mark_closed(CloseReason::Forced(reason.to_string()), now);

        info!(
            "Force-closed {} at {:.4} ({}), PnL {:.2}",
            position.id, current_price, reason, pnl
        );
        let event = NotifyEvent::TradeExit {
            symbol: position.symbol.clone(),
            direction: position.side,
            entry_price: position.entry_price,
            exit_price: current_price,
            size: remaining,
            pnl,
            reason: reason.to_string(),
        };
        self.notifier.publish(event);

        Ok(())
    }

    /// Force-closes every Active position; used by the operator shutdown
    /// path. Failures are logged per position and do not stop the sweep.
    pub async fn close_all(&mut self, reason: &str) {
        let ids: Vec<String> = self
            .positions
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.force_close(&id, reason).await {
                error!("Failed to force-close {}: {}", id, e);
            }
        }
    }

    /// Drops Closed positions older than the retention window. Active
    /// positions are never removed regardless of age.
    pub fn cleanup(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let before = self.positions.len();
        self.positions.retain(|position| {
            if !position.is_closed() {
                return true;
            }
            match position.close_time {
                Some(closed) => closed >= cutoff,
                None => true,
            }
        });
        let removed = before - self.positions.len();
        if removed > 0 {
            info!("Cleanup removed {} old closed positions", removed);
        }
        removed
    }
}

/// Stop sits beyond D by a configured fraction of D's price, on the losing
/// side of the trade.
fn stop_loss_level(pattern: &Pattern, buffer_fraction: f64) -> f64 {
    let d = pattern.points.d.price;
    let buffer = d * buffer_fraction;
    match pattern.direction {
        Direction::Bearish => d + buffer,
        Direction::Bullish => d - buffer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZonesConfig;
    use crate::models::{Candle, OrderSide, PatternPoints, Pivot, PivotKind, Ratios};
    use crate::patterns::ZoneCalculator;
    use crate::venue::{OrderHandle, OrderKind, VenueError, VenuePosition};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        next_id: u64,
        price: f64,
        balance: f64,
        open_orders: Vec<OrderHandle>,
        placed: Vec<OrderHandle>,
        cancelled: Vec<String>,
        fail_open_order_calls: usize,
        fail_limit_after: Option<usize>,
        limit_orders_placed: usize,
    }

    struct MockVenue {
        state: Mutex<MockState>,
    }

    impl MockVenue {
        fn new(price: f64, balance: f64) -> Self {
            Self {
                state: Mutex::new(MockState {
                    next_id: 1,
                    price,
                    balance,
                    ..Default::default()
                }),
            }
        }

        fn accept(state: &mut MockState, handle: OrderHandle) -> OrderHandle {
            state.open_orders.push(handle.clone());
            state.placed.push(handle.clone());
            handle
        }

        fn fill_order(&self, order_id: &str) {
            let mut state = self.state.lock().unwrap();
            state.open_orders.retain(|order| order.id != order_id);
        }

        fn placed(&self) -> Vec<OrderHandle> {
            self.state.lock().unwrap().placed.clone()
        }

        fn cancelled(&self) -> Vec<String> {
            self.state.lock().unwrap().cancelled.clone()
        }
    }

    #[async_trait]
    impl Venue for MockVenue {
        fn name(&self) -> &str {
            "mock"
        }

        async fn get_historical_data(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, VenueError> {
            Ok(Vec::new())
        }

        async fn get_current_price(&self, _symbol: &str) -> Result<f64, VenueError> {
            Ok(self.state.lock().unwrap().price)
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            size: f64,
        ) -> Result<OrderHandle, VenueError> {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id.to_string();
            state.next_id += 1;
            // Market orders fill immediately; only record them as placed.
            let handle = OrderHandle {
                id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Market,
                price: None,
                size,
            };
            state.placed.push(handle.clone());
            Ok(handle)
        }

        async fn place_limit_order(
            &self,
            symbol: &str,
            side: OrderSide,
            size: f64,
            price: f64,
        ) -> Result<OrderHandle, VenueError> {
            let mut state = self.state.lock().unwrap();
            if let Some(allowed) = state.fail_limit_after {
                if state.limit_orders_placed >= allowed {
                    return Err(VenueError::Api("mock limit rejection".to_string()));
                }
            }
            state.limit_orders_placed += 1;
            let id = state.next_id.to_string();
            state.next_id += 1;
            let handle = OrderHandle {
                id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Limit,
                price: Some(price),
                size,
            };
            Ok(Self::accept(&mut state, handle))
        }

        async fn place_stop_order(
            &self,
            symbol: &str,
            side: OrderSide,
            size: f64,
            stop_price: f64,
        ) -> Result<OrderHandle, VenueError> {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id.to_string();
            state.next_id += 1;
            let handle = OrderHandle {
                id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Stop,
                price: Some(stop_price),
                size,
            };
            Ok(Self::accept(&mut state, handle))
        }

        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), VenueError> {
            let mut state = self.state.lock().unwrap();
            state.open_orders.retain(|order| order.id != order_id);
            state.cancelled.push(order_id.to_string());
            Ok(())
        }

        async fn get_open_orders(
            &self,
            symbol: Option<&str>,
        ) -> Result<Vec<OrderHandle>, VenueError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_open_order_calls > 0 {
                state.fail_open_order_calls -= 1;
                return Err(VenueError::Network("mock order outage".to_string()));
            }
            Ok(state
                .open_orders
                .iter()
                .filter(|order| symbol.map_or(true, |s| order.symbol == s))
                .cloned()
                .collect())
        }

        async fn get_positions(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<VenuePosition>, VenueError> {
            Ok(Vec::new())
        }

        async fn get_available_balance(&self, _currency: &str) -> Result<f64, VenueError> {
            Ok(self.state.lock().unwrap().balance)
        }

        async fn calculate_position_size(
            &self,
            _symbol: &str,
            risk_amount: f64,
            entry: f64,
            stop: f64,
        ) -> Result<f64, VenueError> {
            let risk_per_unit = (entry - stop).abs();
            if risk_per_unit == 0.0 {
                return Ok(0.0);
            }
            Ok(risk_amount / risk_per_unit)
        }
    }

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

    /// Bearish butterfly with D=100, C=90.
    fn bearish_setup() -> (Pattern, ZoneSet, ConfirmationResult) {
        let points = PatternPoints {
            x: pivot(0, 104.0, PivotKind::High),
            a: pivot(5, 95.0, PivotKind::Low),
            b: pivot(10, 102.0, PivotKind::High),
            c: pivot(15, 90.0, PivotKind::Low),
            d: pivot(20, 100.0, PivotKind::High),
        };
        let pattern = Pattern::new("butterfly", points, Ratios::default(), 92.0).unwrap();
        let zones = ZoneCalculator::new(ZonesConfig::default()).build_zones(&pattern);
        let confirmation = ConfirmationResult {
            candle_close: true,
            trendline_break: true,
            zone_break: true,
            score: 3,
            entry_signal: true,
            direction: OrderSide::Sell,
            entry_price: Some(91.0),
        };
        (pattern, zones, confirmation)
    }

    fn manager(venue: Arc<MockVenue>, max_positions: usize) -> PositionLifecycleManager {
        let (notifier, _receiver) = Notifier::channel();
        let config = RiskConfig {
            max_positions,
            ..RiskConfig::default()
        };
        PositionLifecycleManager::new(venue, notifier, config, "BTCUSDT".to_string())
    }

    #[tokio::test]
    async fn open_places_entry_stop_and_target_legs() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();

        let opened = manager.open(&pattern, &zones, &confirmation).await.unwrap();
        assert!(opened);
        assert_eq!(manager.active_count(), 1);

        let position = &manager.positions()[0];
        assert!(position.id.starts_with("butterfly_"));
        // Stop beyond D against the short: 100 * (1 + 0.0005).
        assert!((position.stop_loss - 100.05).abs() < 1e-9);
        assert_eq!(position.take_profits.len(), 3);
        assert!(position.stop_order_id.is_some());
        assert!(position.entry_order_id.is_some());

        // Even split across the legs.
        let leg_size = position.size / 3.0;
        for leg in &position.take_profits {
            assert!((leg.size - leg_size).abs() < 1e-9);
            assert!(leg.order_id.is_some());
            assert!(!leg.executed);
        }
        // First target is the deepest (C), per the favorable ordering.
        assert_eq!(position.take_profits[0].price, 90.0);

        // Market entry, stop and 3 limit legs hit the venue.
        let placed = venue.placed();
        assert_eq!(placed.len(), 5);
        assert_eq!(placed[0].kind, OrderKind::Market);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert!(placed[1..].iter().all(|o| o.side == OrderSide::Buy));
    }

    #[tokio::test]
    async fn open_rejected_at_capacity_leaves_registry_unchanged() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue, 1);
        let (pattern, zones, confirmation) = bearish_setup();

        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());
        let ids_before: Vec<String> =
            manager.positions().iter().map(|p| p.id.clone()).collect();

        let opened = manager.open(&pattern, &zones, &confirmation).await.unwrap();
        assert!(!opened);

        let ids_after: Vec<String> =
            manager.positions().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids_before, ids_after);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn open_survives_partial_leg_failure() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        venue.state.lock().unwrap().fail_limit_after = Some(1);
        let mut manager = manager(venue, 3);
        let (pattern, zones, confirmation) = bearish_setup();

        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());
        let position = &manager.positions()[0];
        assert_eq!(position.take_profits.len(), 3);
        assert!(position.take_profits[0].order_id.is_some());
        assert!(position.take_profits[1].order_id.is_none());
        assert!(position.take_profits[2].order_id.is_none());
    }

    #[tokio::test]
    async fn monitor_realizes_take_profit_fills() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        let first_leg = manager.positions()[0].take_profits[0].clone();
        venue.fill_order(first_leg.order_id.as_deref().unwrap());

        manager.monitor().await;

        let position = &manager.positions()[0];
        assert!(position.take_profits[0].executed);
        assert!(position.is_active());
        // Short from 91 to the 90 target.
        let expected = (91.0 - 90.0) * first_leg.size;
        assert!((position.realized_pnl - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn monitor_closes_on_target_exhaustion_and_pulls_stop() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        let leg_ids: Vec<String> = manager.positions()[0]
            .take_profits
            .iter()
            .filter_map(|leg| leg.order_id.clone())
            .collect();
        for id in &leg_ids {
            venue.fill_order(id);
        }

        manager.monitor().await;

        let position = &manager.positions()[0];
        assert!(position.is_closed());
        assert_eq!(position.close_reason, Some(CloseReason::TargetsFilled));
        let stop_id = position.stop_order_id.clone().unwrap();
        assert!(venue.cancelled().contains(&stop_id));
    }

    #[tokio::test]
    async fn monitor_stop_fill_closes_and_cancels_legs() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        let stop_id = manager.positions()[0].stop_order_id.clone().unwrap();
        venue.fill_order(&stop_id);

        manager.monitor().await;

        let position = &manager.positions()[0];
        assert!(position.is_closed());
        assert_eq!(position.close_reason, Some(CloseReason::StopLoss));
        // Full size realized at the stop: short from 91 stopped at 100.05.
        let expected = (91.0 - 100.05) * position.size;
        assert!((position.realized_pnl - expected).abs() < 1e-6);
        // Every unexecuted leg was cancelled.
        let cancelled = venue.cancelled();
        for leg in &position.take_profits {
            assert!(cancelled.contains(leg.order_id.as_ref().unwrap()));
        }
    }

    #[tokio::test]
    async fn monitor_isolates_per_position_failures() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        // Fill the second position's stop and make the first position's
        // order lookup fail: the fault must not stop the sweep.
        let stop_id = manager.positions()[1].stop_order_id.clone().unwrap();
        venue.fill_order(&stop_id);
        venue.state.lock().unwrap().fail_open_order_calls = 1;

        manager.monitor().await;

        assert!(manager.positions()[0].is_active());
        assert!(manager.positions()[1].is_closed());
        assert_eq!(
            manager.positions()[1].close_reason,
            Some(CloseReason::StopLoss)
        );
    }

    #[tokio::test]
    async fn force_close_flattens_remaining_size() {
        let venue = Arc::new(MockVenue::new(95.0, 10_000.0));
        let mut manager = manager(venue.clone(), 3);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        let id = manager.positions()[0].id.clone();
        let size = manager.positions()[0].size;
        manager.force_close(&id, "operator shutdown").await.unwrap();

        let position = manager.get(&id).unwrap();
        assert!(position.is_closed());
        assert_eq!(
            position.close_reason,
            Some(CloseReason::Forced("operator shutdown".to_string()))
        );

        // A buy-back market order for the full remaining size.
        let placed = venue.placed();
        let closing = placed.last().unwrap();
        assert_eq!(closing.kind, OrderKind::Market);
        assert_eq!(closing.side, OrderSide::Buy);
        assert!((closing.size - size).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_closed_positions() {
        let venue = Arc::new(MockVenue::new(91.0, 10_000.0));
        let mut manager = manager(venue.clone(), 5);
        let (pattern, zones, confirmation) = bearish_setup();
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());
        assert!(manager.open(&pattern, &zones, &confirmation).await.unwrap());

        let now = Utc::now();
        let old = now - Duration::days(10);
        manager.positions[0].mark_closed(CloseReason::StopLoss, old);

        let removed = manager.cleanup(now, Duration::days(7));
        assert_eq!(removed, 1);
        assert_eq!(manager.positions().len(), 1);
        assert!(manager.positions()[0].is_active());

        // Second pass with the same cutoff removes nothing further.
        assert_eq!(manager.cleanup(now, Duration::days(7)), 0);

        // An ancient Active position is exempt.
        manager.positions[0].entry_time = now - Duration::days(30);
        assert_eq!(manager.cleanup(now, Duration::days(7)), 0);
        assert_eq!(manager.active_count(), 1);
    }
}
