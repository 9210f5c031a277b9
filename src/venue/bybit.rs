// src/venue/bybit.rs
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::*;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{OrderHandle, OrderKind, Venue, VenueConfig, VenueError, VenuePosition};
use crate::models::{Candle, OrderSide};

const RECV_WINDOW: &str = "5000";

/// Bybit v5 REST connector (spot category).
#[derive(Debug, Clone)]
pub struct BybitVenue {
    config: VenueConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitEnvelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BybitKlineResult {
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct BybitTickerResult {
    list: Vec<BybitTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOpenOrder {
    order_id: String,
    symbol: String,
    side: String,
    order_type: String,
    price: String,
    qty: String,
    #[serde(default)]
    trigger_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BybitOpenOrdersResult {
    list: Vec<BybitOpenOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitCoinBalance {
    coin: String,
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct BybitWalletAccount {
    coin: Vec<BybitCoinBalance>,
}

#[derive(Debug, Deserialize)]
struct BybitWalletResult {
    list: Vec<BybitWalletAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitLotSizeFilter {
    min_order_qty: String,
    max_order_qty: String,
    #[serde(default)]
    base_precision: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitInstrument {
    lot_size_filter: BybitLotSizeFilter,
}

#[derive(Debug, Deserialize)]
struct BybitInstrumentsResult {
    list: Vec<BybitInstrument>,
}

impl BybitVenue {
    pub fn new(config: VenueConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }

    /// v5 signature: HMAC-SHA256 over timestamp + key + recv window +
    /// payload (query string for GET, JSON body for POST).
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(
            format!(
                "{}{}{}{}",
                timestamp, self.config.api_key, RECV_WINDOW, payload
            )
            .as_bytes(),
        );
        hex::encode(mac.finalize().into_bytes())
    }

    fn unwrap_envelope<T>(envelope: BybitEnvelope<T>) -> Result<T, VenueError> {
        match envelope.ret_code {
            0 => envelope
                .result
                .ok_or_else(|| VenueError::Parse("missing result payload".to_string())),
            10003 | 10004 | 10005 => Err(VenueError::Auth(envelope.ret_msg)),
            10006 => Err(VenueError::RateLimit(envelope.ret_msg)),
            110007 => Err(VenueError::InsufficientFunds(envelope.ret_msg)),
            110001 => Err(VenueError::OrderNotFound(envelope.ret_msg)),
            _ => Err(VenueError::Api(format!(
                "{} ({})",
                envelope.ret_msg, envelope.ret_code
            ))),
        }
    }

    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, VenueError> {
        let url = format!("{}{}?{}", self.config.base_url, endpoint, query);
        let envelope: BybitEnvelope<T> = self
            .client
            .get(&url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        Self::unwrap_envelope(envelope)
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, VenueError> {
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(timestamp, query);
        let url = format!("{}{}?{}", self.config.base_url, endpoint, query);

        let envelope: BybitEnvelope<T> = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        Self::unwrap_envelope(envelope)
    }

    async fn signed_post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, VenueError> {
        let timestamp = Self::timestamp_ms();
        let payload = body.to_string();
        let signature = self.sign(timestamp, &payload);
        let url = format!("{}{}", self.config.base_url, endpoint);

        let envelope: BybitEnvelope<T> = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))?;
        Self::unwrap_envelope(envelope)
    }

    /// Maps the bot's timeframe notation onto Bybit interval codes.
    fn map_interval(timeframe: &str) -> &str {
        match timeframe {
            "1m" => "1",
            "5m" => "5",
            "15m" => "15",
            "30m" => "30",
            "1h" => "60",
            "4h" => "240",
            "1d" => "D",
            other => other,
        }
    }
}

fn parse_decimal(value: &str) -> Result<f64, VenueError> {
    value
        .parse::<f64>()
        .map_err(|e| VenueError::Parse(format!("bad decimal '{}': {}", value, e)))
}

#[async_trait]
impl Venue for BybitVenue {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let query = format!(
            "category=spot&symbol={}&interval={}&limit={}",
            symbol,
            Self::map_interval(timeframe),
            limit
        );
        let result: BybitKlineResult = self.public_get("/v5/market/kline", &query).await?;

        // Bybit lists newest first.
        let mut candles = Vec::with_capacity(result.list.len());
        for row in result.list.iter().rev() {
            if row.len() < 6 {
                return Err(VenueError::Parse("short kline row".to_string()));
            }
            let start_ms = row[0]
                .parse::<i64>()
                .map_err(|e| VenueError::Parse(format!("kline start: {}", e)))?;
            let timestamp = Utc
                .timestamp_millis_opt(start_ms)
                .single()
                .ok_or_else(|| VenueError::Parse("kline timestamp".to_string()))?;
            candles.push(Candle {
                timestamp,
                open: parse_decimal(&row[1])?,
                high: parse_decimal(&row[2])?,
                low: parse_decimal(&row[3])?,
                close: parse_decimal(&row[4])?,
                volume: parse_decimal(&row[5])?,
            });
        }
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, VenueError> {
        let query = format!("category=spot&symbol={}", symbol);
        let result: BybitTickerResult = self.public_get("/v5/market/tickers", &query).await?;
        let ticker = result
            .list
            .first()
            .ok_or_else(|| VenueError::Api(format!("No ticker for {}", symbol)))?;
        parse_decimal(&ticker.last_price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderHandle, VenueError> {
        let body = json!({
            "category": "spot",
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Market",
            "qty": size.to_string(),
        });
        let result: BybitOrderResult = self.signed_post("/v5/order/create", body).await?;
        debug!("Bybit accepted market order {} for {}", result.order_id, symbol);
        Ok(OrderHandle {
            id: result.order_id,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            price: None,
            size,
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
    ) -> Result<OrderHandle, VenueError> {
        let body = json!({
            "category": "spot",
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Limit",
            "qty": size.to_string(),
            "price": price.to_string(),
            "timeInForce": "GTC",
        });
        let result: BybitOrderResult = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderHandle {
            id: result.order_id,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            price: Some(price),
            size,
        })
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        stop_price: f64,
    ) -> Result<OrderHandle, VenueError> {
        let body = json!({
            "category": "spot",
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Market",
            "qty": size.to_string(),
            "triggerPrice": stop_price.to_string(),
            "orderFilter": "StopOrder",
        });
        let result: BybitOrderResult = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderHandle {
            id: result.order_id,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Stop,
            price: Some(stop_price),
            size,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), VenueError> {
        let body = json!({
            "category": "spot",
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: BybitOrderResult = self.signed_post("/v5/order/cancel", body).await?;
        info!("Cancelled order {} on {}", order_id, symbol);
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderHandle>, VenueError> {
        let query = match symbol {
            Some(symbol) => format!("category=spot&symbol={}", symbol),
            None => "category=spot".to_string(),
        };
        let result: BybitOpenOrdersResult =
            self.signed_get("/v5/order/realtime", &query).await?;

        result
            .list
            .into_iter()
            .map(|order| {
                let side = match order.side.as_str() {
                    "Buy" => OrderSide::Buy,
                    "Sell" => OrderSide::Sell,
                    other => return Err(VenueError::Parse(format!("order side '{}'", other))),
                };
                let kind = if order.trigger_price.is_some() {
                    OrderKind::Stop
                } else if order.order_type == "Limit" {
                    OrderKind::Limit
                } else {
                    OrderKind::Market
                };
                Ok(OrderHandle {
                    id: order.order_id,
                    symbol: order.symbol,
                    side,
                    kind,
                    price: order.price.parse::<f64>().ok().filter(|p| *p > 0.0),
                    size: parse_decimal(&order.qty)?,
                })
            })
            .collect()
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, VenueError> {
        let result: BybitWalletResult = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let mut positions = Vec::new();
        for account in result.list {
            for coin in account.coin {
                let size = parse_decimal(&coin.wallet_balance)?;
                if size <= 0.0 || coin.coin == "USDT" {
                    continue;
                }
                let pair = format!("{}USDT", coin.coin);
                if let Some(wanted) = symbol {
                    if pair != wanted {
                        continue;
                    }
                }
                positions.push(VenuePosition {
                    symbol: pair,
                    side: OrderSide::Buy,
                    size,
                    entry_price: None,
                    unrealized_pnl: None,
                });
            }
        }
        Ok(positions)
    }

    async fn get_available_balance(&self, currency: &str) -> Result<f64, VenueError> {
        let result: BybitWalletResult = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        for account in result.list {
            for coin in account.coin {
                if coin.coin == currency {
                    return parse_decimal(&coin.wallet_balance);
                }
            }
        }
        Ok(0.0)
    }

    async fn calculate_position_size(
        &self,
        symbol: &str,
        risk_amount: f64,
        entry: f64,
        stop: f64,
    ) -> Result<f64, VenueError> {
        let risk_per_unit = (entry - stop).abs();
        if risk_per_unit == 0.0 {
            return Ok(0.0);
        }
        let mut quantity = risk_amount / risk_per_unit;

        let query = format!("category=spot&symbol={}", symbol);
        let result: BybitInstrumentsResult = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;
        if let Some(instrument) = result.list.first() {
            let filter = &instrument.lot_size_filter;
            if let Some(precision) = filter
                .base_precision
                .as_deref()
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0)
            {
                quantity = (quantity / precision).floor() * precision;
            }
            let max_qty = parse_decimal(&filter.max_order_qty)?;
            if max_qty > 0.0 {
                quantity = quantity.min(max_qty);
            }
            let min_qty = parse_decimal(&filter.min_order_qty)?;
            if quantity < min_qty {
                return Ok(0.0);
            }
        }
        Ok(quantity)
    }
}
