// src/venue/binance.rs
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::*;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{OrderHandle, OrderKind, Venue, VenueConfig, VenueError, VenuePosition};
use crate::models::{Candle, OrderSide};

/// Binance spot REST connector.
#[derive(Debug, Clone)]
pub struct BinanceVenue {
    config: VenueConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct BinancePrice {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderAck {
    order_id: u64,
    #[allow(dead_code)]
    symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOpenOrder {
    order_id: u64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: String,
    orig_qty: String,
}

#[derive(Debug, Deserialize)]
struct BinanceBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    balances: Vec<BinanceBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceSymbolFilter {
    filter_type: String,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    max_qty: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BinanceSymbolInfo {
    #[allow(dead_code)]
    symbol: String,
    filters: Vec<BinanceSymbolFilter>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbolInfo>,
}

impl BinanceVenue {
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

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn map_error(response: reqwest::Response) -> VenueError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<BinanceErrorBody>(&body)
            .map(|e| format!("{} ({})", e.msg, e.code))
            .unwrap_or(body);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VenueError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS => VenueError::RateLimit(message),
            StatusCode::BAD_REQUEST => VenueError::InvalidOrder(message),
            StatusCode::NOT_FOUND => VenueError::OrderNotFound(message),
            _ => VenueError::Api(format!("{}: {}", status, message)),
        }
    }

    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, VenueError> {
        let url = format!("{}{}?{}", self.config.base_url, endpoint, query);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: &str,
    ) -> Result<T, VenueError> {
        let query = if query.is_empty() {
            format!("timestamp={}", Self::timestamp_ms())
        } else {
            format!("{}&timestamp={}", query, Self::timestamp_ms())
        };
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.base_url, endpoint, query, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| VenueError::Parse(e.to_string()))
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        size: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<OrderHandle, VenueError> {
        let side_param = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let type_param = match kind {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP_LOSS",
        };

        let client_order_id = uuid::Uuid::new_v4().simple().to_string();
        let mut query = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            symbol, side_param, type_param, size, client_order_id
        );
        if let Some(price) = price {
            query.push_str(&format!("&price={}&timeInForce=GTC", price));
        }
        if let Some(stop_price) = stop_price {
            query.push_str(&format!("&stopPrice={}", stop_price));
        }

        let ack: BinanceOrderAck = self
            .signed_request(reqwest::Method::POST, "/api/v3/order", &query)
            .await?;

        debug!(
            "Binance accepted {} {} order {} for {} (size {})",
            side, kind, ack.order_id, symbol, size
        );

        Ok(OrderHandle {
            id: ack.order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            kind,
            price: price.or(stop_price),
            size,
        })
    }

    async fn lot_size_filter(
        &self,
        symbol: &str,
    ) -> Result<(Option<f64>, Option<f64>, Option<f64>), VenueError> {
        let info: BinanceExchangeInfo = self
            .public_get("/api/v3/exchangeInfo", &format!("symbol={}", symbol))
            .await?;

        let symbol_info = info
            .symbols
            .into_iter()
            .next()
            .ok_or_else(|| VenueError::Api(format!("No exchange info for {}", symbol)))?;

        for filter in symbol_info.filters {
            if filter.filter_type == "LOT_SIZE" {
                let parse = |value: Option<String>| {
                    value.and_then(|v| v.parse::<f64>().ok()).filter(|v| *v > 0.0)
                };
                return Ok((
                    parse(filter.min_qty),
                    parse(filter.max_qty),
                    parse(filter.step_size),
                ));
            }
        }
        Ok((None, None, None))
    }
}

fn parse_price(value: &str) -> Result<f64, VenueError> {
    value
        .parse::<f64>()
        .map_err(|e| VenueError::Parse(format!("bad decimal '{}': {}", value, e)))
}

#[async_trait]
impl Venue for BinanceVenue {
    fn name(&self) -> &str {
        "binance"
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let query = format!("symbol={}&interval={}&limit={}", symbol, timeframe, limit);
        let rows: Vec<Vec<serde_json::Value>> =
            self.public_get("/api/v3/klines", &query).await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 6 {
                return Err(VenueError::Parse("short kline row".to_string()));
            }
            let open_time = row[0]
                .as_i64()
                .ok_or_else(|| VenueError::Parse("kline open time".to_string()))?;
            let timestamp = Utc
                .timestamp_millis_opt(open_time)
                .single()
                .ok_or_else(|| VenueError::Parse("kline timestamp".to_string()))?;
            let field = |i: usize| -> Result<f64, VenueError> {
                row[i]
                    .as_str()
                    .ok_or_else(|| VenueError::Parse(format!("kline field {}", i)))
                    .and_then(parse_price)
            };
            candles.push(Candle {
                timestamp,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            });
        }
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, VenueError> {
        let ticker: BinancePrice = self
            .public_get("/api/v3/ticker/price", &format!("symbol={}", symbol))
            .await?;
        parse_price(&ticker.price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderHandle, VenueError> {
        self.submit_order(symbol, side, OrderKind::Market, size, None, None)
            .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
    ) -> Result<OrderHandle, VenueError> {
        self.submit_order(symbol, side, OrderKind::Limit, size, Some(price), None)
            .await
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        stop_price: f64,
    ) -> Result<OrderHandle, VenueError> {
        self.submit_order(symbol, side, OrderKind::Stop, size, None, Some(stop_price))
            .await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), VenueError> {
        let query = format!("symbol={}&orderId={}", symbol, order_id);
        let _: serde_json::Value = self
            .signed_request(reqwest::Method::DELETE, "/api/v3/order", &query)
            .await?;
        info!("Cancelled order {} on {}", order_id, symbol);
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderHandle>, VenueError> {
        let query = match symbol {
            Some(symbol) => format!("symbol={}", symbol),
            None => String::new(),
        };
        let orders: Vec<BinanceOpenOrder> = self
            .signed_request(reqwest::Method::GET, "/api/v3/openOrders", &query)
            .await?;

        orders
            .into_iter()
            .map(|order| {
                let side = match order.side.as_str() {
                    "BUY" => OrderSide::Buy,
                    "SELL" => OrderSide::Sell,
                    other => return Err(VenueError::Parse(format!("order side '{}'", other))),
                };
                let kind = match order.order_type.as_str() {
                    "LIMIT" => OrderKind::Limit,
                    "MARKET" => OrderKind::Market,
                    _ => OrderKind::Stop,
                };
                Ok(OrderHandle {
                    id: order.order_id.to_string(),
                    symbol: order.symbol,
                    side,
                    kind,
                    price: order.price.parse::<f64>().ok().filter(|p| *p > 0.0),
                    size: parse_price(&order.orig_qty)?,
                })
            })
            .collect()
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, VenueError> {
        // Spot has no native position objects; surface non-quote balances
        // the way a position report would read.
        let account: BinanceAccount = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", "")
            .await?;

        let mut positions = Vec::new();
        for balance in account.balances {
            let size = parse_price(&balance.free)?;
            if size <= 0.0 || balance.asset == "USDT" {
                continue;
            }
            let pair = format!("{}USDT", balance.asset);
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
        Ok(positions)
    }

    async fn get_available_balance(&self, currency: &str) -> Result<f64, VenueError> {
        let account: BinanceAccount = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", "")
            .await?;
        account
            .balances
            .iter()
            .find(|balance| balance.asset == currency)
            .map(|balance| parse_price(&balance.free))
            .unwrap_or(Ok(0.0))
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

        let (min_qty, max_qty, step_size) = self.lot_size_filter(symbol).await?;
        if let Some(step) = step_size {
            quantity = (quantity / step).floor() * step;
        }
        if let Some(max) = max_qty {
            quantity = quantity.min(max);
        }
        if let Some(min) = min_qty {
            if quantity < min {
                return Ok(0.0);
            }
        }
        Ok(quantity)
    }
}
