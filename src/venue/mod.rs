// src/venue/mod.rs
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{Candle, OrderSide};

pub mod binance;
pub mod bybit;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub testnet: bool,
}

impl VenueConfig {
    pub fn from_env(venue_name: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        let env_prefix = venue_name.to_uppercase();

        let api_key = std::env::var(format!("{}_API_KEY", env_prefix))
            .map_err(|_| anyhow::anyhow!("{}_API_KEY environment variable not set", env_prefix))?;
        let api_secret = std::env::var(format!("{}_API_SECRET", env_prefix)).map_err(|_| {
            anyhow::anyhow!("{}_API_SECRET environment variable not set", env_prefix)
        })?;

        let base_url = std::env::var(format!("{}_BASE_URL", env_prefix)).unwrap_or_else(|_| {
            match venue_name.to_lowercase().as_str() {
                "binance" => "https://api.binance.com".to_string(),
                "bybit" => "https://api.bybit.com".to_string(),
                _ => String::new(),
            }
        });

        let testnet = std::env::var(format!("{}_TESTNET", env_prefix))
            .map(|value| value.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            name: venue_name.to_string(),
            api_key,
            api_secret,
            base_url,
            testnet,
        })
    }

    /// Fills credentials from the environment when the config file carries
    /// only the venue name.
    pub fn resolve(mut self) -> Result<Self> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            let from_env = Self::from_env(&self.name)?;
            if self.api_key.is_empty() {
                self.api_key = from_env.api_key;
            }
            if self.api_secret.is_empty() {
                self.api_secret = from_env.api_secret;
            }
            if self.base_url.is_empty() {
                self.base_url = from_env.base_url;
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "Market"),
            OrderKind::Limit => write!(f, "Limit"),
            OrderKind::Stop => write!(f, "Stop"),
        }
    }
}

/// Identifier and echo of an order accepted by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub size: f64,
}

/// Venue-side view of an open position, used for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for VenueError {
    fn from(error: reqwest::Error) -> Self {
        VenueError::Network(error.to_string())
    }
}

/// The market venue collaborator. Implementations wrap one exchange's REST
/// API; the core is venue-agnostic and holds this behind a trait object.
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, VenueError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderHandle, VenueError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
    ) -> Result<OrderHandle, VenueError>;

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        stop_price: f64,
    ) -> Result<OrderHandle, VenueError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), VenueError>;

    async fn get_open_orders(&self, symbol: Option<&str>)
        -> Result<Vec<OrderHandle>, VenueError>;

    async fn get_positions(&self, symbol: Option<&str>)
        -> Result<Vec<VenuePosition>, VenueError>;

    async fn get_available_balance(&self, currency: &str) -> Result<f64, VenueError>;

    /// Risk-based sizing with the venue's lot and precision constraints
    /// applied.
    async fn calculate_position_size(
        &self,
        symbol: &str,
        risk_amount: f64,
        entry: f64,
        stop: f64,
    ) -> Result<f64, VenueError>;
}

/// Selects the concrete venue once, at construction.
pub fn create_venue(config: VenueConfig) -> Result<Box<dyn Venue>> {
    let config = config.resolve()?;
    match config.name.to_lowercase().as_str() {
        "binance" => Ok(Box::new(binance::BinanceVenue::new(config)?)),
        "bybit" => Ok(Box::new(bybit::BybitVenue::new(config)?)),
        other => Err(anyhow::anyhow!("Unsupported venue: {}", other)),
    }
}
