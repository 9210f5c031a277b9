// src/notify/mod.rs
use chrono::Utc;
use log::*;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::env;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::models::OrderSide;

/// Outbound events the core emits. Plain data records; formatting and
/// delivery live entirely in the drain worker.
#[derive(Debug, Clone, Serialize)]
pub enum NotifyEvent {
    PatternDetected {
        pattern_type: String,
        symbol: String,
        points: String,
        confidence: f64,
        direction: String,
    },
    EntryZoneDetected {
        symbol: String,
        zone: String,
        price: f64,
        direction: OrderSide,
    },
    TradeEntry {
        symbol: String,
        direction: OrderSide,
        price: f64,
        size: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
    },
    TradeExit {
        symbol: String,
        direction: OrderSide,
        entry_price: f64,
        exit_price: f64,
        size: f64,
        pnl: f64,
        reason: String,
    },
    StatusReport {
        status: String,
        active_positions: usize,
        daily_pnl: f64,
    },
    Error {
        context: String,
        message: String,
    },
}

/// Cloneable handle the core appends events through. Publishing never blocks
/// and never fails the caller; a closed channel only logs.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: UnboundedSender<NotifyEvent>,
}

impl Notifier {
    pub fn channel() -> (Self, UnboundedReceiver<NotifyEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, event: NotifyEvent) {
        if self.sender.send(event).is_err() {
            warn!("Notification channel closed, dropping event");
        }
    }
}

/// Drains the event queue into the Telegram Bot API. Disabled cleanly when
/// credentials are absent; delivery failures are logged and swallowed so the
/// core never depends on delivery succeeding.
pub struct TelegramNotifier {
    client: Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
    enabled: bool,
}

impl TelegramNotifier {
    pub fn from_env() -> Self {
        let bot_token = env::var("TELEGRAM_BOT_TOKEN").ok();
        let chat_id = env::var("TELEGRAM_CHAT_ID").ok();
        let enabled = bot_token.is_some() && chat_id.is_some();

        if enabled {
            info!("Telegram notifier initialized");
        } else {
            warn!("Telegram notifier disabled - missing TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID");
        }

        Self {
            client: Client::new(),
            bot_token,
            chat_id,
            enabled,
        }
    }

    pub fn spawn(self, receiver: UnboundedReceiver<NotifyEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    async fn run(self, mut receiver: UnboundedReceiver<NotifyEvent>) {
        while let Some(event) = receiver.recv().await {
            let message = format_event(&event);
            debug!("Delivering notification: {:?}", event);
            if let Err(e) = self.send_message(&message).await {
                error!("Failed to deliver Telegram notification: {}", e);
            }
        }
    }

    async fn send_message(&self, message: &str) -> Result<(), reqwest::Error> {
        if !self.enabled {
            return Ok(());
        }
        let bot_token = self.bot_token.as_deref().unwrap_or_default();
        let chat_id = self.chat_id.as_deref().unwrap_or_default();

        let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
        let payload = json!({
            "chat_id": chat_id,
            "text": message,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            error!(
                "Telegram rejected notification: {}",
                response.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }
}

pub fn format_event(event: &NotifyEvent) -> String {
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    match event {
        NotifyEvent::PatternDetected {
            pattern_type,
            symbol,
            points,
            confidence,
            direction,
        } => format!(
            "*PATTERN DETECTED*\nType: {}\nSymbol: {}\nPoints: {}\nDirection: {}\nConfidence: {:.1}%\n{}",
            pattern_type, symbol, points, direction, confidence, stamp
        ),
        NotifyEvent::EntryZoneDetected {
            symbol,
            zone,
            price,
            direction,
        } => format!(
            "*ENTRY ZONE DETECTED*\nSymbol: {}\nZone: {}\nPrice: {:.4}\nDirection: {}\n{}",
            symbol, zone, price, direction, stamp
        ),
        NotifyEvent::TradeEntry {
            symbol,
            direction,
            price,
            size,
            stop_loss,
            take_profit,
        } => {
            let tp = take_profit
                .map(|tp| format!("{:.4}", tp))
                .unwrap_or_else(|| "-".to_string());
            format!(
                "*TRADE ENTRY*\nSymbol: {}\nDirection: {}\nPrice: {:.4}\nSize: {:.6}\nStop: {:.4}\nTarget: {}\n{}",
                symbol, direction, price, size, stop_loss, tp, stamp
            )
        }
        NotifyEvent::TradeExit {
            symbol,
            direction,
            entry_price,
            exit_price,
            size,
            pnl,
            reason,
        } => format!(
            "*TRADE EXIT*\nSymbol: {}\nDirection: {}\nEntry: {:.4}\nExit: {:.4}\nSize: {:.6}\nPnL: {:.2}\nReason: {}\n{}",
            symbol, direction, entry_price, exit_price, size, pnl, reason, stamp
        ),
        NotifyEvent::StatusReport {
            status,
            active_positions,
            daily_pnl,
        } => format!(
            "*BOT STATUS*\nStatus: {}\nActive positions: {}\nDaily PnL: {:.2}\n{}",
            status, active_positions, daily_pnl, stamp
        ),
        NotifyEvent::Error { context, message } => format!(
            "*BOT ERROR*\nContext: {}\nDetails: {}\n{}",
            context, message, stamp
        ),
    }
}
