pub mod config;
pub mod confirmation;
pub mod models;
pub mod notify;
pub mod patterns;
pub mod positions;
pub mod venue;

// Re-export commonly used types
pub use crate::config::{load_config, Config, PatternConfig, PatternTemplate, RiskConfig};
pub use crate::confirmation::ConfirmationPipeline;
pub use crate::models::{
    Candle, ConfirmationResult, Direction, OrderSide, Pattern, Pivot, PivotKind, Position,
    PositionStatus, ZoneSet,
};
pub use crate::notify::{Notifier, NotifyEvent, TelegramNotifier};
pub use crate::patterns::{PatternMatcher, PatternStore, PivotScanner, ZoneCalculator};
pub use crate::positions::PositionLifecycleManager;
pub use crate::venue::{create_venue, Venue, VenueConfig, VenueError};

use log::info;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,harmonic_trader=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Logging initialized");
}
