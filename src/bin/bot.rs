// src/bin/bot.rs
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use harmonic_trader::{
    config::{load_config, Config},
    confirmation::ConfirmationPipeline,
    models::{Direction, OrderSide},
    notify::{Notifier, NotifyEvent, TelegramNotifier},
    patterns::{PatternMatcher, PatternStore, ZoneCalculator},
    positions::PositionLifecycleManager,
    setup_logging,
    venue::{create_venue, Venue},
};
use log::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::time;

#[derive(Parser)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection and trading loops
    Run {
        /// Path to configuration file
        #[clap(short, long, default_value = "config/bot.toml")]
        config: PathBuf,

        /// Analyze and log without placing orders
        #[clap(long)]
        dry_run: bool,

        /// Force-close every active position on shutdown
        #[clap(long)]
        close_on_exit: bool,
    },

    /// Report open venue positions
    Monitor {
        /// Path to configuration file
        #[clap(short, long, default_value = "config/bot.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging();

    match args.command {
        Commands::Run {
            config,
            dry_run,
            close_on_exit,
        } => run(config, dry_run, close_on_exit).await?,
        Commands::Monitor { config } => monitor_venue(config).await?,
    }

    Ok(())
}

async fn run(config_path: PathBuf, dry_run: bool, close_on_exit: bool) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let symbol = config.general.symbol.clone();

    info!(
        "Starting harmonic trader for {} in {} mode",
        symbol,
        if dry_run { "dry-run" } else { "live" }
    );

    // No core operation proceeds without a working venue.
    let venue: Arc<dyn Venue> = Arc::from(create_venue(config.venue.clone())?);
    venue
        .get_current_price(&symbol)
        .await
        .with_context(|| format!("venue connectivity check failed for {}", symbol))?;
    info!("Connected to {} venue", venue.name());

    let (notifier, receiver) = Notifier::channel();
    let delivery = TelegramNotifier::from_env().spawn(receiver);

    let matcher = PatternMatcher::new(config.pattern.clone());
    let zone_calculator = ZoneCalculator::new(config.zones.clone());
    let pipeline = ConfirmationPipeline::new();
    let store = Arc::new(Mutex::new(PatternStore::new()));
    let manager = Arc::new(Mutex::new(PositionLifecycleManager::new(
        venue.clone(),
        notifier.clone(),
        config.risk.clone(),
        symbol.clone(),
    )));

    notifier.publish(NotifyEvent::StatusReport {
        status: "started".to_string(),
        active_positions: 0,
        daily_pnl: 0.0,
    });

    let mut analysis_interval =
        time::interval(StdDuration::from_secs(config.general.analysis_interval_secs));
    let mut monitor_interval =
        time::interval(StdDuration::from_secs(config.general.monitor_interval_secs));
    let mut status_interval =
        time::interval(StdDuration::from_secs(config.general.status_interval_secs));
    let mut cleanup_interval =
        time::interval(StdDuration::from_secs(config.general.cleanup_interval_secs));

    loop {
        tokio::select! {
            _ = analysis_interval.tick() => {
                if let Err(e) = analyze_market(
                    &venue,
                    &config,
                    &matcher,
                    &zone_calculator,
                    &pipeline,
                    &store,
                    &manager,
                    &notifier,
                    dry_run,
                )
                .await
                {
                    error!("Market analysis failed: {}", e);
                    notifier.publish(NotifyEvent::Error {
                        context: "market analysis".to_string(),
                        message: e.to_string(),
                    });
                }
            }
            _ = monitor_interval.tick() => {
                if !dry_run {
                    manager.lock().await.monitor().await;
                }
            }
            _ = status_interval.tick() => {
                let manager = manager.lock().await;
                notifier.publish(NotifyEvent::StatusReport {
                    status: "running".to_string(),
                    active_positions: manager.active_count(),
                    daily_pnl: manager.daily_pnl(Utc::now()),
                });
            }
            _ = cleanup_interval.tick() => {
                let now = Utc::now();
                {
                    let mut store = store.lock().await;
                    store.expire_zones(now, Duration::hours(config.retention.zone_hours));
                    store.cleanup(now, Duration::hours(config.retention.pattern_hours));
                }
                manager
                    .lock()
                    .await
                    .cleanup(now, Duration::days(config.retention.closed_position_days));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                let mut manager = manager.lock().await;
                if close_on_exit && !dry_run {
                    manager.close_all("operator shutdown").await;
                }
                notifier.publish(NotifyEvent::StatusReport {
                    status: "stopped".to_string(),
                    active_positions: manager.active_count(),
                    daily_pnl: manager.daily_pnl(Utc::now()),
                });
                break;
            }
        }
    }

    // Drop every Notifier clone so the queue drains and the delivery
    // worker exits.
    drop(manager);
    drop(notifier);
    let _ = delivery.await;
    Ok(())
}

/// One analysis cycle: fetch both timeframes, scan for patterns, derive
/// zones, confirm, and hand confirmed entries to the lifecycle manager.
#[allow(clippy::too_many_arguments)]
async fn analyze_market(
    venue: &Arc<dyn Venue>,
    config: &Config,
    matcher: &PatternMatcher,
    zone_calculator: &ZoneCalculator,
    pipeline: &ConfirmationPipeline,
    store: &Arc<Mutex<PatternStore>>,
    manager: &Arc<Mutex<PositionLifecycleManager>>,
    notifier: &Notifier,
    dry_run: bool,
) -> Result<()> {
    let symbol = &config.general.symbol;
    debug!("Starting market analysis for {}", symbol);

    let coarse = venue
        .get_historical_data(symbol, &config.general.timeframe_main, config.general.coarse_history)
        .await?;
    let fine = venue
        .get_historical_data(symbol, &config.general.timeframe_entry, config.general.fine_history)
        .await?;

    if coarse.is_empty() || fine.is_empty() {
        debug!("Insufficient data for analysis, skipping cycle");
        return Ok(());
    }

    let patterns = matcher.detect(&coarse);
    debug!("Detected {} candidate patterns", patterns.len());

    for pattern in patterns {
        let key = pattern.dedup_key();
        if store.lock().await.is_known(&key) {
            continue;
        }

        let mut zones = zone_calculator.build_zones(&pattern);
        zones.trendline = zone_calculator.build_trendline(&coarse, &pattern);

        notifier.publish(NotifyEvent::PatternDetected {
            pattern_type: pattern.name.clone(),
            symbol: symbol.clone(),
            points: format!(
                "X:{:.4} A:{:.4} B:{:.4} C:{:.4} D:{:.4}",
                pattern.points.x.price,
                pattern.points.a.price,
                pattern.points.b.price,
                pattern.points.c.price,
                pattern.points.d.price
            ),
            confidence: pattern.confidence,
            direction: pattern.direction.to_string(),
        });

        let confirmation = pipeline.confirm(&coarse, &fine, &pattern, &zones);
        store
            .lock()
            .await
            .insert(pattern.clone(), zones.clone(), Utc::now());

        if confirmation.entry_signal {
            if dry_run {
                info!(
                    "[DRY RUN] Would open {} position for {} at {:?}",
                    confirmation.direction, symbol, confirmation.entry_price
                );
                continue;
            }
            let opened = manager
                .lock()
                .await
                .open(&pattern, &zones, &confirmation)
                .await?;
            if opened {
                store.lock().await.mark_processed(&key);
            }
        } else if let Some(level_886) = zones.level_886() {
            // Structure is in place but unconfirmed: flag the waiting zone.
            notifier.publish(NotifyEvent::EntryZoneDetected {
                symbol: symbol.clone(),
                zone: format!("0.886 retracement at {:.4}", level_886),
                price: level_886,
                direction: match pattern.direction {
                    Direction::Bearish => OrderSide::Sell,
                    Direction::Bullish => OrderSide::Buy,
                },
            });
        }
    }

    Ok(())
}

/// Prints the venue's open positions on an interval, independent of the
/// trading loop.
async fn monitor_venue(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let venue: Arc<dyn Venue> = Arc::from(create_venue(config.venue)?);

    let refresh = config.general.monitor_interval_secs.max(5);
    info!("Monitoring venue positions every {}s", refresh);

    let mut interval = time::interval(StdDuration::from_secs(refresh));
    loop {
        interval.tick().await;

        match venue.get_positions(None).await {
            Ok(positions) => {
                if positions.is_empty() {
                    info!("No open positions");
                    continue;
                }
                for position in positions {
                    let price = match venue.get_current_price(&position.symbol).await {
                        Ok(price) => price,
                        Err(e) => {
                            error!("Failed to get price for {}: {}", position.symbol, e);
                            continue;
                        }
                    };
                    info!(
                        "{} {} size={:.6}, mark={:.4}",
                        position.symbol, position.side, position.size, price
                    );
                }
            }
            Err(e) => error!("Failed to get positions: {}", e),
        }
    }
}
