//! Perpetual-futures copy-trading mirror.
//!
//! Scores leaderboard traders, blends their live positioning into a
//! single target portfolio, caps it with a risk overlay, and keeps the
//! mirrored book in line on a fixed cadence with independent stops.

mod engine;
mod error;
mod execution;
mod models;
mod provider;
mod scheduler;
mod scoring;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::engine::config::MirrorConfig;
use crate::engine::{PortfolioBuilder, RiskOverlay};
use crate::execution::PaperTransport;
use crate::provider::fixture::FixtureProvider;
use crate::provider::TraderDataProvider;
use crate::scheduler::Scheduler;
use crate::scoring::TraderScorer;

/// Perp copy-trading mirror CLI.
#[derive(Parser)]
#[command(name = "perpmirror")]
#[command(about = "Mirror top perpetual-futures traders with risk caps", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mirror engine against a snapshot file (paper fills)
    Run {
        /// Your account value in USD
        #[arg(short, long)]
        account: f64,

        /// Trader snapshot file (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Rebalance interval override in seconds
        #[arg(long)]
        rebalance_secs: Option<u64>,

        /// Stop-monitor interval override in seconds
        #[arg(long)]
        monitor_secs: Option<u64>,
    },

    /// Score the traders in a snapshot file
    Score {
        /// Trader snapshot file (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Maximum number of traders to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Build and print the capped target portfolio, one-shot
    Target {
        /// Your account value in USD
        #[arg(short, long)]
        account: f64,

        /// Trader snapshot file (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            account,
            snapshot,
            rebalance_secs,
            monitor_secs,
        } => {
            let mut config = MirrorConfig::default();
            if let Some(secs) = rebalance_secs {
                config.schedule.rebalance_secs = secs;
            }
            if let Some(secs) = monitor_secs {
                config.schedule.monitor_secs = secs;
            }

            let provider = Arc::new(FixtureProvider::load(&snapshot)?);
            let transport = Arc::new(PaperTransport::new());
            let account_value = Decimal::try_from(account)?;

            info!(
                account = %account_value,
                snapshot = %snapshot.display(),
                "Starting mirror engine"
            );

            println!("\n=== Perp Copy Mirror ===");
            println!("Account value:      ${}", account_value);
            println!("Rebalance interval: {}s", config.schedule.rebalance_secs);
            println!("Monitor interval:   {}s", config.schedule.monitor_secs);
            println!("Mode: PAPER (simulated fills)");
            println!("\nPress Ctrl+C to stop.\n");

            let scheduler = Scheduler::new(config, account_value, provider, transport.clone());
            scheduler.clone().run().await?;

            let submitted = transport.submitted_orders().await;
            println!("\nOrders submitted this session: {}", submitted.len());
            if let Some(target) = scheduler.target_snapshot().await {
                println!("Final target entries: {}", target.len());
            }
        }

        Commands::Score { snapshot, limit } => {
            let provider = FixtureProvider::load(&snapshot)?;
            let scorer = TraderScorer::new(MirrorConfig::default().scoring);
            let now = chrono::Utc::now();

            let addresses = provider
                .fetch_leaderboard(models::Timeframe::D30)
                .await?;

            let mut scored = Vec::new();
            for address in addresses {
                let mut trader = provider.fetch_trader(&address).await?;
                trader.style = scorer.classify_style(&trader);
                trader.score = scorer.score(&trader, now);
                scored.push(trader);
            }
            scored.sort_by(|a, b| {
                b.score_total()
                    .partial_cmp(&a.score_total())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            println!(
                "\n{:<44} {:<10} {:>8} {:>8}",
                "ADDRESS", "STYLE", "SCORE", "TRADES"
            );
            println!("{}", "-".repeat(74));
            for trader in scored.iter().take(limit) {
                let score = match &trader.score {
                    Some(s) => format!("{:.3}", s.total),
                    None => "gated".to_string(),
                };
                println!(
                    "{:<44} {:<10} {:>8} {:>8}",
                    trader.address,
                    trader.style.as_str(),
                    score,
                    trader.total_trade_count()
                );
            }
        }

        Commands::Target { account, snapshot } => {
            let provider = FixtureProvider::load(&snapshot)?;
            let config = MirrorConfig::default();
            let scorer = TraderScorer::new(config.scoring.clone());
            let builder = PortfolioBuilder::new(config.portfolio.clone());
            let overlay = RiskOverlay::new(config.risk.clone());
            let account_value = Decimal::try_from(account)?;
            let now = chrono::Utc::now();

            let addresses = provider
                .fetch_leaderboard(models::Timeframe::D30)
                .await?;
            let mut traders = Vec::new();
            for address in addresses {
                let mut trader = provider.fetch_trader(&address).await?;
                trader.style = scorer.classify_style(&trader);
                trader.score = scorer.score(&trader, now);
                traders.push(trader);
            }

            let target = overlay.apply(builder.build(&traders, account_value, now), account_value);
            overlay.verify(&target, account_value)?;

            println!(
                "\n{:<12} {:<6} {:>8} {:>12} {:>12}",
                "TOKEN", "SIDE", "WEIGHT", "TARGET USD", "REF PRICE"
            );
            println!("{}", "-".repeat(56));
            for entry in &target.entries {
                println!(
                    "{:<12} {:<6} {:>8.4} {:>12.2} {:>12.2}",
                    entry.token,
                    format!("{:?}", entry.side),
                    entry.weight,
                    entry.target_usd,
                    entry.reference_price
                );
            }
            println!("\nTotal exposure: ${:.2}", target.total_exposure());

            let state = overlay.utilization(&target, account_value);
            println!("Cap utilization: {:.1}%", state.total_utilization() * dec!(100));
        }

        Commands::Config => {
            let config = MirrorConfig::default();

            println!("\n=== Scoring ===\n");
            println!("Min trades:           {}", config.scoring.min_trade_count);
            println!("Min account value:    ${}", config.scoring.min_account_value);
            println!(
                "Win-rate band:        {:.0}% - {:.0}%",
                config.scoring.win_rate_bounds.0 * 100.0,
                config.scoring.win_rate_bounds.1 * 100.0
            );
            println!(
                "Win-rate saturation:  {:.0}%",
                config.scoring.win_rate_saturation * 100.0
            );
            println!("Luck penalty:         x{}", config.scoring.luck_penalty);
            println!("Recency half-life:    {}h", config.scoring.recency_half_life_hours);

            println!("\n=== Portfolio ===\n");
            println!("Temperature:          {}", config.portfolio.temperature);
            println!("Top traders:          {}", config.portfolio.top_n);

            println!("\n=== Risk Caps ===\n");
            println!("Per position:         {}% / ${}", config.risk.per_position_pct * dec!(100), config.risk.per_position_usd);
            println!("Per token:            {}%", config.risk.per_token_pct * dec!(100));
            println!("Per direction:        {}%", config.risk.directional_pct * dec!(100));
            println!("Total exposure:       {}%", config.risk.total_exposure_pct * dec!(100));
            println!("Max leverage:         {}x", config.risk.max_leverage);
            println!("Max positions:        {}", config.risk.max_positions);

            println!("\n=== Execution ===\n");
            println!("Min rebalance:        ${}", config.exec.min_rebalance_usd);
            println!("Max slippage:         {}%", config.exec.max_slippage * dec!(100));
            println!("Fresh signal:         <{}s", config.exec.fresh_signal_secs);
            println!("Stale signal:         >{}s", config.exec.stale_signal_secs);
            println!("Limit TTL:            {}s", config.exec.limit_ttl_secs);
            println!("Entry leverage:       {}x", config.exec.entry_leverage);
            println!("Maintenance margin:   {}%", config.exec.maintenance_margin_pct * dec!(100));

            println!("\n=== Stops ===\n");
            println!("Stop loss:            {}%", config.stops.stop_loss_pct * dec!(100));
            println!("Trail activation:     {}%", config.stops.trail_activation_pct * dec!(100));
            println!("Trail distance:       {}%", config.stops.trail_distance_pct * dec!(100));
            println!("Max hold:             {}h", config.stops.max_hold_hours);
            println!("Liquidation buffer:   {}%", config.stops.liquidation_buffer_pct * dec!(100));
            println!("Blacklist cooldown:   {}h", config.stops.blacklist_cooldown_hours);

            println!("\n=== Schedule ===\n");
            println!("Refresh:              {}s", config.schedule.refresh_secs);
            println!("Rebalance:            {}s", config.schedule.rebalance_secs);
            println!("Monitor:              {}s", config.schedule.monitor_secs);
            println!("Ingest:               {}s", config.schedule.ingest_secs);
        }
    }

    Ok(())
}
