//! Scheduler: the four-cadence orchestration loop.
//!
//! Cadences, slowest to fastest:
//! - refresh: leaderboard pull, per-trader metrics, rescoring
//! - rebalance: build target, apply risk caps, diff, execute
//! - ingest: trade events and position snapshots per tracked trader
//! - monitor: protective stop evaluation over the live book
//!
//! Each cadence runs on its own coordinating loop, so a slow refresh
//! never starves the stop monitor. Refresh and rebalance mutate the same
//! trader universe and therefore never overlap; whichever finds the
//! other running defers to the next tick. Monitor and ingest run
//! regardless. Every cycle ends in a [`CycleReport`] so a stalled
//! cadence is visible from the outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::engine::config::MirrorConfig;
use crate::engine::{CloseReason, ExecutionDiffer, PortfolioBuilder, RiskOverlay, StopMonitor};
use crate::execution::ExecutionTransport;
use crate::models::{
    Order, OrderStatus, RiskCapState, StopState, TargetPortfolio, TradeAction, TrackedTrader,
    Timeframe,
};
use crate::provider::{with_retry, TraderDataProvider};
use crate::scoring::TraderScorer;
use crate::store::PositionStore;

/// The four scheduled cycle kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    Refresh,
    Rebalance,
    Monitor,
    Ingest,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Refresh => "refresh",
            Cadence::Rebalance => "rebalance",
            Cadence::Monitor => "monitor",
            Cadence::Ingest => "ingest",
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    /// Completed, but some traders were skipped after retry exhaustion.
    PartialSkip,
    /// Aborted before completing; no further orders were submitted.
    Aborted(String),
    /// Another portfolio-mutating cycle was running; retried next tick.
    Deferred,
}

/// Per-cycle summary, logged and inspectable.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cadence: Cadence,
    pub outcome: CycleOutcome,
    pub skipped_traders: usize,
    pub orders_emitted: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What the scheduler is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Refreshing,
    Rebalancing,
    Monitoring,
    Ingesting,
    ShuttingDown,
}

/// Liveness view: current state plus last successful completion per
/// cadence.
#[derive(Debug, Clone)]
pub struct Liveness {
    pub state: SchedulerState,
    pub last_success: HashMap<Cadence, DateTime<Utc>>,
    pub open_positions: usize,
    pub tracked_traders: usize,
    pub shutting_down: bool,
}

pub struct Scheduler {
    config: MirrorConfig,
    account_value: Decimal,

    provider: Arc<dyn TraderDataProvider>,
    transport: Arc<dyn ExecutionTransport>,

    scorer: TraderScorer,
    builder: PortfolioBuilder,
    overlay: RiskOverlay,
    differ: ExecutionDiffer,
    stops: StopMonitor,
    store: Arc<PositionStore>,

    // Runtime state
    traders: Arc<RwLock<HashMap<String, TrackedTrader>>>,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    current_target: Arc<RwLock<Option<TargetPortfolio>>>,
    trade_cursors: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    /// (trader, token) pairs with an explicit close event seen recently.
    recent_closes: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
    /// Limit orders submitted but not yet filled, with their venue ids.
    resting: Arc<RwLock<Vec<(String, Order)>>>,
    last_success: Arc<RwLock<HashMap<Cadence, DateTime<Utc>>>>,
    state: Arc<RwLock<SchedulerState>>,

    /// Held by refresh and rebalance; they must not interleave.
    portfolio_lock: Mutex<()>,

    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: MirrorConfig,
        account_value: Decimal,
        provider: Arc<dyn TraderDataProvider>,
        transport: Arc<dyn ExecutionTransport>,
    ) -> Arc<Self> {
        let store = PositionStore::new(
            config.exec.entry_leverage,
            config.exec.maintenance_margin_pct,
        );
        Arc::new(Self {
            scorer: TraderScorer::new(config.scoring.clone()),
            builder: PortfolioBuilder::new(config.portfolio.clone()),
            overlay: RiskOverlay::new(config.risk.clone()),
            differ: ExecutionDiffer::new(config.exec.clone(), &config.stops),
            stops: StopMonitor::new(config.stops.clone()),
            config,
            account_value,
            provider,
            transport,
            store,
            traders: Arc::new(RwLock::new(HashMap::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            current_target: Arc::new(RwLock::new(None)),
            trade_cursors: Arc::new(RwLock::new(HashMap::new())),
            recent_closes: Arc::new(RwLock::new(HashMap::new())),
            resting: Arc::new(RwLock::new(Vec::new())),
            last_success: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            portfolio_lock: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shutdown flag for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop. Blocks until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let s = &self.config.schedule;
        info!(
            refresh_secs = s.refresh_secs,
            rebalance_secs = s.rebalance_secs,
            monitor_secs = s.monitor_secs,
            ingest_secs = s.ingest_secs,
            "Starting scheduler"
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        // Seed the trader universe so the first rebalance has inputs.
        self.log_report(self.trigger(Cadence::Refresh).await);

        // One loop per cadence: monitor and ingest keep ticking while a
        // slow refresh or rebalance holds the portfolio lock.
        let cadences = [
            Cadence::Refresh,
            Cadence::Rebalance,
            Cadence::Monitor,
            Cadence::Ingest,
        ];
        let mut loops = Vec::new();
        for cadence in cadences {
            let scheduler = self.clone();
            loops.push(tokio::spawn(scheduler.cadence_loop(cadence)));
        }
        for task in loops {
            task.await?;
        }

        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Coordinating loop for one cadence. Exits on shutdown.
    async fn cadence_loop(self: Arc<Self>, cadence: Cadence) {
        let s = &self.config.schedule;
        let secs = match cadence {
            Cadence::Refresh => s.refresh_secs,
            Cadence::Rebalance => s.rebalance_secs,
            Cadence::Monitor => s.monitor_secs,
            Cadence::Ingest => s.ingest_secs,
        };
        let mut ticks = interval(StdDuration::from_secs(secs));
        // Intervals fire immediately on the first tick; consume it.
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let report = self.trigger(cadence).await;
                    self.log_report(report);
                }
                _ = tokio::time::sleep(StdDuration::from_millis(500)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }

    /// Run one cycle on demand, outside its schedule.
    pub async fn trigger(&self, cadence: Cadence) -> CycleReport {
        let running = match cadence {
            Cadence::Refresh => SchedulerState::Refreshing,
            Cadence::Rebalance => SchedulerState::Rebalancing,
            Cadence::Monitor => SchedulerState::Monitoring,
            Cadence::Ingest => SchedulerState::Ingesting,
        };
        *self.state.write().await = running;

        let report = match cadence {
            Cadence::Refresh => self.refresh().await,
            Cadence::Rebalance => self.rebalance().await,
            Cadence::Monitor => self.monitor().await,
            Cadence::Ingest => self.ingest().await,
        };

        // Concurrent cadences share the slot; only the cycle that set it
        // puts it back.
        {
            let mut state = self.state.write().await;
            if *state == running {
                *state = SchedulerState::Idle;
            }
        }
        report
    }

    /// Daily cadence: leaderboard, per-trader metrics, rescoring.
    pub async fn refresh(&self) -> CycleReport {
        let started = Utc::now();
        let _guard = match self.portfolio_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Rebalance in flight, deferring refresh");
                return self.report(Cadence::Refresh, CycleOutcome::Deferred, 0, 0, started);
            }
        };

        let budget = self.retry_budget();
        let addresses = match with_retry("fetch_leaderboard", budget, || {
            self.provider.fetch_leaderboard(Timeframe::D30)
        })
        .await
        {
            Ok(addresses) => addresses,
            Err(e) => {
                error!(error = %e, "Leaderboard fetch failed, aborting refresh");
                return self.report(
                    Cadence::Refresh,
                    CycleOutcome::Aborted(e.to_string()),
                    0,
                    0,
                    started,
                );
            }
        };

        let fetched: Vec<Result<TrackedTrader, String>> = stream::iter(addresses)
            .map(|address| async move {
                with_retry("fetch_trader", budget, || self.provider.fetch_trader(&address))
                    .await
                    .map_err(|e| {
                        warn!(address = %address, error = %e, "Trader skipped this cycle");
                        address
                    })
            })
            .buffer_unordered(self.config.schedule.fetch_concurrency)
            .collect()
            .await;

        let now = Utc::now();
        let mut skipped = 0;
        {
            let mut traders = self.traders.write().await;
            for result in fetched {
                match result {
                    Ok(mut trader) => {
                        // The blacklist survives a refresh; the provider
                        // knows nothing about it.
                        if let Some(previous) = traders.get(&trader.address) {
                            trader.blacklisted_until = previous.blacklisted_until;
                        }
                        trader.clear_expired_blacklist(now);
                        trader.style = self.scorer.classify_style(&trader);
                        trader.score = self.scorer.score(&trader, now);
                        traders.insert(trader.address.clone(), trader);
                    }
                    Err(_) => skipped += 1,
                }
            }
            info!(
                traders = traders.len(),
                skipped,
                "Trader universe refreshed"
            );
        }

        self.update_prices().await;
        self.mark_success(Cadence::Refresh).await;

        let outcome = if skipped > 0 {
            CycleOutcome::PartialSkip
        } else {
            CycleOutcome::Success
        };
        self.report(Cadence::Refresh, outcome, skipped, 0, started)
    }

    /// Four-hourly cadence: target build, risk overlay, diff, execute.
    pub async fn rebalance(&self) -> CycleReport {
        let started = Utc::now();
        let _guard = match self.portfolio_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Refresh in flight, deferring rebalance");
                return self.report(Cadence::Rebalance, CycleOutcome::Deferred, 0, 0, started);
            }
        };
        if self.shutdown.load(Ordering::SeqCst) {
            return self.aborted(Cadence::Rebalance, "shutdown requested", started);
        }

        // Resolve last cycle's resting limits before planning anew.
        self.sweep_resting().await;

        let now = Utc::now();
        let traders: Vec<TrackedTrader> =
            self.traders.read().await.values().cloned().collect();
        let proposed = self.builder.build(&traders, self.account_value, now);

        // Checkpoint between planning and any order leaving the process.
        if self.shutdown.load(Ordering::SeqCst) {
            return self.aborted(Cadence::Rebalance, "shutdown requested", started);
        }

        let target = self.overlay.apply(proposed, self.account_value);
        if let Err(e) = self.overlay.verify(&target, self.account_value) {
            error!(error = %e, "Risk verification failed, aborting before any order");
            return self.aborted(Cadence::Rebalance, &e.to_string(), started);
        }
        *self.current_target.write().await = Some(target.clone());

        let holdings = self.store.snapshot().await;
        let prices = self.prices.read().await.clone();
        let orders = self.differ.diff(&target, &holdings, &prices, now);
        let emitted = self.execute_orders(orders).await;

        self.mark_success(Cadence::Rebalance).await;
        self.report(Cadence::Rebalance, CycleOutcome::Success, 0, emitted, started)
    }

    /// Minutely cadence: protective stops over the live book.
    pub async fn monitor(&self) -> CycleReport {
        let started = Utc::now();
        let now = Utc::now();
        let prices = self.prices.read().await.clone();
        let mut emitted = 0;

        for position in self.store.snapshot().await {
            let price = prices
                .get(&position.token)
                .copied()
                .unwrap_or(position.current_price);
            if price <= Decimal::ZERO {
                continue;
            }

            // A CLOSING position still on the book means an earlier close
            // order never filled; emit it again.
            if position.state == StopState::Closing {
                warn!(token = %position.token, "Unfilled close, re-emitting");
                emitted += self.close_position(&position.token, price).await;
                continue;
            }

            let decision = self
                .store
                .with_position(&position.token, |p| self.stops.evaluate(p, price, now))
                .await
                .flatten();

            if let Some(reason) = decision {
                info!(token = %position.token, reason = ?reason, "Protective close");
                emitted += self.close_position(&position.token, price).await;
            }
        }

        self.mark_success(Cadence::Monitor).await;
        self.report(Cadence::Monitor, CycleOutcome::Success, 0, emitted, started)
    }

    /// Five-minute cadence: trade events, position snapshots, and the
    /// liquidation inference over source traders.
    pub async fn ingest(&self) -> CycleReport {
        let started = Utc::now();
        let budget = self.retry_budget();
        let addresses: Vec<String> = self.traders.read().await.keys().cloned().collect();
        let mut skipped = 0;
        let mut emitted = 0;

        for address in addresses {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let since = self
                .trade_cursors
                .read()
                .await
                .get(&address)
                .copied()
                .unwrap_or(started - chrono::Duration::seconds(
                    2 * self.config.schedule.ingest_secs as i64,
                ));

            let trades = with_retry("fetch_trades", budget, || {
                self.provider.fetch_trades(&address, since)
            })
            .await;
            let positions = with_retry("fetch_positions", budget, || {
                self.provider.fetch_positions(&address)
            })
            .await;

            let (trades, positions) = match (trades, positions) {
                (Ok(t), Ok(p)) => (t, p),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(address = %address, error = %e, "Ingest skipped trader");
                    skipped += 1;
                    continue;
                }
            };

            {
                let mut traders = self.traders.write().await;
                if let Some(trader) = traders.get_mut(&address) {
                    trader.positions = positions;
                    if let Some(latest) = trades.last() {
                        trader.last_active_at = latest.timestamp;
                    }
                }
            }
            if let Some(latest) = trades.last() {
                self.trade_cursors
                    .write()
                    .await
                    .insert(address.clone(), latest.timestamp);
            }
            {
                let mut closes = self.recent_closes.write().await;
                for event in &trades {
                    if event.action == TradeAction::Close {
                        closes.insert(
                            (address.clone(), event.token.clone()),
                            event.timestamp,
                        );
                    }
                }
            }

            emitted += self.infer_liquidations(&address).await;
        }

        // Close events only matter across the confirmation window; drop
        // the rest so the map stays bounded.
        {
            let horizon = started
                - chrono::Duration::seconds(3 * self.config.schedule.ingest_secs as i64);
            self.recent_closes
                .write()
                .await
                .retain(|_, seen| *seen > horizon);
        }

        self.update_prices().await;
        self.mark_success(Cadence::Ingest).await;

        let outcome = if skipped > 0 {
            CycleOutcome::PartialSkip
        } else {
            CycleOutcome::Success
        };
        self.report(Cadence::Ingest, outcome, skipped, emitted, started)
    }

    /// Check every managed position sourced from this trader against the
    /// freshly ingested snapshot. Confirmed vanishing closes our side and
    /// blacklists the trader.
    async fn infer_liquidations(&self, address: &str) -> usize {
        let now = Utc::now();
        let trader = {
            let traders = self.traders.read().await;
            traders.get(address).cloned()
        };
        let trader = match trader {
            Some(trader) => trader,
            None => return 0,
        };
        let closes = self.recent_closes.read().await.clone();
        let mut emitted = 0;

        for position in self.store.snapshot().await {
            if !position.sources.iter().any(|s| s == address) {
                continue;
            }
            let still_held = trader.holds(&position.token, position.side);
            // Only a close event newer than our position explains its
            // absence; one predating the open is about some earlier
            // position on the same token.
            let closed_explicitly = closes
                .get(&(address.to_string(), position.token.clone()))
                .map_or(false, |seen| *seen > position.opened_at);

            let decision = self
                .store
                .with_position(&position.token, |p| {
                    self.stops
                        .note_snapshot(p, address, still_held, closed_explicitly)
                })
                .await
                .flatten();

            if closed_explicitly && !still_held {
                // The source exited on their own terms; they stop backing
                // this position and drop out of future inference.
                self.store
                    .with_position(&position.token, |p| {
                        p.sources.retain(|s| s != address);
                    })
                    .await;
                continue;
            }

            if let Some(CloseReason::TraderLiquidated(liquidated)) = decision {
                warn!(
                    trader = %liquidated,
                    token = %position.token,
                    "Inferred liquidation, closing our side and blacklisting"
                );
                {
                    let mut traders = self.traders.write().await;
                    if let Some(t) = traders.get_mut(&liquidated) {
                        t.blacklist_for(self.stops.blacklist_cooldown_hours(), now);
                    }
                }
                let price = self
                    .prices
                    .read()
                    .await
                    .get(&position.token)
                    .copied()
                    .unwrap_or(position.current_price);
                emitted += self.close_position(&position.token, price).await;
            }
        }

        emitted
    }

    /// Submit a market close for one position and apply the fill.
    async fn close_position(&self, token: &str, price: Decimal) -> usize {
        let snapshot = match self.store.with_position(token, |p| p.clone()).await {
            Some(snapshot) => snapshot,
            None => return 0,
        };
        let order = self.stops.close_order(&snapshot, price);
        self.execute_orders(vec![order]).await
    }

    /// Submit, poll, and book orders one at a time, checking the shutdown
    /// flag between each. A failed order is logged and left for the next
    /// cycle's diff to pick up.
    async fn execute_orders(&self, orders: Vec<Order>) -> usize {
        let mut filled = 0;

        for mut order in orders {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!("Shutdown requested, stopping order submission");
                break;
            }

            let venue_id = match self.transport.submit(&order).await {
                Ok(id) => id,
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "Order submission failed");
                    continue;
                }
            };
            order.transition(OrderStatus::Submitted);

            match self.transport.poll(&venue_id).await {
                Ok(OrderStatus::Filled) => match self.transport.fill(&venue_id).await {
                    Ok(Some(fill)) => {
                        order.transition(OrderStatus::Filled);
                        match self.store.apply_fill(&order, fill.price).await {
                            Ok(()) => filled += 1,
                            Err(e) => {
                                error!(order_id = %order.id, error = %e, "Fill not booked")
                            }
                        }
                    }
                    Ok(None) => warn!(order_id = %order.id, "Filled but no fill record"),
                    Err(e) => error!(order_id = %order.id, error = %e, "Fill fetch failed"),
                },
                Ok(status) => {
                    // Limit orders may rest until their deadline; the next
                    // rebalance sweeps them. They are never resubmitted.
                    debug!(order_id = %order.id, status = ?status, "Order resting");
                    self.resting.write().await.push((venue_id, order.clone()));
                }
                Err(e) => error!(order_id = %order.id, error = %e, "Order poll failed"),
            }
        }

        filled
    }

    /// Resolve limit orders left resting by an earlier cycle: book any
    /// late fill, cancel anything past its deadline.
    async fn sweep_resting(&self) {
        let pending = std::mem::take(&mut *self.resting.write().await);
        if pending.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut still_resting = Vec::new();

        for (venue_id, mut order) in pending {
            match self.transport.poll(&venue_id).await {
                Ok(OrderStatus::Filled) => match self.transport.fill(&venue_id).await {
                    Ok(Some(fill)) => {
                        order.transition(OrderStatus::Filled);
                        if let Err(e) = self.store.apply_fill(&order, fill.price).await {
                            error!(order_id = %order.id, error = %e, "Late fill not booked");
                        }
                    }
                    Ok(None) => warn!(order_id = %order.id, "Filled but no fill record"),
                    Err(e) => error!(order_id = %order.id, error = %e, "Fill fetch failed"),
                },
                Ok(_) if now >= order.constraints.deadline => {
                    info!(order_id = %order.id, "Limit deadline passed, cancelling");
                    if let Err(e) = self.transport.cancel(&venue_id).await {
                        warn!(order_id = %order.id, error = %e, "Cancel failed");
                    }
                    order.transition(OrderStatus::Expired);
                }
                Ok(_) => still_resting.push((venue_id, order)),
                Err(e) => error!(order_id = %order.id, error = %e, "Resting poll failed"),
            }
        }

        self.resting.write().await.extend(still_resting);
    }

    /// Refresh the mark-price map from the newest position snapshots.
    async fn update_prices(&self) {
        let traders = self.traders.read().await;
        let mut newest: HashMap<String, (DateTime<Utc>, Decimal)> = HashMap::new();
        for trader in traders.values() {
            for pos in &trader.positions {
                let entry = newest.entry(pos.token.clone());
                match entry {
                    std::collections::hash_map::Entry::Occupied(mut o)
                        if pos.observed_at > o.get().0 =>
                    {
                        o.insert((pos.observed_at, pos.mark_price));
                    }
                    std::collections::hash_map::Entry::Vacant(v) => {
                        v.insert((pos.observed_at, pos.mark_price));
                    }
                    _ => {}
                }
            }
        }
        drop(traders);

        let mut prices = self.prices.write().await;
        for (token, (_, price)) in newest {
            prices.insert(token, price);
        }
    }

    // -- Observability -----------------------------------------------------

    /// The target the last successful rebalance executed against.
    pub async fn target_snapshot(&self) -> Option<TargetPortfolio> {
        self.current_target.read().await.clone()
    }

    /// Exposure versus each configured cap.
    pub async fn risk_utilization(&self) -> Option<RiskCapState> {
        let target = self.current_target.read().await;
        target
            .as_ref()
            .map(|t| self.overlay.utilization(t, self.account_value))
    }

    pub async fn liveness(&self) -> Liveness {
        let shutting_down = self.shutdown.load(Ordering::SeqCst);
        let state = if shutting_down {
            SchedulerState::ShuttingDown
        } else {
            *self.state.read().await
        };
        Liveness {
            state,
            last_success: self.last_success.read().await.clone(),
            open_positions: self.store.len().await,
            tracked_traders: self.traders.read().await.len(),
            shutting_down,
        }
    }

    // -- Internals ---------------------------------------------------------

    fn retry_budget(&self) -> StdDuration {
        StdDuration::from_secs(self.config.schedule.retry_max_elapsed_secs)
    }

    async fn mark_success(&self, cadence: Cadence) {
        self.last_success.write().await.insert(cadence, Utc::now());
    }

    fn report(
        &self,
        cadence: Cadence,
        outcome: CycleOutcome,
        skipped_traders: usize,
        orders_emitted: usize,
        started_at: DateTime<Utc>,
    ) -> CycleReport {
        CycleReport {
            cadence,
            outcome,
            skipped_traders,
            orders_emitted,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn aborted(&self, cadence: Cadence, reason: &str, started: DateTime<Utc>) -> CycleReport {
        self.report(
            cadence,
            CycleOutcome::Aborted(reason.to_string()),
            0,
            0,
            started,
        )
    }

    fn log_report(&self, report: CycleReport) {
        match &report.outcome {
            CycleOutcome::Success | CycleOutcome::PartialSkip => info!(
                cadence = report.cadence.as_str(),
                outcome = ?report.outcome,
                skipped = report.skipped_traders,
                orders = report.orders_emitted,
                "Cycle complete"
            ),
            CycleOutcome::Aborted(reason) => {
                warn!(cadence = report.cadence.as_str(), reason = %reason, "Cycle aborted")
            }
            CycleOutcome::Deferred => {
                debug!(cadence = report.cadence.as_str(), "Cycle deferred")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::execution::{Fill, PaperTransport};
    use crate::models::{
        OrderConstraints, OrderIntent, Side, TimeframeMetrics, TradeEvent, TraderPosition,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    struct StubProvider {
        traders: RwLock<HashMap<String, TrackedTrader>>,
        trades: RwLock<Vec<TradeEvent>>,
        order: Vec<String>,
    }

    impl StubProvider {
        fn new(traders: Vec<TrackedTrader>) -> Arc<Self> {
            let order = traders.iter().map(|t| t.address.clone()).collect();
            Arc::new(Self {
                traders: RwLock::new(
                    traders.into_iter().map(|t| (t.address.clone(), t)).collect(),
                ),
                trades: RwLock::new(Vec::new()),
                order,
            })
        }

        async fn set_trades(&self, trades: Vec<TradeEvent>) {
            *self.trades.write().await = trades;
        }
    }

    #[async_trait]
    impl TraderDataProvider for StubProvider {
        async fn fetch_leaderboard(
            &self,
            _timeframe: Timeframe,
        ) -> Result<Vec<String>, EngineError> {
            Ok(self.order.clone())
        }

        async fn fetch_trader(&self, address: &str) -> Result<TrackedTrader, EngineError> {
            self.traders
                .read()
                .await
                .get(address)
                .cloned()
                .ok_or_else(|| EngineError::data_invalid(address, "unknown"))
        }

        async fn fetch_positions(
            &self,
            address: &str,
        ) -> Result<Vec<TraderPosition>, EngineError> {
            Ok(self.fetch_trader(address).await?.positions)
        }

        async fn fetch_trades(
            &self,
            _address: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<TradeEvent>, EngineError> {
            Ok(self
                .trades
                .read()
                .await
                .iter()
                .filter(|e| e.timestamp > since)
                .cloned()
                .collect())
        }
    }

    /// Venue that rejects the first N submissions, then behaves.
    struct FlakyTransport {
        inner: PaperTransport,
        submit_failures: AtomicU32,
    }

    #[async_trait]
    impl ExecutionTransport for FlakyTransport {
        async fn submit(&self, order: &Order) -> Result<String, EngineError> {
            let remaining = self.submit_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.submit_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::ExecutionFailure {
                    order_id: order.id.clone(),
                    reason: "venue unavailable".to_string(),
                });
            }
            self.inner.submit(order).await
        }

        async fn poll(&self, order_id: &str) -> Result<OrderStatus, EngineError> {
            self.inner.poll(order_id).await
        }

        async fn fill(&self, order_id: &str) -> Result<Option<Fill>, EngineError> {
            self.inner.fill(order_id).await
        }

        async fn cancel(&self, order_id: &str) -> Result<(), EngineError> {
            self.inner.cancel(order_id).await
        }
    }

    /// Venue where every order rests unfilled until cancelled.
    struct RestingTransport {
        cancelled: RwLock<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionTransport for RestingTransport {
        async fn submit(&self, order: &Order) -> Result<String, EngineError> {
            Ok(order.id.clone())
        }

        async fn poll(&self, _order_id: &str) -> Result<OrderStatus, EngineError> {
            Ok(OrderStatus::Submitted)
        }

        async fn fill(&self, _order_id: &str) -> Result<Option<Fill>, EngineError> {
            Ok(None)
        }

        async fn cancel(&self, order_id: &str) -> Result<(), EngineError> {
            self.cancelled.write().await.push(order_id.to_string());
            Ok(())
        }
    }

    fn eligible_trader(address: &str) -> TrackedTrader {
        let mut trader = TrackedTrader::new(address.to_string());
        trader.account_value = dec!(100000);
        for (tf, roi) in [
            (Timeframe::D7, 0.5),
            (Timeframe::D30, 0.4),
            (Timeframe::D90, 0.6),
        ] {
            trader.metrics.insert(
                tf,
                TimeframeMetrics {
                    pnl: dec!(20000),
                    roi,
                    win_rate: 0.55,
                    trade_count: 40,
                },
            );
        }
        trader.profit_factor = 2.0;
        trader.trades_per_day = 5.0;
        trader.avg_hold_hours = 24.0;
        trader.leverage_history = vec![3.0, 3.0, 3.0];
        trader.positions = vec![TraderPosition {
            token: "BTC".to_string(),
            side: Side::Long,
            notional_usd: dec!(20000),
            mark_price: dec!(50000),
            leverage: dec!(3),
            observed_at: Utc::now(),
        }];
        trader
    }

    fn scheduler_with(
        traders: Vec<TrackedTrader>,
    ) -> (Arc<Scheduler>, Arc<StubProvider>, Arc<PaperTransport>) {
        let provider = StubProvider::new(traders);
        let transport = Arc::new(PaperTransport::new());
        let scheduler = Scheduler::new(
            MirrorConfig::default(),
            dec!(100000),
            provider.clone(),
            transport.clone(),
        );
        (scheduler, provider, transport)
    }

    fn btc_open() -> Order {
        Order::market(
            OrderIntent::Open,
            "BTC".to_string(),
            Side::Long,
            dec!(10000),
            OrderConstraints {
                max_slippage: dec!(0.005),
                reference_price: dec!(50000),
                deadline: Utc::now() + chrono::Duration::minutes(5),
            },
        )
        .with_initial_stop(dec!(48000))
        .with_contributors(vec!["0xaaa".to_string()])
    }

    #[tokio::test]
    async fn test_full_paper_cycle_opens_position() {
        let (scheduler, _provider, transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);

        let refresh = scheduler.refresh().await;
        assert_eq!(refresh.outcome, CycleOutcome::Success);

        let rebalance = scheduler.rebalance().await;
        assert_eq!(rebalance.outcome, CycleOutcome::Success);
        assert_eq!(rebalance.orders_emitted, 1);

        // Trader runs 20% of their account; our per-position cap is 10%.
        let positions = scheduler.store.snapshot().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].token, "BTC");
        assert_eq!(positions[0].current_notional(), dec!(10000));

        let submitted = transport.submitted_orders().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].intent, OrderIntent::Open);
        assert!(submitted[0].initial_stop.is_some());
    }

    #[tokio::test]
    async fn test_rebalance_defers_while_refresh_holds_lock() {
        let (scheduler, _provider, _transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);

        let _guard = scheduler.portfolio_lock.lock().await;
        let report = scheduler.rebalance().await;
        assert_eq!(report.outcome, CycleOutcome::Deferred);
        assert_eq!(report.orders_emitted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_rebalance_before_orders() {
        let (scheduler, _provider, transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);
        scheduler.refresh().await;

        scheduler.shutdown.store(true, Ordering::SeqCst);
        let report = scheduler.rebalance().await;
        assert!(matches!(report.outcome, CycleOutcome::Aborted(_)));
        assert!(transport.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_closes_stopped_out_position() {
        let (scheduler, _provider, _transport) = scheduler_with(vec![]);
        scheduler.store.apply_fill(&btc_open(), dec!(50000)).await.unwrap();

        // Mark price drops through the stop.
        scheduler
            .prices
            .write()
            .await
            .insert("BTC".to_string(), dec!(47500));

        let report = scheduler.monitor().await;
        assert_eq!(report.orders_emitted, 1);
        assert!(scheduler.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_vanished_trader_position_closes_and_blacklists() {
        let mut trader = eligible_trader("0xaaa");
        trader.positions.clear();
        let (scheduler, _provider, _transport) = scheduler_with(vec![trader]);
        scheduler.refresh().await;

        scheduler.store.apply_fill(&btc_open(), dec!(50000)).await.unwrap();

        // First snapshot with the source position missing: suspect only.
        scheduler.ingest().await;
        assert_eq!(scheduler.store.len().await, 1);

        // Second consecutive miss confirms; our side closes and the
        // trader enters cooldown.
        scheduler.ingest().await;
        assert!(scheduler.store.is_empty().await);

        let traders = scheduler.traders.read().await;
        assert!(traders["0xaaa"].is_blacklisted(Utc::now()));
    }

    #[tokio::test]
    async fn test_second_rebalance_is_idempotent() {
        let (scheduler, _provider, transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);
        scheduler.refresh().await;

        scheduler.rebalance().await;
        let second = scheduler.rebalance().await;
        assert_eq!(second.outcome, CycleOutcome::Success);
        // Holdings already match the target; nothing new goes out.
        assert_eq!(second.orders_emitted, 0);
        assert_eq!(transport.submitted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_retries_unfilled_close() {
        let provider = StubProvider::new(vec![]);
        let transport = Arc::new(FlakyTransport {
            inner: PaperTransport::new(),
            submit_failures: AtomicU32::new(1),
        });
        let scheduler = Scheduler::new(
            MirrorConfig::default(),
            dec!(100000),
            provider,
            transport.clone(),
        );

        scheduler.store.apply_fill(&btc_open(), dec!(50000)).await.unwrap();
        scheduler
            .prices
            .write()
            .await
            .insert("BTC".to_string(), dec!(47500));

        // Stop fires but the venue rejects the close; the position stays
        // on the book, parked in CLOSING.
        let first = scheduler.monitor().await;
        assert_eq!(first.orders_emitted, 0);
        let parked = scheduler.store.snapshot().await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].state, StopState::Closing);

        // Venue recovers; the next pass re-emits and the book empties.
        let second = scheduler.monitor().await;
        assert_eq!(second.orders_emitted, 1);
        assert!(scheduler.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_monitor_and_ingest_run_while_portfolio_locked() {
        let (scheduler, _provider, _transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);
        scheduler.refresh().await;

        // Protective cadences are never gated on the portfolio lock.
        let _guard = scheduler.portfolio_lock.lock().await;
        assert_eq!(scheduler.monitor().await.outcome, CycleOutcome::Success);
        assert_eq!(scheduler.ingest().await.outcome, CycleOutcome::Success);
    }

    #[tokio::test]
    async fn test_stale_close_event_does_not_mask_liquidation() {
        let mut trader = eligible_trader("0xaaa");
        trader.positions.clear();
        let (scheduler, _provider, _transport) = scheduler_with(vec![trader]);
        scheduler.refresh().await;

        // A close recorded long before this position existed.
        scheduler.recent_closes.write().await.insert(
            ("0xaaa".to_string(), "BTC".to_string()),
            Utc::now() - chrono::Duration::days(2),
        );
        scheduler.store.apply_fill(&btc_open(), dec!(50000)).await.unwrap();

        scheduler.ingest().await;
        assert_eq!(scheduler.store.len().await, 1);
        // The stale event is also pruned out of the map.
        assert!(scheduler.recent_closes.read().await.is_empty());

        scheduler.ingest().await;
        assert!(scheduler.store.is_empty().await);
        assert!(scheduler.traders.read().await["0xaaa"].is_blacklisted(Utc::now()));
    }

    #[tokio::test]
    async fn test_explicit_close_releases_source_without_blacklist() {
        let mut trader = eligible_trader("0xaaa");
        trader.positions.clear();
        let (scheduler, provider, _transport) = scheduler_with(vec![trader]);
        scheduler.refresh().await;

        scheduler.store.apply_fill(&btc_open(), dec!(50000)).await.unwrap();
        provider
            .set_trades(vec![TradeEvent {
                trader_address: "0xaaa".to_string(),
                token: "BTC".to_string(),
                side: Side::Long,
                action: TradeAction::Close,
                size_usd: dec!(20000),
                price: dec!(50000),
                timestamp: Utc::now(),
            }])
            .await;

        for _ in 0..3 {
            scheduler.ingest().await;
        }

        // The position rides on under its own stops; the source is
        // released and the trader is not punished.
        let positions = scheduler.store.snapshot().await;
        assert_eq!(positions.len(), 1);
        assert!(positions[0].sources.is_empty());
        assert!(!scheduler.traders.read().await["0xaaa"].is_blacklisted(Utc::now()));
    }

    #[tokio::test]
    async fn test_liveness_reports_scheduler_state() {
        let (scheduler, _provider, _transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);

        assert_eq!(scheduler.liveness().await.state, SchedulerState::Idle);

        // A completed cycle hands the slot back.
        scheduler.trigger(Cadence::Monitor).await;
        assert_eq!(scheduler.liveness().await.state, SchedulerState::Idle);

        scheduler.shutdown.store(true, Ordering::SeqCst);
        assert_eq!(
            scheduler.liveness().await.state,
            SchedulerState::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_rebalance_cancels_expired_resting_limit() {
        let provider = StubProvider::new(vec![]);
        let transport = Arc::new(RestingTransport {
            cancelled: RwLock::new(Vec::new()),
        });
        let scheduler = Scheduler::new(
            MirrorConfig::default(),
            dec!(100000),
            provider,
            transport.clone(),
        );

        let order = Order::limit(
            OrderIntent::Open,
            "BTC".to_string(),
            Side::Long,
            dec!(5000),
            OrderConstraints {
                max_slippage: dec!(0.005),
                reference_price: dec!(50000),
                deadline: Utc::now() - chrono::Duration::minutes(1),
            },
        )
        .with_initial_stop(dec!(48000));

        let filled = scheduler.execute_orders(vec![order.clone()]).await;
        assert_eq!(filled, 0);
        assert_eq!(scheduler.resting.read().await.len(), 1);

        scheduler.rebalance().await;
        assert_eq!(*transport.cancelled.read().await, vec![order.id.clone()]);
        assert!(scheduler.resting.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_liveness_tracks_cycles() {
        let (scheduler, _provider, _transport) =
            scheduler_with(vec![eligible_trader("0xaaa")]);

        scheduler.refresh().await;
        scheduler.monitor().await;

        let liveness = scheduler.liveness().await;
        assert!(liveness.last_success.contains_key(&Cadence::Refresh));
        assert!(liveness.last_success.contains_key(&Cadence::Monitor));
        assert!(!liveness.last_success.contains_key(&Cadence::Rebalance));
        assert_eq!(liveness.tracked_traders, 1);
        assert!(!liveness.shutting_down);
    }
}
