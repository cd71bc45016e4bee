//! Protective order state machine
//!
//! Per open position: `NoProtection -> Protected -> Tp1Hit -> Closed`.
//! Exchange-side TP/SL plans are the primary mechanism. When none are
//! resting, the engine tracks the levels itself and closes with market
//! orders (manual protection).
//!
//! The state is in-memory only. After a restart it is rebuilt on first sight
//! from the stored position, the signal's target levels and whatever orders
//! the exchange still has resting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::exchange::ExchangeAdapter;
use crate::notify::Notifier;
use crate::store::SqliteStore;
use crate::types::{
    Direction, OpenOrder, PositionRecord, ProtectiveKind, RemotePosition, SignalRecord, Symbol,
    TradeRecord,
};

const HUNDRED: Decimal = dec!(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionPhase {
    #[default]
    NoProtection,
    Protected,
    Tp1Hit,
    Closed,
}

/// Take-profit and stop-loss prices of one position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetLevels {
    pub tp1: Decimal,
    pub tp2: Decimal,
    pub sl: Decimal,
}

/// Levels the engine enforces itself while no exchange orders rest
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualProtection {
    pub tp1_price: Decimal,
    pub tp2_price: Decimal,
    pub sl_price: Decimal,
    pub entry_price: Decimal,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtectiveState {
    pub original_size: Option<Decimal>,
    pub tp1_triggered: bool,
    pub breakeven_applied: bool,
    pub manual_protection: Option<ManualProtection>,
    pub phase: ProtectionPhase,
    pub levels: Option<TargetLevels>,
}

/// Size change relative to the size first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    None,
    Tp1Band,
    FullClose,
}

/// Close the engine decided on under manual protection
#[derive(Debug, Clone, PartialEq)]
pub struct CloseDecision {
    /// Share of the current size to close
    pub fraction: Decimal,
    pub reason: &'static str,
    pub marks_tp1: bool,
}

/// What the reconciler should do with the position after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionOutcome {
    Tracking,
    /// Size shrank past the full-close threshold; drop tracking state
    FullyClosed,
    /// The engine closed the whole position with a market order
    ClosedByEngine,
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Signal levels where present, direction-aware percentage fallbacks otherwise
pub fn target_levels(
    signal: Option<&SignalRecord>,
    direction: Direction,
    entry: Decimal,
    cfg: &ReconcileConfig,
) -> TargetLevels {
    let pct = |p: Decimal| p / HUNDRED;
    let (tp1, tp2, sl) = match direction {
        Direction::Long => (
            entry * (Decimal::ONE + pct(cfg.fallback_tp1_pct)),
            entry * (Decimal::ONE + pct(cfg.fallback_tp2_pct)),
            entry * (Decimal::ONE - pct(cfg.fallback_sl_pct)),
        ),
        Direction::Short => (
            entry * (Decimal::ONE - pct(cfg.fallback_tp1_pct)),
            entry * (Decimal::ONE - pct(cfg.fallback_tp2_pct)),
            entry * (Decimal::ONE + pct(cfg.fallback_sl_pct)),
        ),
    };

    let pick = |stored: Option<Decimal>, fallback: Decimal| {
        stored.filter(|p| *p > Decimal::ZERO).unwrap_or(fallback)
    };

    TargetLevels {
        tp1: pick(signal.and_then(|s| s.tp1_price), tp1),
        tp2: pick(signal.and_then(|s| s.tp2_price), tp2),
        sl: pick(signal.and_then(|s| s.sl_price), sl),
    }
}

/// `(tp1_amount, tp2_amount)`; the two always sum to `size`
pub fn split_amounts(size: Decimal, tp1_fraction: Decimal) -> (Decimal, Decimal) {
    let tp1 = (size * tp1_fraction).normalize();
    (tp1, (size - tp1).normalize())
}

pub fn breakeven_price(entry: Decimal, direction: Direction, fee_buffer_pct: Decimal) -> Decimal {
    let buffer = fee_buffer_pct / HUNDRED;
    match direction {
        Direction::Long => entry * (Decimal::ONE + buffer),
        Direction::Short => entry * (Decimal::ONE - buffer),
    }
}

/// Fraction of the entry-to-TP1 distance already covered
///
/// `None` when TP1 sits on the wrong side of entry or price is already past
/// TP1 (TP1 detection handles that case).
pub fn progress_to_tp1(
    direction: Direction,
    entry: Decimal,
    tp1: Decimal,
    price: Decimal,
) -> Option<Decimal> {
    match direction {
        Direction::Long => {
            if tp1 <= entry || price >= tp1 {
                return None;
            }
            Some((price - entry) / (tp1 - entry))
        }
        Direction::Short => {
            if tp1 >= entry || price <= tp1 {
                return None;
            }
            Some((entry - price) / (entry - tp1))
        }
    }
}

pub fn classify_shrink(original: Decimal, current: Decimal, cfg: &ReconcileConfig) -> SizeChange {
    if original <= Decimal::ZERO {
        return SizeChange::None;
    }
    let shrink_pct = (original - current) / original * HUNDRED;
    if shrink_pct > cfg.full_close_shrink_pct {
        SizeChange::FullClose
    } else if shrink_pct >= cfg.tp1_shrink_min_pct && shrink_pct <= cfg.tp1_shrink_max_pct {
        SizeChange::Tp1Band
    } else {
        SizeChange::None
    }
}

/// Stop-side order of a position: tagged SL, or an untagged closing order
/// priced short of TP1 (below it for longs, above it for shorts)
///
/// A breakeven stop sits just past entry, so entry cannot be the boundary.
pub fn is_stop_order(order: &OpenOrder, direction: Direction, tp1: Decimal) -> bool {
    match order.kind {
        Some(kind) => kind == ProtectiveKind::StopLoss,
        None => {
            order.side == direction.exit_side()
                && match direction {
                    Direction::Long => order.price < tp1,
                    Direction::Short => order.price > tp1,
                }
        }
    }
}

pub fn is_take_profit_order(order: &OpenOrder, direction: Direction, tp1: Decimal) -> bool {
    match order.kind {
        Some(kind) => kind == ProtectiveKind::TakeProfit,
        None => order.side == direction.exit_side() && !is_stop_order(order, direction, tp1),
    }
}

/// Whether `price` is at or past entry on the profit side
fn at_or_past_entry(direction: Direction, entry: Decimal, price: Decimal) -> bool {
    match direction {
        Direction::Long => price >= entry,
        Direction::Short => price <= entry,
    }
}

/// Progress already made by a position whose state is being rebuilt
///
/// `(breakeven_applied, tp1_triggered)`: a resting stop at or past entry
/// means breakeven already fired; if additionally every resting take-profit
/// sits at TP2 or beyond, TP1 has filled.
pub fn infer_progress(
    orders: &[OpenOrder],
    direction: Direction,
    entry: Decimal,
    levels: &TargetLevels,
) -> (bool, bool) {
    let breakeven = orders
        .iter()
        .filter(|o| is_stop_order(o, direction, levels.tp1))
        .any(|o| at_or_past_entry(direction, entry, o.price));
    if !breakeven {
        return (false, false);
    }

    let take_profits: Vec<&OpenOrder> = orders
        .iter()
        .filter(|o| is_take_profit_order(o, direction, levels.tp1))
        .collect();
    let tp1_filled = !take_profits.is_empty()
        && take_profits.iter().all(|o| match direction {
            Direction::Long => o.price >= levels.tp2,
            Direction::Short => o.price <= levels.tp2,
        });
    (true, tp1_filled)
}

/// A tagged TP/SL plan or any resting order on the closing side counts
pub fn has_protective_orders(orders: &[OpenOrder], direction: Direction) -> bool {
    orders
        .iter()
        .any(|o| o.kind.is_some() || o.side == direction.exit_side())
}

pub fn pnl_pct(direction: Direction, entry: Decimal, price: Decimal) -> Decimal {
    if entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match direction {
        Direction::Long => (price - entry) / entry * HUNDRED,
        Direction::Short => (entry - price) / entry * HUNDRED,
    }
}

/// Manual-protection decision for the current price
///
/// Checked in order: emergency stop, stop loss, TP2 (after TP1), TP1.
pub fn manual_close_decision(
    mp: &ManualProtection,
    price: Decimal,
    tp1_triggered: bool,
    cfg: &ReconcileConfig,
) -> Option<CloseDecision> {
    let long = mp.direction == Direction::Long;

    if pnl_pct(mp.direction, mp.entry_price, price) <= -cfg.emergency_stop_pct {
        return Some(CloseDecision {
            fraction: Decimal::ONE,
            reason: "EMERGENCY_STOP",
            marks_tp1: false,
        });
    }

    let sl_hit = if long { price <= mp.sl_price } else { price >= mp.sl_price };
    if sl_hit {
        return Some(CloseDecision {
            fraction: Decimal::ONE,
            reason: "STOP_LOSS",
            marks_tp1: false,
        });
    }

    let tp2_hit = if long { price >= mp.tp2_price } else { price <= mp.tp2_price };
    if tp1_triggered && tp2_hit {
        return Some(CloseDecision {
            fraction: Decimal::ONE,
            reason: "TP2",
            marks_tp1: false,
        });
    }

    let tp1_hit = if long { price >= mp.tp1_price } else { price <= mp.tp1_price };
    if !tp1_triggered && tp1_hit {
        return Some(CloseDecision {
            fraction: cfg.tp1_close_fraction,
            reason: "TP1",
            marks_tp1: true,
        });
    }

    None
}

/// `(net_pnl, fees, pnl_pct)` of closing `quantity` at `exit`
pub fn realized_pnl(
    direction: Direction,
    entry: Decimal,
    exit: Decimal,
    quantity: Decimal,
    fee_rate: Decimal,
) -> (Decimal, Decimal, Decimal) {
    let gross = match direction {
        Direction::Long => (exit - entry) * quantity,
        Direction::Short => (entry - exit) * quantity,
    };
    let fees = (entry * quantity + exit * quantity) * fee_rate;
    let net = gross - fees;
    let notional = entry * quantity;
    let pct = if notional > Decimal::ZERO {
        net / notional * HUNDRED
    } else {
        Decimal::ZERO
    };
    (net, fees, pct)
}

// =============================================================================
// Driver
// =============================================================================

/// Inputs of one position for one pass
pub struct PositionView<'a> {
    pub position: &'a PositionRecord,
    pub remote: &'a RemotePosition,
    pub signal: Option<&'a SignalRecord>,
}

/// Runs the state machine for one position against the exchange
pub struct ProtectionDriver<'a> {
    pub cfg: &'a ReconcileConfig,
    pub adapter: &'a dyn ExchangeAdapter,
    pub store: &'a SqliteStore,
    pub notifier: &'a dyn Notifier,
}

impl<'a> ProtectionDriver<'a> {
    pub async fn drive(
        &self,
        view: &PositionView<'_>,
        state: &mut ProtectiveState,
        now: DateTime<Utc>,
    ) -> ProtectionOutcome {
        let pos = view.position;
        let size = view.remote.size();

        let Some(original) = state.original_size else {
            self.first_sight(view, state).await;
            return ProtectionOutcome::Tracking;
        };

        match classify_shrink(original, size, self.cfg) {
            SizeChange::FullClose => {
                info!(
                    user = pos.user_id,
                    symbol = %pos.symbol,
                    "Size {} -> {}: treating as fully closed", original, size
                );
                state.phase = ProtectionPhase::Closed;
                return ProtectionOutcome::FullyClosed;
            }
            SizeChange::Tp1Band if !state.tp1_triggered => {
                self.on_tp1_fill(view, state, original).await;
            }
            _ => {}
        }

        let orders = match self.adapter.fetch_open_orders(&pos.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(user = pos.user_id, symbol = %pos.symbol, "fetch_open_orders failed: {}", e);
                return ProtectionOutcome::Tracking;
            }
        };
        let protected = has_protective_orders(&orders, pos.direction);
        self.sync_manual_protection(view, state, protected);

        let mut price = view.remote.mark_price.filter(|p| *p > Decimal::ZERO);

        if !state.tp1_triggered && !state.breakeven_applied {
            if let Some(levels) = state.levels {
                if let Some(current) = self.current_price(&pos.symbol, &mut price).await {
                    let progress =
                        progress_to_tp1(pos.direction, pos.entry_price, levels.tp1, current);
                    if progress.is_some_and(|p| p >= self.cfg.breakeven_trigger_progress) {
                        info!(
                            user = pos.user_id,
                            symbol = %pos.symbol,
                            "Breakeven trigger at {} ({}% of TP1 distance)",
                            current,
                            progress.map(|p| (p * HUNDRED).round_dp(1)).unwrap_or_default()
                        );
                        self.apply_breakeven(view, state, size, &orders).await;
                    }
                }
            }
        }

        if state.manual_protection.is_some() {
            if let Some(current) = self.current_price(&pos.symbol, &mut price).await {
                return self.enforce_manual(view, state, size, current, now).await;
            }
        }

        ProtectionOutcome::Tracking
    }

    async fn current_price(&self, symbol: &Symbol, cached: &mut Option<Decimal>) -> Option<Decimal> {
        if cached.is_none() {
            match self.adapter.fetch_ticker_price(symbol).await {
                Ok(p) if p > Decimal::ZERO => *cached = Some(p),
                Ok(_) => {}
                Err(e) => debug!(symbol = %symbol, "ticker unavailable: {}", e),
            }
        }
        *cached
    }

    /// Records the original size and places TP1/TP2/SL unless the exchange
    /// already has closing orders for this position
    async fn first_sight(&self, view: &PositionView<'_>, state: &mut ProtectiveState) {
        let pos = view.position;
        let size = view.remote.size();
        let levels = target_levels(view.signal, pos.direction, pos.entry_price, self.cfg);
        state.original_size = Some(size);
        state.levels = Some(levels);

        let orders = match self.adapter.fetch_open_orders(&pos.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                // Unknown order state: track manually rather than risk duplicates
                warn!(user = pos.user_id, symbol = %pos.symbol, "fetch_open_orders failed: {}", e);
                state.manual_protection = Some(manual_from(pos, &levels));
                return;
            }
        };

        if has_protective_orders(&orders, pos.direction) {
            debug!(
                user = pos.user_id,
                symbol = %pos.symbol,
                "{} resting protective orders found", orders.len()
            );
            state.phase = ProtectionPhase::Protected;

            let (breakeven, tp1_filled) =
                infer_progress(&orders, pos.direction, pos.entry_price, &levels);
            if breakeven {
                let be_price =
                    breakeven_price(pos.entry_price, pos.direction, self.cfg.breakeven_fee_buffer_pct);
                state.breakeven_applied = true;
                if let Some(levels) = state.levels.as_mut() {
                    levels.sl = be_price;
                }
                info!(
                    user = pos.user_id,
                    symbol = %pos.symbol,
                    "Resting stop already at breakeven (TP1 filled: {})", tp1_filled
                );
            }
            if tp1_filled {
                state.tp1_triggered = true;
                state.phase = ProtectionPhase::Tp1Hit;
            }
            return;
        }

        let (tp1_amount, tp2_amount) = split_amounts(size, self.cfg.tp1_close_fraction);
        let mut placed = 0;

        for (amount, price, tag) in [(tp1_amount, levels.tp1, "tp1"), (tp2_amount, levels.tp2, "tp2")] {
            match self
                .adapter
                .place_take_profit(&pos.symbol, pos.direction, amount, price, tag)
                .await
            {
                Ok(Some(_)) => placed += 1,
                Ok(None) => warn!(user = pos.user_id, symbol = %pos.symbol, "{} placement refused", tag),
                Err(e) => warn!(user = pos.user_id, symbol = %pos.symbol, "{} placement failed: {}", tag, e),
            }
        }
        match self
            .adapter
            .place_stop_loss(&pos.symbol, pos.direction, size, levels.sl)
            .await
        {
            Ok(Some(_)) => placed += 1,
            Ok(None) => warn!(user = pos.user_id, symbol = %pos.symbol, "SL placement refused"),
            Err(e) => warn!(user = pos.user_id, symbol = %pos.symbol, "SL placement failed: {}", e),
        }

        match placed {
            3 => {
                info!(
                    user = pos.user_id,
                    symbol = %pos.symbol,
                    "Protection placed: TP1 {} x{} | TP2 {} x{} | SL {}",
                    levels.tp1.round_dp(6), tp1_amount, levels.tp2.round_dp(6), tp2_amount,
                    levels.sl.round_dp(6)
                );
                state.phase = ProtectionPhase::Protected;
            }
            0 => {
                error!(
                    user = pos.user_id,
                    symbol = %pos.symbol,
                    "No protective order accepted; engine will enforce levels"
                );
                state.phase = ProtectionPhase::NoProtection;
                state.manual_protection = Some(manual_from(pos, &levels));
            }
            n => {
                warn!(
                    user = pos.user_id,
                    symbol = %pos.symbol,
                    "Degraded protection: {}/3 orders placed", n
                );
                state.phase = ProtectionPhase::Protected;
            }
        }
    }

    async fn on_tp1_fill(&self, view: &PositionView<'_>, state: &mut ProtectiveState, original: Decimal) {
        let pos = view.position;
        let size = view.remote.size();
        info!(
            user = pos.user_id,
            symbol = %pos.symbol,
            "TP1 filled: size {} -> {}", original, size
        );
        state.tp1_triggered = true;
        state.phase = ProtectionPhase::Tp1Hit;

        let orders = match self.adapter.fetch_open_orders(&pos.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(user = pos.user_id, symbol = %pos.symbol, "fetch_open_orders failed: {}", e);
                Vec::new()
            }
        };

        if !state.breakeven_applied {
            self.apply_breakeven(view, state, size, &orders).await;
        }

        let levels = state
            .levels
            .unwrap_or_else(|| target_levels(view.signal, pos.direction, pos.entry_price, self.cfg));
        for order in orders
            .iter()
            .filter(|o| is_take_profit_order(o, pos.direction, levels.tp1))
        {
            self.cancel(pos, order).await;
        }
        match self
            .adapter
            .place_take_profit(&pos.symbol, pos.direction, size, levels.tp2, "tp2")
            .await
        {
            Ok(Some(_)) => info!(user = pos.user_id, symbol = %pos.symbol, "TP2 placed for {} @ {}", size, levels.tp2),
            Ok(None) => warn!(user = pos.user_id, symbol = %pos.symbol, "TP2 placement refused"),
            Err(e) => warn!(user = pos.user_id, symbol = %pos.symbol, "TP2 placement failed: {}", e),
        }

        self.notifier
            .notify_user(
                pos.user_id,
                &format!("{} {}: TP1 reached, stop moved to breakeven", pos.symbol, pos.direction),
            )
            .await;
    }

    /// Moves the stop to breakeven; fires at most once per position
    async fn apply_breakeven(
        &self,
        view: &PositionView<'_>,
        state: &mut ProtectiveState,
        size: Decimal,
        orders: &[OpenOrder],
    ) {
        if state.breakeven_applied {
            return;
        }
        let pos = view.position;
        let be_price = breakeven_price(pos.entry_price, pos.direction, self.cfg.breakeven_fee_buffer_pct);
        let tp1 = state
            .levels
            .map(|l| l.tp1)
            .unwrap_or_else(|| target_levels(view.signal, pos.direction, pos.entry_price, self.cfg).tp1);

        for order in orders
            .iter()
            .filter(|o| is_stop_order(o, pos.direction, tp1))
        {
            self.cancel(pos, order).await;
        }

        let placed = match self
            .adapter
            .place_stop_loss(&pos.symbol, pos.direction, size, be_price)
            .await
        {
            Ok(handle) => handle.is_some(),
            Err(e) => {
                warn!(user = pos.user_id, symbol = %pos.symbol, "Breakeven SL failed: {}", e);
                false
            }
        };

        if placed {
            info!(user = pos.user_id, symbol = %pos.symbol, "Breakeven SL placed @ {}", be_price);
        } else {
            // The old stop is gone; enforce the breakeven level locally
            let levels = state
                .levels
                .unwrap_or_else(|| target_levels(view.signal, pos.direction, pos.entry_price, self.cfg));
            let mut mp = state.manual_protection.unwrap_or_else(|| manual_from(pos, &levels));
            mp.sl_price = be_price;
            state.manual_protection = Some(mp);
            warn!(
                user = pos.user_id,
                symbol = %pos.symbol,
                "Breakeven SL not accepted; enforcing {} locally", be_price
            );
        }
        if let Some(levels) = state.levels.as_mut() {
            levels.sl = be_price;
        }
        state.breakeven_applied = true;
    }

    /// Manual protection on when no closing orders rest, off when they do
    fn sync_manual_protection(&self, view: &PositionView<'_>, state: &mut ProtectiveState, protected: bool) {
        let pos = view.position;
        if protected {
            if state.manual_protection.take().is_some() {
                debug!(user = pos.user_id, symbol = %pos.symbol, "Exchange orders back; manual protection off");
            }
            if state.phase == ProtectionPhase::NoProtection {
                state.phase = if state.tp1_triggered {
                    ProtectionPhase::Tp1Hit
                } else {
                    ProtectionPhase::Protected
                };
            }
        } else if state.manual_protection.is_none() {
            let levels = state
                .levels
                .unwrap_or_else(|| target_levels(view.signal, pos.direction, pos.entry_price, self.cfg));
            warn!(
                user = pos.user_id,
                symbol = %pos.symbol,
                "No resting protective orders; manual protection on"
            );
            state.manual_protection = Some(manual_from(pos, &levels));
            state.phase = ProtectionPhase::NoProtection;
        }
    }

    async fn enforce_manual(
        &self,
        view: &PositionView<'_>,
        state: &mut ProtectiveState,
        size: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> ProtectionOutcome {
        let pos = view.position;
        let Some(mp) = state.manual_protection else {
            return ProtectionOutcome::Tracking;
        };
        let Some(decision) = manual_close_decision(&mp, price, state.tp1_triggered, self.cfg) else {
            return ProtectionOutcome::Tracking;
        };

        let amount = (size * decision.fraction).normalize();
        if amount <= Decimal::ZERO {
            return ProtectionOutcome::Tracking;
        }

        warn!(
            user = pos.user_id,
            symbol = %pos.symbol,
            "Manual {} at {}: closing {} of {}", decision.reason, price, amount, size
        );

        match self
            .adapter
            .create_market_order(&pos.symbol, pos.direction.exit_side(), amount)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(user = pos.user_id, symbol = %pos.symbol, "Market close refused");
                return ProtectionOutcome::Tracking;
            }
            Err(e) => {
                warn!(user = pos.user_id, symbol = %pos.symbol, "Market close failed: {}", e);
                return ProtectionOutcome::Tracking;
            }
        }

        self.record_close(pos, amount, price, decision.reason, now);
        self.notifier
            .notify_user(
                pos.user_id,
                &format!(
                    "{} {}: {} hit at {}, closed {}",
                    pos.symbol, pos.direction, decision.reason, price, amount
                ),
            )
            .await;

        if decision.marks_tp1 {
            state.tp1_triggered = true;
            state.phase = ProtectionPhase::Tp1Hit;
            if !state.breakeven_applied {
                let be = breakeven_price(pos.entry_price, pos.direction, self.cfg.breakeven_fee_buffer_pct);
                state.manual_protection = Some(ManualProtection { sl_price: be, ..mp });
                state.breakeven_applied = true;
            }
            ProtectionOutcome::Tracking
        } else {
            state.phase = ProtectionPhase::Closed;
            ProtectionOutcome::ClosedByEngine
        }
    }

    fn record_close(
        &self,
        pos: &PositionRecord,
        quantity: Decimal,
        exit_price: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let (net_pnl, fees, pnl_pct) = realized_pnl(
            pos.direction,
            pos.entry_price,
            exit_price,
            quantity,
            self.cfg.taker_fee_rate,
        );
        let trade = TradeRecord {
            id: None,
            user_id: pos.user_id,
            symbol: pos.symbol.clone(),
            direction: pos.direction,
            quantity,
            entry_price: pos.entry_price,
            exit_price,
            fees,
            net_pnl,
            pnl_pct,
            exit_reason: reason.to_string(),
            trade_mode: pos.trade_mode,
            exit_time: now,
        };
        if let Err(e) = self.store.record_trade(&trade) {
            error!(user = pos.user_id, symbol = %pos.symbol, "Failed to record trade: {:#}", e);
        }
    }

    async fn cancel(&self, pos: &PositionRecord, order: &OpenOrder) {
        match self.adapter.cancel_order(&order.id, &pos.symbol).await {
            Ok(true) => debug!(user = pos.user_id, symbol = %pos.symbol, "Cancelled order {}", order.id),
            Ok(false) => warn!(user = pos.user_id, symbol = %pos.symbol, "Cancel of {} not confirmed", order.id),
            Err(e) => warn!(user = pos.user_id, symbol = %pos.symbol, "Cancel of {} failed: {}", order.id, e),
        }
    }
}

fn manual_from(pos: &PositionRecord, levels: &TargetLevels) -> ManualProtection {
    ManualProtection {
        tp1_price: levels.tp1,
        tp2_price: levels.tp2,
        sl_price: levels.sl,
        entry_price: pos.entry_price,
        direction: pos.direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn cfg() -> ReconcileConfig {
        ReconcileConfig::default()
    }

    #[test]
    fn test_fallback_levels_are_direction_aware() {
        let long = target_levels(None, Direction::Long, dec!(100), &cfg());
        assert_eq!(long, TargetLevels { tp1: dec!(102), tp2: dec!(104), sl: dec!(98) });

        let short = target_levels(None, Direction::Short, dec!(100), &cfg());
        assert_eq!(short, TargetLevels { tp1: dec!(98), tp2: dec!(96), sl: dec!(102) });
    }

    #[test]
    fn test_signal_levels_override_fallback_per_field() {
        let signal = SignalRecord {
            user_id: 1,
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            entry_price: dec!(100),
            tp1_price: Some(dec!(103)),
            tp2_price: None,
            sl_price: Some(Decimal::ZERO),
            signal_token: "t".into(),
        };
        let levels = target_levels(Some(&signal), Direction::Long, dec!(100), &cfg());
        assert_eq!(levels.tp1, dec!(103));
        assert_eq!(levels.tp2, dec!(104));
        assert_eq!(levels.sl, dec!(98));
    }

    #[test]
    fn test_split_amounts_sum_to_size() {
        let (a, b) = split_amounts(dec!(0.015), dec!(0.5));
        assert_eq!(a + b, dec!(0.015));
        assert_eq!(split_amounts(dec!(10), dec!(0.5)), (dec!(5), dec!(5)));
    }

    #[test]
    fn test_breakeven_price_buffer() {
        assert_eq!(breakeven_price(dec!(100), Direction::Long, dec!(0.1)), dec!(100.1));
        assert_eq!(breakeven_price(dec!(100), Direction::Short, dec!(0.1)), dec!(99.9));
    }

    #[test]
    fn test_progress_to_tp1() {
        assert_eq!(progress_to_tp1(Direction::Long, dec!(100), dec!(102), dec!(101)), Some(dec!(0.5)));
        assert_eq!(progress_to_tp1(Direction::Long, dec!(100), dec!(102), dec!(102.5)), None);
        assert_eq!(progress_to_tp1(Direction::Long, dec!(100), dec!(99), dec!(101)), None);
        assert_eq!(progress_to_tp1(Direction::Short, dec!(100), dec!(98), dec!(99.5)), Some(dec!(0.25)));
        let adverse = progress_to_tp1(Direction::Long, dec!(100), dec!(102), dec!(99)).unwrap();
        assert!(adverse < Decimal::ZERO);
    }

    #[test]
    fn test_classify_shrink_bands() {
        let c = cfg();
        assert_eq!(classify_shrink(dec!(10), dec!(10), &c), SizeChange::None);
        assert_eq!(classify_shrink(dec!(10), dec!(5), &c), SizeChange::Tp1Band);
        assert_eq!(classify_shrink(dec!(10), dec!(6), &c), SizeChange::Tp1Band);
        assert_eq!(classify_shrink(dec!(10), dec!(3), &c), SizeChange::None);
        assert_eq!(classify_shrink(dec!(10), dec!(1), &c), SizeChange::FullClose);
        assert_eq!(classify_shrink(dec!(10), dec!(2), &c), SizeChange::None);
    }

    #[test]
    fn test_order_classification() {
        let order = |side, price, kind| OpenOrder { id: "1".into(), side, price, kind };
        let long_tp1 = dec!(110);
        let short_tp1 = dec!(90);

        assert!(is_stop_order(&order(Side::Sell, dec!(98), None), Direction::Long, long_tp1));
        // Breakeven stop just above entry
        assert!(is_stop_order(&order(Side::Sell, dec!(100.1), None), Direction::Long, long_tp1));
        assert!(!is_take_profit_order(&order(Side::Sell, dec!(100.1), None), Direction::Long, long_tp1));
        assert!(is_take_profit_order(&order(Side::Sell, dec!(110), None), Direction::Long, long_tp1));
        assert!(is_take_profit_order(&order(Side::Sell, dec!(120), None), Direction::Long, long_tp1));
        assert!(is_stop_order(&order(Side::Buy, dec!(102), None), Direction::Short, short_tp1));
        assert!(is_stop_order(&order(Side::Buy, dec!(99.9), None), Direction::Short, short_tp1));
        assert!(is_take_profit_order(&order(Side::Buy, dec!(90), None), Direction::Short, short_tp1));
        assert!(is_stop_order(
            &order(Side::Sell, dec!(115), Some(ProtectiveKind::StopLoss)),
            Direction::Long,
            long_tp1
        ));
        assert!(!has_protective_orders(&[order(Side::Buy, dec!(90), None)], Direction::Long));
    }

    #[test]
    fn test_infer_progress_from_resting_orders() {
        let order = |price| OpenOrder { id: "1".into(), side: Side::Sell, price, kind: None };
        let levels = TargetLevels { tp1: dec!(110), tp2: dec!(120), sl: dec!(95) };
        let entry = dec!(100);

        let fresh = [order(dec!(110)), order(dec!(120)), order(dec!(95))];
        assert_eq!(infer_progress(&fresh, Direction::Long, entry, &levels), (false, false));

        let trailed = [order(dec!(110)), order(dec!(120)), order(dec!(100.1))];
        assert_eq!(infer_progress(&trailed, Direction::Long, entry, &levels), (true, false));

        let after_tp1 = [order(dec!(120)), order(dec!(100.1))];
        assert_eq!(infer_progress(&after_tp1, Direction::Long, entry, &levels), (true, true));
    }

    #[test]
    fn test_manual_close_decision_order() {
        let c = cfg();
        let mp = ManualProtection {
            tp1_price: dec!(102),
            tp2_price: dec!(104),
            sl_price: dec!(98),
            entry_price: dec!(100),
            direction: Direction::Long,
        };

        assert!(manual_close_decision(&mp, dec!(101), false, &c).is_none());

        let tp1 = manual_close_decision(&mp, dec!(102.5), false, &c).unwrap();
        assert_eq!((tp1.reason, tp1.fraction, tp1.marks_tp1), ("TP1", dec!(0.5), true));

        // TP2 only counts once TP1 has been taken
        assert_eq!(manual_close_decision(&mp, dec!(104.5), false, &c).unwrap().reason, "TP1");
        assert_eq!(manual_close_decision(&mp, dec!(104.5), true, &c).unwrap().reason, "TP2");

        assert_eq!(manual_close_decision(&mp, dec!(97.9), false, &c).unwrap().reason, "STOP_LOSS");

        let mut wide = mp;
        wide.sl_price = dec!(90);
        assert_eq!(manual_close_decision(&wide, dec!(95), false, &c).unwrap().reason, "EMERGENCY_STOP");
    }

    #[test]
    fn test_realized_pnl_with_fees() {
        let (net, fees, pct) = realized_pnl(Direction::Long, dec!(100), dec!(110), dec!(2), dec!(0.0005));
        assert_eq!(fees, dec!(0.21));
        assert_eq!(net, dec!(19.79));
        assert_eq!(pct, dec!(9.895));

        let (short_net, _, _) = realized_pnl(Direction::Short, dec!(100), dec!(110), dec!(1), Decimal::ZERO);
        assert_eq!(short_net, dec!(-10));
    }
}
