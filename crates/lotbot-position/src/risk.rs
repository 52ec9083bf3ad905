//! Per-position exit risk.
//!
//! Each Active lot carries a [`RiskState`] that is re-evaluated on every
//! price tick for its product:
//!
//! 1. Trailing activation once the favorable excursion reaches the lot's
//!    `trailing_activation_points`.
//! 2. While trailing, the peak follows the market and the stop sits
//!    `pullback_ratio` of the peak excursion behind it.
//! 3. Protective stop once lower-numbered lots of the same group have
//!    realized a profit `R`: `entry ∓ R / protective_multiplier`.
//! 4. Trigger when the price crosses the stop.
//!
//! The stop only ever tightens. A trigger calls the injected
//! [`ExitExecutor`] exactly once per position: evaluation runs under an async
//! mutex keyed by `(position_id, direction)` that stays held across the
//! executor call, and a successful exit removes the slot.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use lotbot_core::{
    now_ms, Direction, ExitReason, GroupId, PositionId, PositionRecord, Price, ProductCode,
    RiskState, UpdateReason,
};
use lotbot_telemetry::Metrics;

use crate::error::{PositionError, PositionResult};

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Configuration
// ============================================================================

fn default_initial_stop_points() -> Decimal {
    Decimal::from(30)
}

fn default_lot_rules() -> Vec<LotRule> {
    vec![
        LotRule::new(Decimal::from(15), Decimal::new(20, 2), None),
        LotRule::new(Decimal::from(40), Decimal::new(20, 2), Some(Decimal::from(2))),
        LotRule::new(Decimal::from(65), Decimal::new(20, 2), Some(Decimal::from(2))),
    ]
}

/// Stop parameters of one lot number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRule {
    /// Favorable excursion (points) that activates the trailing stop.
    pub trailing_activation_points: Decimal,
    /// Fraction of the peak excursion given back before the trailing stop hits.
    pub pullback_ratio: Decimal,
    /// Divisor applied to realized profit of earlier lots; `None` disables
    /// the protective stop for this lot.
    #[serde(default)]
    pub protective_multiplier: Option<Decimal>,
}

impl LotRule {
    pub fn new(
        trailing_activation_points: Decimal,
        pullback_ratio: Decimal,
        protective_multiplier: Option<Decimal>,
    ) -> Self {
        Self {
            trailing_activation_points,
            pullback_ratio,
            protective_multiplier,
        }
    }
}

/// Risk engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Initial stop distance from entry (points).
    #[serde(default = "default_initial_stop_points")]
    pub initial_stop_points: Decimal,
    /// Rules indexed by lot number (lot 1 first). Lots beyond the list use
    /// the last rule.
    #[serde(default = "default_lot_rules")]
    pub lot_rules: Vec<LotRule>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_stop_points: default_initial_stop_points(),
            lot_rules: default_lot_rules(),
        }
    }
}

impl RiskConfig {
    /// Rule for a 1-based lot number.
    pub fn rule(&self, lot_id: u8) -> LotRule {
        let idx = usize::from(lot_id.max(1)) - 1;
        self.lot_rules
            .get(idx)
            .or_else(|| self.lot_rules.last())
            .cloned()
            .unwrap_or_else(|| LotRule::new(Decimal::from(15), Decimal::new(20, 2), None))
    }
}

// ============================================================================
// Exit executor
// ============================================================================

/// A triggered exit handed to the [`ExitExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitTrigger {
    pub position_id: PositionId,
    pub group_id: GroupId,
    pub lot_id: u8,
    pub product: ProductCode,
    pub direction: Direction,
    pub current_price: Price,
    pub stop_price: Price,
    pub reason: ExitReason,
}

/// Result of an exit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error_message: Option<String>,
}

impl ExitResult {
    pub fn ok(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// Places the exit for a triggered position.
///
/// Implementations report failure through [`ExitResult`]; the engine never
/// retries on its own.
pub trait ExitExecutor: Send + Sync {
    fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult>;

    /// Executor name for logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Evaluation
// ============================================================================

/// Key of the per-position evaluation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub position_id: PositionId,
    pub direction: Direction,
}

/// Result of one [`PositionRiskEngine::evaluate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// No trigger. `changes` lists the state updates applied on this tick.
    Holding {
        position_id: PositionId,
        risk: RiskState,
        changes: Vec<UpdateReason>,
    },
    /// Exit executed; the position is Exited and no longer tracked.
    Exited {
        position: PositionRecord,
        trigger: ExitTrigger,
        result: ExitResult,
        realized_points: Decimal,
    },
    /// Exit attempted and failed; the position stays Active.
    ExitFailed {
        position_id: PositionId,
        risk: RiskState,
        trigger: ExitTrigger,
        result: ExitResult,
        changes: Vec<UpdateReason>,
    },
    /// Another evaluation exited the position while this one waited.
    AlreadyExited { position_id: PositionId },
}

#[derive(Debug)]
struct RiskSlot {
    position: PositionRecord,
    entry: Price,
    risk: RiskState,
    /// Rule that produced the current stop.
    stop_source: ExitReason,
    exited: bool,
    failures: u32,
}

impl RiskSlot {
    /// Advance the state for `price`. Returns the reasons of applied changes.
    fn step(&mut self, price: Price, rule: &LotRule, realized: Decimal, now: u64) -> Vec<UpdateReason> {
        let direction = self.position.direction;
        let mut changes = Vec::new();

        if !self.risk.trailing_activated {
            if direction.excursion(self.entry, price) >= rule.trailing_activation_points {
                self.risk.trailing_activated = true;
                if direction.is_more_favorable(price, self.risk.peak_price) {
                    self.risk.peak_price = price;
                }
                self.tighten_trailing(rule);
                changes.push(UpdateReason::TrailingActivation);
            }
        } else if direction.is_more_favorable(price, self.risk.peak_price) {
            self.risk.peak_price = price;
            self.tighten_trailing(rule);
            changes.push(UpdateReason::PriceUpdate);
        }

        if let Some(multiplier) = rule.protective_multiplier {
            if realized > Decimal::ZERO && multiplier > Decimal::ZERO {
                let candidate = direction.favorable_offset(self.entry, -(realized / multiplier));
                if direction.is_tighter_stop(candidate, self.risk.current_stop_loss) {
                    self.risk.current_stop_loss = candidate;
                    self.risk.protection_activated = true;
                    self.stop_source = ExitReason::ProtectiveStop;
                    changes.push(UpdateReason::ProtectiveUpdate);
                }
            }
        }

        if let Some(last) = changes.last() {
            self.risk.update_reason = *last;
            self.risk.last_update_time = now;
        }
        changes
    }

    fn tighten_trailing(&mut self, rule: &LotRule) {
        let direction = self.position.direction;
        let gained = direction.excursion(self.entry, self.risk.peak_price);
        let candidate = direction.favorable_offset(self.risk.peak_price, -(gained * rule.pullback_ratio));
        if direction.is_tighter_stop(candidate, self.risk.current_stop_loss) {
            self.risk.current_stop_loss = candidate;
            self.stop_source = ExitReason::TrailingStop;
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    direction: Direction,
    product: ProductCode,
}

/// Decrements the in-flight counter on drop.
struct InFlight<'a>(&'a PositionRiskEngine);

impl<'a> InFlight<'a> {
    fn enter(engine: &'a PositionRiskEngine) -> Self {
        engine.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(engine)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Exit-risk state machine for all Active positions.
pub struct PositionRiskEngine {
    config: RiskConfig,
    slots: DashMap<LockKey, Arc<Mutex<RiskSlot>>>,
    index: DashMap<PositionId, IndexEntry>,
    /// Realized points per group as `(lot_id, points)`.
    realized: DashMap<GroupId, Vec<(u8, Decimal)>>,
    executor: RwLock<Option<Arc<dyn ExitExecutor>>>,
    in_flight: AtomicUsize,
    idle: Notify,
    closing: AtomicBool,
    exit_count: AtomicU64,
    failure_count: AtomicU64,
}

impl PositionRiskEngine {
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            index: DashMap::new(),
            realized: DashMap::new(),
            executor: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
            exit_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn set_exit_executor(&self, executor: Arc<dyn ExitExecutor>) {
        info!(executor = executor.name(), "Exit executor configured");
        *self.executor.write() = Some(executor);
    }

    /// Start tracking a freshly filled position.
    ///
    /// `origin` is [`UpdateReason::Initialization`] or
    /// [`UpdateReason::FillConfirmedInit`].
    pub fn register(
        &self,
        position: PositionRecord,
        origin: UpdateReason,
    ) -> PositionResult<RiskState> {
        if !matches!(
            origin,
            UpdateReason::Initialization | UpdateReason::FillConfirmedInit
        ) {
            return Err(PositionError::InvalidState(format!(
                "{origin} is not a registration origin"
            )));
        }
        let entry = active_entry(&position)?;
        let stop = position
            .direction
            .favorable_offset(entry, -self.config.initial_stop_points);
        let risk = RiskState {
            peak_price: entry,
            current_stop_loss: stop,
            trailing_activated: false,
            protection_activated: false,
            last_update_time: now_ms(),
            update_reason: origin,
        };
        self.insert(position, entry, risk.clone(), ExitReason::InitialStop)?;
        Ok(risk)
    }

    /// Re-seed a position from a persisted risk state.
    pub fn restore(&self, position: PositionRecord, risk: RiskState) -> PositionResult<()> {
        let entry = active_entry(&position)?;
        let stop_source = if risk.protection_activated {
            ExitReason::ProtectiveStop
        } else if risk.trailing_activated {
            ExitReason::TrailingStop
        } else {
            ExitReason::InitialStop
        };
        self.insert(position, entry, risk, stop_source)
    }

    fn insert(
        &self,
        position: PositionRecord,
        entry: Price,
        risk: RiskState,
        stop_source: ExitReason,
    ) -> PositionResult<()> {
        let key = LockKey {
            position_id: position.position_id,
            direction: position.direction,
        };
        match self.index.entry(position.position_id) {
            Entry::Occupied(_) => {
                return Err(PositionError::InvalidState(format!(
                    "{} already registered",
                    position.position_id
                )))
            }
            Entry::Vacant(v) => {
                v.insert(IndexEntry {
                    direction: position.direction,
                    product: position.product.clone(),
                });
            }
        }

        debug!(
            position_id = %position.position_id,
            group_id = %position.group_id,
            lot_id = position.lot_id,
            direction = %position.direction,
            entry = %entry,
            stop = %risk.current_stop_loss,
            reason = %risk.update_reason,
            "Risk tracking started"
        );
        self.slots.insert(
            key,
            Arc::new(Mutex::new(RiskSlot {
                position,
                entry,
                risk,
                stop_source,
                exited: false,
                failures: 0,
            })),
        );
        Ok(())
    }

    /// Record realized points of an exited lot for protective-stop purposes.
    pub fn record_realized(&self, group_id: GroupId, lot_id: u8, points: Decimal) {
        self.realized.entry(group_id).or_default().push((lot_id, points));
    }

    /// Drop the realized points of a group whose lots can no longer trade.
    pub fn forget_group(&self, group_id: GroupId) {
        if self.realized.remove(&group_id).is_some() {
            debug!(group_id = %group_id, "Realized points released");
        }
    }

    /// Groups with recorded realized points.
    pub fn realized_group_count(&self) -> usize {
        self.realized.len()
    }

    /// Realized points of lots numbered below `lot_id`.
    fn realized_before(&self, group_id: GroupId, lot_id: u8) -> Decimal {
        self.realized
            .get(&group_id)
            .map(|lots| {
                lots.iter()
                    .filter(|(lot, _)| *lot < lot_id)
                    .map(|(_, points)| *points)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// Evaluate one position against `price`.
    pub async fn evaluate(
        &self,
        position_id: PositionId,
        price: Price,
    ) -> PositionResult<Evaluation> {
        let _in_flight = InFlight::enter(self);
        if self.closing.load(Ordering::Acquire) {
            return Err(PositionError::ShuttingDown);
        }

        let direction = self
            .index
            .get(&position_id)
            .map(|e| e.direction)
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;
        let key = LockKey {
            position_id,
            direction,
        };
        let slot = self
            .slots
            .get(&key)
            .map(|s| s.clone())
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;

        let mut slot = slot.lock().await;
        if slot.exited {
            return Ok(Evaluation::AlreadyExited { position_id });
        }

        let rule = self.config.rule(slot.position.lot_id);
        let realized = self.realized_before(slot.position.group_id, slot.position.lot_id);
        let changes = slot.step(price, &rule, realized, now_ms());
        for change in &changes {
            debug!(
                position_id = %position_id,
                reason = %change,
                peak = %slot.risk.peak_price,
                stop = %slot.risk.current_stop_loss,
                "Risk state updated"
            );
        }

        if !direction.is_stop_hit(price, slot.risk.current_stop_loss) {
            return Ok(Evaluation::Holding {
                position_id,
                risk: slot.risk.clone(),
                changes,
            });
        }

        let trigger = ExitTrigger {
            position_id,
            group_id: slot.position.group_id,
            lot_id: slot.position.lot_id,
            product: slot.position.product.clone(),
            direction,
            current_price: price,
            stop_price: slot.risk.current_stop_loss,
            reason: slot.stop_source,
        };
        info!(
            position_id = %position_id,
            group_id = %trigger.group_id,
            direction = %direction,
            price = %price,
            stop = %trigger.stop_price,
            reason = %trigger.reason,
            "Exit triggered"
        );

        let executor = self.executor.read().clone();
        let result = match executor {
            Some(executor) => executor.execute(trigger.clone()).await,
            None => ExitResult::failed("no exit executor configured"),
        };

        if !result.success {
            slot.failures += 1;
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            Metrics::exit_result("failed");
            warn!(
                position_id = %position_id,
                failures = slot.failures,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Exit failed, position stays active"
            );
            return Ok(Evaluation::ExitFailed {
                position_id,
                risk: slot.risk.clone(),
                trigger,
                result,
                changes,
            });
        }

        let realized_points = direction.excursion(slot.entry, price);
        slot.exited = true;
        slot.position.exit(price, trigger.reason, now_ms());
        self.record_realized(trigger.group_id, trigger.lot_id, realized_points);
        self.slots.remove(&key);
        self.index.remove(&position_id);
        self.exit_count.fetch_add(1, Ordering::Relaxed);
        Metrics::exit_result("success");

        info!(
            position_id = %position_id,
            group_id = %trigger.group_id,
            order_id = result.order_id.as_deref().unwrap_or("-"),
            realized_points = %realized_points,
            "Position exited"
        );
        Ok(Evaluation::Exited {
            position: slot.position.clone(),
            trigger,
            result,
            realized_points,
        })
    }

    /// Positions tracked for `product`, ordered by id.
    pub fn active_positions(&self, product: &ProductCode) -> Vec<PositionId> {
        let mut ids: Vec<PositionId> = self
            .index
            .iter()
            .filter(|e| &e.value().product == product)
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Current risk state of a tracked position.
    pub async fn risk_state(&self, position_id: PositionId) -> Option<RiskState> {
        let direction = self.index.get(&position_id).map(|e| e.direction)?;
        let slot = self
            .slots
            .get(&LockKey {
                position_id,
                direction,
            })
            .map(|s| s.clone())?;
        let slot = slot.lock().await;
        (!slot.exited).then(|| slot.risk.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn exit_count(&self) -> u64 {
        self.exit_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Refuse new evaluations. In-flight ones run to completion.
    pub fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            info!(
                in_flight = self.in_flight.load(Ordering::Acquire),
                "Risk engine shutting down"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Wait until no evaluation (and therefore no executor call) is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PositionRiskEngine {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

fn active_entry(position: &PositionRecord) -> PositionResult<Price> {
    match position.entry_price {
        Some(entry) if position.is_active() => Ok(entry),
        _ => Err(PositionError::InvalidState(format!(
            "{} is {:?} without a fill price",
            position.position_id, position.status
        ))),
    }
}
