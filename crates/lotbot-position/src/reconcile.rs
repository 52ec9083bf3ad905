//! FIFO reconciliation of broker reports onto strategy-group lots.
//!
//! Broker fill, cancel and reject reports carry no internal group or lot
//! identifier. The reconciler maps each reported unit onto the oldest
//! unmatched lot of the oldest open group for the same product (and
//! direction, when the report carries one).
//!
//! # Serialization
//!
//! Each product has its own book behind a `parking_lot::Mutex`.
//! Reports for different products never contend. Sequence-id de-duplication
//! lives inside the book, so checking and applying a report is one atomic
//! step: a replayed report is either fully applied once or reported as
//! [`MatchOutcome::Duplicate`].
//!
//! # Unmatched fills
//!
//! A fill that finds no lot (typically because the report raced ahead of
//! the submission bookkeeping) is retained for `unmatched_retention_ms` and
//! retried whenever new lots are submitted for the product.
//! [`FifoReconciler::sweep_orphans`] drops expired retained fills.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lotbot_core::{
    now_ms, Direction, ExitReason, FillEvent, GroupId, GroupStatus, NewGroup, OrderStatus,
    PositionId, PositionRecord, PositionStatus, ProductCode, ReportType, SequenceId,
    StrategyGroup, MAX_RETRY_COUNT,
};
use lotbot_telemetry::Metrics;

use crate::error::{ReconcileError, ReconcileResult};

// ============================================================================
// Configuration
// ============================================================================

fn default_dedup_window() -> usize {
    100_000
}

fn default_unmatched_retention_ms() -> u64 {
    5_000
}

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Number of recent sequence ids remembered per product.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// How long an unmatched fill is kept for a late match.
    #[serde(default = "default_unmatched_retention_ms")]
    pub unmatched_retention_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            unmatched_retention_ms: default_unmatched_retention_ms(),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// One reported unit matched to a lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillMatch {
    pub sequence_id: SequenceId,
    /// Group snapshot after the fill was applied.
    pub group: StrategyGroup,
    /// The lot, now Active.
    pub position: PositionRecord,
    /// Whether this fill completed the group.
    pub completed: bool,
}

/// One cancelled or rejected unit released from a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseMatch {
    pub sequence_id: SequenceId,
    pub report_type: ReportType,
    pub group: StrategyGroup,
    /// The lot, now Failed.
    pub position: PositionRecord,
}

/// Result of applying one report unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Filled(FillMatch),
    Released(ReleaseMatch),
    /// Sequence id already applied; nothing changed.
    Duplicate(SequenceId),
    /// No group could take the unit.
    Unmatched {
        sequence_id: SequenceId,
        report_type: ReportType,
        quantity: u32,
        retained: bool,
    },
    /// Only complete groups matched; the fill was not applied.
    AfterComplete {
        sequence_id: SequenceId,
        group_id: GroupId,
    },
}

impl MatchOutcome {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Filled(_) => "filled",
            Self::Released(_) => "released",
            Self::Duplicate(_) => "duplicate",
            Self::Unmatched { .. } => "unmatched",
            Self::AfterComplete { .. } => "after_complete",
        }
    }
}

/// Result of [`FifoReconciler::submit_lots`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitResult {
    /// Newly enqueued Pending lots, lot ids ascending.
    pub positions: Vec<PositionRecord>,
    /// Retained fills that matched once the lots were enqueued.
    pub late_matches: Vec<MatchOutcome>,
}

/// Result of [`FifoReconciler::cancel_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledGroup {
    pub group: StrategyGroup,
    /// Lots that were still Pending and are now Failed.
    pub released: Vec<PositionRecord>,
}

// ============================================================================
// Product book
// ============================================================================

#[derive(Debug)]
struct GroupBook {
    group: StrategyGroup,
    records: Vec<PositionRecord>,
    /// Pending lots in submission order.
    pending: VecDeque<PositionId>,
}

impl GroupBook {
    fn record_mut(&mut self, id: PositionId) -> Option<&mut PositionRecord> {
        self.records.iter_mut().find(|r| r.position_id == id)
    }

    /// Lot ids not held by a Pending, Active or Exited record.
    fn free_lot_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=self.group.total_lots).filter(move |lot| {
            !self
                .records
                .iter()
                .any(|r| r.lot_id == *lot && r.status != PositionStatus::Failed)
        })
    }

    fn matches_direction(&self, direction: Option<Direction>) -> bool {
        direction.map_or(true, |d| d == self.group.direction)
    }
}

#[derive(Debug)]
struct RetainedFill {
    event: FillEvent,
    retained_at: u64,
}

#[derive(Debug, Default)]
struct ProductBook {
    /// Groups keyed by id; iteration order is creation order.
    groups: BTreeMap<GroupId, GroupBook>,
    seen: HashSet<SequenceId>,
    seen_order: VecDeque<SequenceId>,
    retained: VecDeque<RetainedFill>,
}

impl ProductBook {
    /// Remember `seq`; returns false if it was already seen.
    fn remember(&mut self, seq: &SequenceId, window: usize) -> bool {
        if !self.seen.insert(seq.clone()) {
            return false;
        }
        self.seen_order.push_back(seq.clone());
        while self.seen_order.len() > window.max(1) {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    fn match_fill(&mut self, event: &FillEvent, now: u64) -> Option<MatchOutcome> {
        let book = self.groups.values_mut().find(|g| {
            g.group.has_fill_capacity() && !g.pending.is_empty() && g.matches_direction(event.direction)
        })?;

        let position_id = book.pending.pop_front()?;
        book.group.filled_lots += 1;
        if book.group.filled_lots == book.group.total_lots {
            book.group.status = GroupStatus::Complete;
        }
        let completed = book.group.status == GroupStatus::Complete;
        let group = book.group.clone();
        let record = book.record_mut(position_id)?;
        record.activate(event.price, now);
        record.report_sequence_id = Some(event.sequence_id.clone());

        info!(
            group_id = %group.group_id,
            position_id = %position_id,
            lot_id = record.lot_id,
            price = %event.price,
            filled_lots = group.filled_lots,
            total_lots = group.total_lots,
            sequence_id = %event.sequence_id,
            "Fill matched"
        );

        Some(MatchOutcome::Filled(FillMatch {
            sequence_id: event.sequence_id.clone(),
            group,
            position: record.clone(),
            completed,
        }))
    }

    fn match_release(&mut self, event: &FillEvent, now: u64) -> Option<MatchOutcome> {
        let book = self.groups.values_mut().find(|g| {
            g.group.is_open() && !g.pending.is_empty() && g.matches_direction(event.direction)
        })?;

        let position_id = book.pending.pop_front()?;
        book.group.submitted_lots = book.group.submitted_lots.saturating_sub(1);
        let group = book.group.clone();
        let (order_status, reason) = match event.report_type {
            ReportType::Rejected => (OrderStatus::Rejected, ExitReason::OrderRejected),
            _ => (OrderStatus::Cancelled, ExitReason::OrderCancelled),
        };
        let record = book.record_mut(position_id)?;
        record.fail(order_status, reason, now);
        record.report_sequence_id = Some(event.sequence_id.clone());

        info!(
            group_id = %group.group_id,
            position_id = %position_id,
            lot_id = record.lot_id,
            report_type = %event.report_type,
            submitted_lots = group.submitted_lots,
            sequence_id = %event.sequence_id,
            "Lot released"
        );

        Some(MatchOutcome::Released(ReleaseMatch {
            sequence_id: event.sequence_id.clone(),
            report_type: event.report_type,
            group,
            position: record.clone(),
        }))
    }

    /// Oldest Complete group matching `direction`, unless an Open group
    /// could still take the fill once its lots are submitted.
    fn completed_match(&self, direction: Option<Direction>) -> Option<GroupId> {
        let matching = || self.groups.values().filter(move |g| g.matches_direction(direction));
        if matching().any(|g| g.group.is_open()) {
            return None;
        }
        matching()
            .find(|g| g.group.status == GroupStatus::Complete)
            .map(|g| g.group.group_id)
    }

    /// Apply `quantity` units of `event`, stopping at the first unit that
    /// finds no lot. Returns the outcomes and the unapplied quantity.
    fn apply_units(&mut self, event: &FillEvent, now: u64) -> (Vec<MatchOutcome>, u32) {
        let mut outcomes = Vec::new();
        for applied in 0..event.quantity {
            let outcome = if event.report_type == ReportType::Filled {
                self.match_fill(event, now)
            } else {
                self.match_release(event, now)
            };
            match outcome {
                Some(o) => outcomes.push(o),
                None => return (outcomes, event.quantity - applied),
            }
        }
        (outcomes, 0)
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// FIFO reconciliation engine.
///
/// The single owner of group and lot state. All mutations of
/// [`StrategyGroup`] and lot [`PositionRecord`]s (up to Active) go through here.
pub struct FifoReconciler {
    config: ReconcileConfig,
    books: DashMap<ProductCode, Arc<Mutex<ProductBook>>>,
    group_products: DashMap<GroupId, ProductCode>,
    next_group_id: AtomicU64,
    next_position_id: AtomicU64,
}

impl FifoReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            books: DashMap::new(),
            group_products: DashMap::new(),
            next_group_id: AtomicU64::new(1),
            next_position_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    fn book(&self, product: &ProductCode) -> Arc<Mutex<ProductBook>> {
        self.books.entry(product.clone()).or_default().clone()
    }

    fn book_for_group(&self, group_id: GroupId) -> ReconcileResult<Arc<Mutex<ProductBook>>> {
        let product = self
            .group_products
            .get(&group_id)
            .map(|p| p.clone())
            .ok_or(ReconcileError::GroupNotFound(group_id))?;
        Ok(self.book(&product))
    }

    fn next_position_id(&self) -> PositionId {
        PositionId(self.next_position_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Open a new strategy group.
    pub fn open_group(&self, params: NewGroup) -> ReconcileResult<StrategyGroup> {
        params.validate()?;
        let group_id = GroupId(self.next_group_id.fetch_add(1, Ordering::Relaxed));
        let group = StrategyGroup::new(group_id, params, now_ms());

        let book = self.book(&group.product);
        book.lock().groups.insert(
            group_id,
            GroupBook {
                group: group.clone(),
                records: Vec::new(),
                pending: VecDeque::new(),
            },
        );
        self.group_products.insert(group_id, group.product.clone());

        info!(
            group_id = %group_id,
            product = %group.product,
            direction = %group.direction,
            target_price = %group.target_price,
            total_lots = group.total_lots,
            "Group opened"
        );
        Ok(group)
    }

    /// Enqueue `count` Pending lots for an open group.
    pub fn submit_lots(
        &self,
        group_id: GroupId,
        count: u8,
        max_slippage_points: Decimal,
    ) -> ReconcileResult<SubmitResult> {
        let book = self.book_for_group(group_id)?;
        let mut book = book.lock();
        let now = now_ms();

        let positions = {
            let group_book = book
                .groups
                .get_mut(&group_id)
                .ok_or(ReconcileError::GroupNotFound(group_id))?;
            if !group_book.group.is_open() {
                return Err(ReconcileError::GroupNotOpen(group_id));
            }
            let available = group_book.group.unsubmitted_lots();
            if count == 0 || count > available {
                return Err(ReconcileError::LotCapacityExceeded {
                    group_id,
                    requested: count,
                    available,
                });
            }

            let lot_ids: Vec<u8> = group_book.free_lot_ids().take(count as usize).collect();
            let mut positions = Vec::with_capacity(lot_ids.len());
            for lot_id in lot_ids {
                let record = PositionRecord::pending(
                    self.next_position_id(),
                    group_id,
                    lot_id,
                    group_book.group.product.clone(),
                    group_book.group.direction,
                    0,
                    max_slippage_points,
                    now,
                );
                group_book.pending.push_back(record.position_id);
                group_book.records.push(record.clone());
                positions.push(record);
            }
            group_book.group.submitted_lots += positions.len() as u8;
            debug!(
                group_id = %group_id,
                submitted_lots = group_book.group.submitted_lots,
                count = positions.len(),
                "Lots submitted"
            );
            positions
        };

        let late_matches = self.retry_retained(&mut book, now);
        Ok(SubmitResult {
            positions,
            late_matches,
        })
    }

    /// Re-queue a Failed lot as a new Pending record.
    pub fn resubmit_lot(
        &self,
        group_id: GroupId,
        failed_position_id: PositionId,
    ) -> ReconcileResult<PositionRecord> {
        let book = self.book_for_group(group_id)?;
        let mut book = book.lock();
        let group_book = book
            .groups
            .get_mut(&group_id)
            .ok_or(ReconcileError::GroupNotFound(group_id))?;
        if !group_book.group.is_open() {
            return Err(ReconcileError::GroupNotOpen(group_id));
        }

        let failed = group_book
            .records
            .iter()
            .find(|r| r.position_id == failed_position_id)
            .cloned()
            .ok_or(ReconcileError::PositionNotFound(failed_position_id))?;
        let released_by_broker = matches!(
            failed.order_status,
            Some(OrderStatus::Cancelled | OrderStatus::Rejected)
        );
        if failed.status != PositionStatus::Failed || !released_by_broker {
            return Err(ReconcileError::InvalidLotState(format!(
                "{failed_position_id} is {:?}, only cancelled or rejected lots can be resubmitted",
                failed.status
            )));
        }
        if failed.retry_count >= MAX_RETRY_COUNT {
            return Err(ReconcileError::RetryLimitExceeded(failed_position_id));
        }
        if !group_book.free_lot_ids().any(|lot| lot == failed.lot_id) {
            return Err(ReconcileError::InvalidLotState(format!(
                "lot {} of {group_id} is already held",
                failed.lot_id
            )));
        }
        let available = group_book.group.unsubmitted_lots();
        if available == 0 {
            return Err(ReconcileError::LotCapacityExceeded {
                group_id,
                requested: 1,
                available,
            });
        }

        let record = PositionRecord::pending(
            self.next_position_id(),
            group_id,
            failed.lot_id,
            failed.product.clone(),
            failed.direction,
            failed.retry_count + 1,
            failed.max_slippage_points,
            now_ms(),
        );
        group_book.pending.push_back(record.position_id);
        group_book.records.push(record.clone());
        group_book.group.submitted_lots += 1;

        info!(
            group_id = %group_id,
            failed_position_id = %failed_position_id,
            position_id = %record.position_id,
            lot_id = record.lot_id,
            retry_count = record.retry_count,
            "Lot resubmitted"
        );
        Ok(record)
    }

    /// Fail Pending lots whose entry order never reached the broker.
    ///
    /// Ids that are no longer Pending are skipped. The failed records can be
    /// retried with [`FifoReconciler::resubmit_lot`].
    pub fn abandon_lots(
        &self,
        group_id: GroupId,
        position_ids: &[PositionId],
    ) -> ReconcileResult<Vec<PositionRecord>> {
        let book = self.book_for_group(group_id)?;
        let mut book = book.lock();
        let group_book = book
            .groups
            .get_mut(&group_id)
            .ok_or(ReconcileError::GroupNotFound(group_id))?;

        let now = now_ms();
        let mut failed = Vec::with_capacity(position_ids.len());
        for id in position_ids {
            let Some(idx) = group_book.pending.iter().position(|p| p == id) else {
                continue;
            };
            group_book.pending.remove(idx);
            group_book.group.submitted_lots = group_book.group.submitted_lots.saturating_sub(1);
            if let Some(record) = group_book.record_mut(*id) {
                record.fail(OrderStatus::Rejected, ExitReason::OrderRejected, now);
                failed.push(record.clone());
            }
        }

        warn!(
            group_id = %group_id,
            abandoned = failed.len(),
            submitted_lots = group_book.group.submitted_lots,
            "Lots abandoned before reaching the broker"
        );
        Ok(failed)
    }

    /// Cancel a group, failing every lot that is still Pending.
    pub fn cancel_group(&self, group_id: GroupId) -> ReconcileResult<CancelledGroup> {
        let book = self.book_for_group(group_id)?;
        let mut book = book.lock();
        let group_book = book
            .groups
            .get_mut(&group_id)
            .ok_or(ReconcileError::GroupNotFound(group_id))?;
        if !group_book.group.is_open() {
            return Err(ReconcileError::GroupNotOpen(group_id));
        }

        let now = now_ms();
        let pending: Vec<PositionId> = group_book.pending.drain(..).collect();
        let mut released = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(record) = group_book.record_mut(id) {
                record.fail(OrderStatus::Cancelled, ExitReason::GroupCancelled, now);
                released.push(record.clone());
            }
        }
        group_book.group.submitted_lots = group_book.group.filled_lots;
        group_book.group.status = GroupStatus::Cancelled;

        info!(
            group_id = %group_id,
            released = released.len(),
            filled_lots = group_book.group.filled_lots,
            "Group cancelled"
        );
        Ok(CancelledGroup {
            group: group_book.group.clone(),
            released,
        })
    }

    /// Apply one broker report.
    ///
    /// Returns one outcome per matched unit, followed by at most one
    /// `Unmatched` or `AfterComplete` outcome for the remainder. A replayed
    /// sequence id yields a single `Duplicate`.
    pub fn apply(&self, event: &FillEvent) -> Vec<MatchOutcome> {
        let book = self.book(&event.product);
        let mut book = book.lock();

        if !book.remember(&event.sequence_id, self.config.dedup_window) {
            debug!(sequence_id = %event.sequence_id, "Skipping duplicate report");
            Metrics::fill_outcome("duplicate");
            return vec![MatchOutcome::Duplicate(event.sequence_id.clone())];
        }

        let now = now_ms();
        let (mut outcomes, remaining) = book.apply_units(event, now);
        if remaining > 0 {
            outcomes.push(self.unplaced(&mut book, event, remaining, now));
        }
        for outcome in &outcomes {
            Metrics::fill_outcome(outcome.label());
        }
        outcomes
    }

    fn unplaced(
        &self,
        book: &mut ProductBook,
        event: &FillEvent,
        remaining: u32,
        now: u64,
    ) -> MatchOutcome {
        if event.report_type == ReportType::Filled {
            if let Some(group_id) = book.completed_match(event.direction) {
                warn!(
                    sequence_id = %event.sequence_id,
                    group_id = %group_id,
                    product = %event.product,
                    quantity = remaining,
                    "UnexpectedFillAfterComplete"
                );
                return MatchOutcome::AfterComplete {
                    sequence_id: event.sequence_id.clone(),
                    group_id,
                };
            }
        }

        let retained = event.report_type == ReportType::Filled;
        warn!(
            sequence_id = %event.sequence_id,
            product = %event.product,
            report_type = %event.report_type,
            quantity = remaining,
            retained,
            "UnmatchedFill"
        );
        if retained {
            book.retained.push_back(RetainedFill {
                event: FillEvent {
                    quantity: remaining,
                    ..event.clone()
                },
                retained_at: now,
            });
        }
        MatchOutcome::Unmatched {
            sequence_id: event.sequence_id.clone(),
            report_type: event.report_type,
            quantity: remaining,
            retained,
        }
    }

    /// Retry retained fills against the book, oldest first.
    fn retry_retained(&self, book: &mut ProductBook, now: u64) -> Vec<MatchOutcome> {
        let mut outcomes = Vec::new();
        let mut still_retained = VecDeque::new();
        while let Some(mut retained) = book.retained.pop_front() {
            let (matched, remaining) = book.apply_units(&retained.event, now);
            if !matched.is_empty() {
                debug!(
                    sequence_id = %retained.event.sequence_id,
                    matched = matched.len(),
                    remaining,
                    "Retained fill matched late"
                );
            }
            for outcome in &matched {
                Metrics::fill_outcome(outcome.label());
            }
            outcomes.extend(matched);
            if remaining > 0 {
                retained.event.quantity = remaining;
                still_retained.push_back(retained);
            }
        }
        book.retained = still_retained;
        outcomes
    }

    /// Drop retained fills older than the retention window.
    ///
    /// Returns the dropped (orphaned) fills.
    pub fn sweep_orphans(&self, now: u64) -> Vec<FillEvent> {
        let retention = self.config.unmatched_retention_ms;
        let books: Vec<Arc<Mutex<ProductBook>>> =
            self.books.iter().map(|e| e.value().clone()).collect();

        let mut orphaned = Vec::new();
        for book in books {
            let mut book = book.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = book
                .retained
                .drain(..)
                .partition(|r| now.saturating_sub(r.retained_at) >= retention);
            book.retained = kept;
            for r in expired {
                warn!(
                    sequence_id = %r.event.sequence_id,
                    product = %r.event.product,
                    quantity = r.event.quantity,
                    price = %r.event.price,
                    "Orphaned fill dropped"
                );
                orphaned.push(r.event);
            }
        }
        orphaned
    }

    /// Snapshot of a group.
    pub fn group(&self, group_id: GroupId) -> Option<StrategyGroup> {
        let book = self.book_for_group(group_id).ok()?;
        let book = book.lock();
        book.groups.get(&group_id).map(|g| g.group.clone())
    }

    /// Open groups for `product`, oldest first.
    pub fn open_groups(&self, product: &ProductCode) -> Vec<StrategyGroup> {
        let Some(book) = self.books.get(product).map(|b| b.clone()) else {
            return Vec::new();
        };
        let book = book.lock();
        book.groups
            .values()
            .filter(|g| g.group.is_open())
            .map(|g| g.group.clone())
            .collect()
    }

    /// All lot records of a group, in submission order.
    pub fn positions(&self, group_id: GroupId) -> Vec<PositionRecord> {
        let Ok(book) = self.book_for_group(group_id) else {
            return Vec::new();
        };
        let book = book.lock();
        book.groups
            .get(&group_id)
            .map(|g| g.records.clone())
            .unwrap_or_default()
    }

    /// Number of retained unmatched fills across all products.
    pub fn retained_count(&self) -> usize {
        self.books.iter().map(|e| e.value().lock().retained.len()).sum()
    }

    /// Record a lot exit on its record.
    ///
    /// Exits are decided by the risk engine; the reconciler only mirrors the
    /// final state so snapshots stay consistent.
    pub fn mark_exited(&self, exited: &PositionRecord) -> ReconcileResult<()> {
        let book = self.book_for_group(exited.group_id)?;
        let mut book = book.lock();
        let record = book
            .groups
            .get_mut(&exited.group_id)
            .and_then(|g| g.record_mut(exited.position_id))
            .ok_or(ReconcileError::PositionNotFound(exited.position_id))?;
        if record.status != PositionStatus::Active {
            return Err(ReconcileError::InvalidLotState(format!(
                "{} is {:?}, expected Active",
                exited.position_id, record.status
            )));
        }
        *record = exited.clone();
        Ok(())
    }

    /// Reinstate a persisted group and its lot records.
    ///
    /// Pending records go back on the FIFO queue in position-id order. The
    /// id counters move past every restored id, and the report sequence ids
    /// recorded on the lots are remembered so a redelivered report is
    /// reported as [`MatchOutcome::Duplicate`].
    pub fn restore_group(
        &self,
        group: StrategyGroup,
        mut records: Vec<PositionRecord>,
    ) -> ReconcileResult<()> {
        if records.iter().any(|r| r.group_id != group.group_id) {
            return Err(ReconcileError::InvalidLotState(format!(
                "records for {} include foreign lots",
                group.group_id
            )));
        }
        records.sort_by_key(|r| r.position_id);
        let pending: VecDeque<PositionId> = records
            .iter()
            .filter(|r| r.status == PositionStatus::Pending)
            .map(|r| r.position_id)
            .collect();

        self.next_group_id
            .fetch_max(group.group_id.0 + 1, Ordering::Relaxed);
        if let Some(max_id) = records.iter().map(|r| r.position_id.0).max() {
            self.next_position_id
                .fetch_max(max_id + 1, Ordering::Relaxed);
        }

        let group_id = group.group_id;
        let product = group.product.clone();
        info!(
            group_id = %group_id,
            status = ?group.status,
            filled_lots = group.filled_lots,
            records = records.len(),
            pending = pending.len(),
            "Group restored"
        );
        let book = self.book(&product);
        let mut book = book.lock();
        for seq in records.iter().filter_map(|r| r.report_sequence_id.as_ref()) {
            book.remember(seq, self.config.dedup_window);
        }
        book.groups.insert(
            group_id,
            GroupBook {
                group,
                records,
                pending,
            },
        );
        drop(book);
        self.group_products.insert(group_id, product);
        Ok(())
    }
}

impl Default for FifoReconciler {
    fn default() -> Self {
        Self::new(ReconcileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotbot_core::Price;
    use rust_decimal_macros::dec;

    fn product() -> ProductCode {
        ProductCode::new("MTX00")
    }

    fn new_group(direction: Direction, lots: u8) -> NewGroup {
        NewGroup {
            direction,
            product: product(),
            target_price: Price::new(dec!(22573)),
            total_lots: lots,
        }
    }

    fn fill(seq: &str, price: Decimal, qty: u32, direction: Option<Direction>) -> FillEvent {
        FillEvent::filled(product(), Price::new(price), qty, SequenceId::new(seq), direction)
    }

    fn release(seq: &str, report_type: ReportType) -> FillEvent {
        FillEvent {
            report_type,
            ..fill(seq, dec!(0), 1, None)
        }
    }

    fn filled_count(outcomes: &[MatchOutcome]) -> usize {
        outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::Filled(_)))
            .count()
    }

    #[test]
    fn test_short_three_lot_scenario() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Short, 3)).unwrap();
        let submitted = r.submit_lots(g.group_id, 3, dec!(5)).unwrap();
        assert_eq!(submitted.positions.len(), 3);
        assert_eq!(
            submitted.positions.iter().map(|p| p.lot_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        r.apply(&fill("1", dec!(22574), 1, Some(Direction::Short)));
        r.apply(&fill("2", dec!(22573), 1, Some(Direction::Short)));
        let last = r.apply(&fill("3", dec!(22573), 1, Some(Direction::Short)));

        let MatchOutcome::Filled(m) = &last[0] else {
            panic!("expected fill, got {last:?}");
        };
        assert!(m.completed);

        let group = r.group(g.group_id).unwrap();
        assert_eq!(group.status, GroupStatus::Complete);
        assert_eq!(group.filled_lots, 3);

        let prices: Vec<_> = r
            .positions(g.group_id)
            .iter()
            .map(|p| p.entry_price.unwrap().inner())
            .collect();
        assert_eq!(prices, vec![dec!(22574), dec!(22573), dec!(22573)]);
        assert!(r.positions(g.group_id).iter().all(|p| p.is_active()));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 3)).unwrap();
        r.submit_lots(g.group_id, 3, dec!(5)).unwrap();

        let event = fill("100", dec!(22500), 2, None);
        assert_eq!(filled_count(&r.apply(&event)), 2);
        let replay = r.apply(&event);
        assert_eq!(replay, vec![MatchOutcome::Duplicate(SequenceId::new("100"))]);
        assert_eq!(r.group(g.group_id).unwrap().filled_lots, 2);
    }

    #[test]
    fn test_fifo_across_groups() {
        let r = FifoReconciler::default();
        let g1 = r.open_group(new_group(Direction::Long, 1)).unwrap();
        let g2 = r.open_group(new_group(Direction::Long, 2)).unwrap();
        r.submit_lots(g2.group_id, 2, dec!(5)).unwrap();
        r.submit_lots(g1.group_id, 1, dec!(5)).unwrap();

        let out = r.apply(&fill("1", dec!(22500), 1, None));
        let MatchOutcome::Filled(m) = &out[0] else {
            panic!("expected fill");
        };
        assert_eq!(m.group.group_id, g1.group_id);

        let out = r.apply(&fill("2", dec!(22501), 1, None));
        let MatchOutcome::Filled(m) = &out[0] else {
            panic!("expected fill");
        };
        assert_eq!(m.group.group_id, g2.group_id);
    }

    #[test]
    fn test_direction_filter() {
        let r = FifoReconciler::default();
        let long = r.open_group(new_group(Direction::Long, 1)).unwrap();
        let short = r.open_group(new_group(Direction::Short, 1)).unwrap();
        r.submit_lots(long.group_id, 1, dec!(5)).unwrap();
        r.submit_lots(short.group_id, 1, dec!(5)).unwrap();

        let out = r.apply(&fill("1", dec!(22500), 1, Some(Direction::Short)));
        let MatchOutcome::Filled(m) = &out[0] else {
            panic!("expected fill");
        };
        assert_eq!(m.group.group_id, short.group_id);
        assert_eq!(r.group(long.group_id).unwrap().filled_lots, 0);
    }

    #[test]
    fn test_filled_lots_never_exceed_submitted() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 3)).unwrap();
        r.submit_lots(g.group_id, 2, dec!(5)).unwrap();

        let out = r.apply(&fill("1", dec!(22500), 3, None));
        assert_eq!(filled_count(&out), 2);
        assert!(matches!(
            out.last(),
            Some(MatchOutcome::Unmatched { quantity: 1, retained: true, .. })
        ));

        let group = r.group(g.group_id).unwrap();
        assert_eq!(group.filled_lots, 2);
        assert!(group.invariant_holds());
        assert_eq!(r.retained_count(), 1);
    }

    #[test]
    fn test_retained_fill_matches_on_submit() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 2)).unwrap();

        let early = r.apply(&fill("1", dec!(22500), 1, None));
        assert!(matches!(early[0], MatchOutcome::Unmatched { retained: true, .. }));

        let result = r.submit_lots(g.group_id, 2, dec!(5)).unwrap();
        assert_eq!(filled_count(&result.late_matches), 1);
        assert_eq!(r.retained_count(), 0);
        assert_eq!(r.group(g.group_id).unwrap().filled_lots, 1);
    }

    #[test]
    fn test_sweep_orphans() {
        let r = FifoReconciler::new(ReconcileConfig {
            unmatched_retention_ms: 1_000,
            ..ReconcileConfig::default()
        });
        r.apply(&fill("1", dec!(22500), 1, None));
        assert!(r.sweep_orphans(now_ms()).is_empty());
        let dropped = r.sweep_orphans(now_ms() + 1_000);
        assert_eq!(dropped.len(), 1);
        assert_eq!(r.retained_count(), 0);
    }

    #[test]
    fn test_fill_after_complete() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 1)).unwrap();
        r.submit_lots(g.group_id, 1, dec!(5)).unwrap();
        r.apply(&fill("1", dec!(22500), 1, None));

        let out = r.apply(&fill("2", dec!(22500), 1, None));
        assert_eq!(
            out,
            vec![MatchOutcome::AfterComplete {
                sequence_id: SequenceId::new("2"),
                group_id: g.group_id,
            }]
        );
        assert_eq!(r.group(g.group_id).unwrap().filled_lots, 1);
        assert_eq!(r.retained_count(), 0);
    }

    #[test]
    fn test_fill_ahead_of_newer_group_is_retained() {
        let r = FifoReconciler::default();
        let first = r.open_group(new_group(Direction::Long, 1)).unwrap();
        r.submit_lots(first.group_id, 1, dec!(5)).unwrap();
        r.apply(&fill("1", dec!(22500), 1, Some(Direction::Long)));

        // The second group's fill arrives before its lots are submitted.
        let second = r.open_group(new_group(Direction::Long, 2)).unwrap();
        let out = r.apply(&fill("2", dec!(22510), 1, Some(Direction::Long)));
        assert!(matches!(
            out[0],
            MatchOutcome::Unmatched { retained: true, .. }
        ));

        let submitted = r.submit_lots(second.group_id, 2, dec!(5)).unwrap();
        assert_eq!(filled_count(&submitted.late_matches), 1);
        assert_eq!(r.group(second.group_id).unwrap().filled_lots, 1);
        assert_eq!(r.group(first.group_id).unwrap().filled_lots, 1);
    }

    #[test]
    fn test_cancel_and_reject_release_lots() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 3)).unwrap();
        r.submit_lots(g.group_id, 3, dec!(5)).unwrap();

        let out = r.apply(&release("1", ReportType::Cancelled));
        let MatchOutcome::Released(m) = &out[0] else {
            panic!("expected release");
        };
        assert_eq!(m.position.lot_id, 1);
        assert_eq!(m.position.order_status, Some(OrderStatus::Cancelled));
        assert_eq!(m.position.exit_reason, Some(ExitReason::OrderCancelled));
        assert_eq!(m.group.submitted_lots, 2);

        let out = r.apply(&release("2", ReportType::Rejected));
        let MatchOutcome::Released(m) = &out[0] else {
            panic!("expected release");
        };
        assert_eq!(m.position.order_status, Some(OrderStatus::Rejected));
        assert_eq!(r.group(g.group_id).unwrap().submitted_lots, 1);
    }

    #[test]
    fn test_unmatched_cancel_is_not_retained() {
        let r = FifoReconciler::default();
        let out = r.apply(&release("1", ReportType::Cancelled));
        assert!(matches!(out[0], MatchOutcome::Unmatched { retained: false, .. }));
        assert_eq!(r.retained_count(), 0);
    }

    #[test]
    fn test_resubmit_failed_lot() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 2)).unwrap();
        r.submit_lots(g.group_id, 2, dec!(5)).unwrap();
        let out = r.apply(&release("1", ReportType::Rejected));
        let MatchOutcome::Released(m) = &out[0] else {
            panic!("expected release");
        };

        let retry = r.resubmit_lot(g.group_id, m.position.position_id).unwrap();
        assert_eq!(retry.lot_id, m.position.lot_id);
        assert_eq!(retry.retry_count, 1);
        assert!(retry.is_pending());
        assert_eq!(r.group(g.group_id).unwrap().submitted_lots, 2);

        // Lot 1 is held by the retry now.
        assert!(matches!(
            r.resubmit_lot(g.group_id, m.position.position_id),
            Err(ReconcileError::InvalidLotState(_))
        ));
    }

    #[test]
    fn test_resubmit_retry_limit() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 1)).unwrap();
        r.submit_lots(g.group_id, 1, dec!(5)).unwrap();

        let mut failed = None;
        for seq in 0..=MAX_RETRY_COUNT {
            if let Some(id) = failed {
                r.resubmit_lot(g.group_id, id).unwrap();
            }
            let out = r.apply(&release(&format!("c{seq}"), ReportType::Cancelled));
            let MatchOutcome::Released(m) = &out[0] else {
                panic!("expected release");
            };
            failed = Some(m.position.position_id);
        }

        let last = failed.unwrap();
        assert!(matches!(
            r.resubmit_lot(g.group_id, last),
            Err(ReconcileError::RetryLimitExceeded(id)) if id == last
        ));
    }

    #[test]
    fn test_cancel_group() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Short, 3)).unwrap();
        r.submit_lots(g.group_id, 3, dec!(5)).unwrap();
        r.apply(&fill("1", dec!(22574), 1, None));

        let cancelled = r.cancel_group(g.group_id).unwrap();
        assert_eq!(cancelled.released.len(), 2);
        assert!(cancelled
            .released
            .iter()
            .all(|p| p.exit_reason == Some(ExitReason::GroupCancelled)));
        assert_eq!(cancelled.group.status, GroupStatus::Cancelled);
        assert_eq!(cancelled.group.submitted_lots, 1);

        // No capacity left for late fills.
        let out = r.apply(&fill("2", dec!(22573), 1, None));
        assert!(matches!(out[0], MatchOutcome::Unmatched { .. }));
        assert!(r.open_groups(&product()).is_empty());
    }

    #[test]
    fn test_submit_capacity() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 2)).unwrap();
        r.submit_lots(g.group_id, 2, dec!(5)).unwrap();
        assert!(matches!(
            r.submit_lots(g.group_id, 1, dec!(5)),
            Err(ReconcileError::LotCapacityExceeded { available: 0, .. })
        ));
        assert!(matches!(
            r.submit_lots(GroupId(999), 1, dec!(5)),
            Err(ReconcileError::GroupNotFound(_))
        ));
    }

    #[test]
    fn test_open_group_validation() {
        let r = FifoReconciler::default();
        assert!(matches!(
            r.open_group(new_group(Direction::Long, 4)),
            Err(ReconcileError::InvalidGroup(_))
        ));
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let r = FifoReconciler::new(ReconcileConfig {
            dedup_window: 2,
            ..ReconcileConfig::default()
        });
        r.apply(&release("a", ReportType::Cancelled));
        r.apply(&release("b", ReportType::Cancelled));
        r.apply(&release("c", ReportType::Cancelled));

        // "a" fell out of the window and is treated as new.
        assert!(matches!(
            r.apply(&release("a", ReportType::Cancelled))[0],
            MatchOutcome::Unmatched { .. }
        ));
        assert!(matches!(
            r.apply(&release("c", ReportType::Cancelled))[0],
            MatchOutcome::Duplicate(_)
        ));
    }

    #[test]
    fn test_concurrent_replay_applies_once() {
        let r = Arc::new(FifoReconciler::default());
        let g = r.open_group(new_group(Direction::Long, 3)).unwrap();
        r.submit_lots(g.group_id, 3, dec!(5)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || {
                    for seq in 0..3 {
                        r.apply(&fill(&format!("s{seq}"), dec!(22500), 1, None));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let group = r.group(g.group_id).unwrap();
        assert_eq!(group.filled_lots, 3);
        assert_eq!(group.status, GroupStatus::Complete);
        assert_eq!(r.retained_count(), 0);
    }

    #[test]
    fn test_mark_exited() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 1)).unwrap();
        r.submit_lots(g.group_id, 1, dec!(5)).unwrap();
        let out = r.apply(&fill("1", dec!(22500), 1, None));
        let MatchOutcome::Filled(m) = &out[0] else {
            panic!("expected fill");
        };

        let mut exited = m.position.clone();
        exited.exit(Price::new(dec!(22470)), ExitReason::InitialStop, now_ms());
        r.mark_exited(&exited).unwrap();
        assert_eq!(r.positions(g.group_id)[0].status, PositionStatus::Exited);
        assert!(r.mark_exited(&exited).is_err());
    }

    #[test]
    fn test_restore_group_resumes_fifo() {
        let before = FifoReconciler::default();
        let g = before.open_group(new_group(Direction::Short, 3)).unwrap();
        before.submit_lots(g.group_id, 3, dec!(5)).unwrap();
        before.apply(&fill("1", dec!(22574), 1, None));

        let restored = FifoReconciler::default();
        restored
            .restore_group(
                before.group(g.group_id).unwrap(),
                before.positions(g.group_id),
            )
            .unwrap();

        let out = restored.apply(&fill("2", dec!(22573), 1, None));
        let MatchOutcome::Filled(m) = &out[0] else {
            panic!("expected fill, got {out:?}");
        };
        assert_eq!(m.position.lot_id, 2);
        assert_eq!(restored.group(g.group_id).unwrap().filled_lots, 2);

        // New ids continue past the restored ones.
        let next = restored.open_group(new_group(Direction::Long, 1)).unwrap();
        assert!(next.group_id > g.group_id);
        let lots = restored.submit_lots(next.group_id, 1, dec!(5)).unwrap();
        assert!(lots.positions[0].position_id > PositionId(3));
    }

    #[test]
    fn test_redelivered_report_after_restore_is_duplicate() {
        let before = FifoReconciler::default();
        let g = before.open_group(new_group(Direction::Short, 2)).unwrap();
        before.submit_lots(g.group_id, 2, dec!(5)).unwrap();
        before.apply(&fill("1001", dec!(22574), 1, Some(Direction::Short)));
        before.apply(&release("1002", ReportType::Cancelled));

        let positions = before.positions(g.group_id);
        assert_eq!(
            positions[0].report_sequence_id,
            Some(SequenceId::new("1001"))
        );
        assert_eq!(
            positions[1].report_sequence_id,
            Some(SequenceId::new("1002"))
        );

        let restored = FifoReconciler::default();
        restored
            .restore_group(before.group(g.group_id).unwrap(), positions)
            .unwrap();
        restored.resubmit_lot(g.group_id, PositionId(2)).unwrap();

        for seq in ["1001", "1002"] {
            let out = restored.apply(&fill(seq, dec!(22574), 1, Some(Direction::Short)));
            assert_eq!(out, vec![MatchOutcome::Duplicate(SequenceId::new(seq))]);
        }
        assert_eq!(restored.group(g.group_id).unwrap().filled_lots, 1);

        // A fresh report still fills the resubmitted lot.
        let out = restored.apply(&fill("1003", dec!(22573), 1, Some(Direction::Short)));
        assert_eq!(filled_count(&out), 1);
    }

    #[test]
    fn test_abandon_lots() {
        let r = FifoReconciler::default();
        let g = r.open_group(new_group(Direction::Long, 3)).unwrap();
        let submitted = r.submit_lots(g.group_id, 2, dec!(5)).unwrap();
        let ids: Vec<_> = submitted.positions.iter().map(|p| p.position_id).collect();

        let failed = r.abandon_lots(g.group_id, &ids).unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|p| p.status == PositionStatus::Failed));
        assert_eq!(r.group(g.group_id).unwrap().submitted_lots, 0);

        // Nothing left to match.
        let out = r.apply(&fill("1", dec!(22500), 1, None));
        assert!(matches!(out[0], MatchOutcome::Unmatched { .. }));

        // Abandoning again is a no-op, and the lot can be retried.
        assert!(r.abandon_lots(g.group_id, &ids).unwrap().is_empty());
        let retried = r.resubmit_lot(g.group_id, ids[0]).unwrap();
        assert_eq!(retried.retry_count, 1);
    }
}
