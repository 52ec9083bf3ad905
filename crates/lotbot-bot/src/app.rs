//! Main application orchestration.
//!
//! Two inbound sources drive the bot:
//! - broker reports, decoded and reconciled onto group lots
//! - price ticks, evaluated against the stops of every active lot
//!
//! Every state change is scheduled on the persistence worker. Nothing on
//! the report or tick path waits for storage.
//!
//! The lots of a tick are evaluated concurrently, and the event loop keeps
//! tick evaluations in flight while it goes on reading reports, so a slow
//! exit only ever holds up its own position.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use lotbot_core::{
    now_ms, FillEvent, GroupId, NewGroup, PositionId, PositionRecord, PositionStatus, Price,
    ProductCode, StrategyGroup, UpdateReason,
};
use lotbot_executor::{
    BrokerGateway, EntryOrder, OrderMode, OrderModeGate, RoutedExitExecutor, Submission,
    UnconfirmedOrder,
};
use lotbot_feed::FillReportParser;
use lotbot_persistence::{
    Mutation, MutationReason, PersistStats, PersistenceWorker, StateSnapshot, StateStore,
    StopReport,
};
use lotbot_position::{
    Evaluation, FifoReconciler, MatchOutcome, PositionError, PositionRiskEngine, ReconcileError,
};
use lotbot_telemetry::Metrics;

use crate::config::AppConfig;
use crate::error::AppResult;

/// Inbound event for [`Application::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    /// Raw broker reply record.
    Report(String),
    Tick {
        product: ProductCode,
        price: Price,
    },
    /// Open a group and submit `lots` of it.
    Entry {
        params: NewGroup,
        lots: u8,
    },
    SetMode(OrderMode),
    Shutdown,
}

/// Result of [`Application::submit_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    /// Pending records created for this entry.
    pub positions: Vec<PositionRecord>,
    /// `None` when retained fills already covered every new lot.
    pub submission: Option<Submission>,
    /// Late matches plus, in virtual mode, the synthesized fill's matches.
    pub outcomes: Vec<MatchOutcome>,
}

/// Result of [`Application::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<UnconfirmedOrder>,
    pub orphaned: Vec<FillEvent>,
}

/// Result of [`Application::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub groups: usize,
    pub active: usize,
    pub pending: usize,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    parser: FillReportParser,
    reconciler: FifoReconciler,
    risk: PositionRiskEngine,
    gate: Arc<OrderModeGate>,
    exits: Arc<RoutedExitExecutor>,
    persistence: PersistenceWorker,
}

impl Application {
    /// Create a new application.
    ///
    /// Starts in virtual mode; a configured real mode is requested here and
    /// falls back to virtual when the broker is not ready. Call
    /// [`Application::start`] inside a runtime before feeding events.
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn BrokerGateway>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let gate = Arc::new(OrderModeGate::new(config.gate.clone(), broker));
        let exits = Arc::new(RoutedExitExecutor::new(gate.clone()));
        let risk = PositionRiskEngine::new(config.risk.clone());
        risk.set_exit_executor(exits.clone());

        if config.mode == OrderMode::Real {
            if let Err(e) = gate.request_mode(OrderMode::Real) {
                warn!(error = %e, "Configured real mode unavailable, starting in virtual mode");
            }
        }

        Self {
            parser: FillReportParser::new(config.report_layout.clone()),
            reconciler: FifoReconciler::new(config.reconcile.clone()),
            persistence: PersistenceWorker::new(&config.persistence, store),
            risk,
            gate,
            exits,
            config,
        }
    }

    /// Start background work (the persistence consumer).
    pub fn start(&self) {
        self.persistence.start();
        info!(mode = %self.mode(), "Application started");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> OrderMode {
        self.gate.mode()
    }

    pub fn reconciler(&self) -> &FifoReconciler {
        &self.reconciler
    }

    pub fn risk_engine(&self) -> &PositionRiskEngine {
        &self.risk
    }

    pub fn gate(&self) -> &Arc<OrderModeGate> {
        &self.gate
    }

    pub fn exits(&self) -> &Arc<RoutedExitExecutor> {
        &self.exits
    }

    pub fn persistence_stats(&self) -> PersistStats {
        self.persistence.stats()
    }

    /// Switch order mode. Real mode is refused while the broker is not ready.
    pub fn request_mode(&self, mode: OrderMode) -> AppResult<OrderMode> {
        Ok(self.gate.request_mode(mode)?)
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Open a strategy group.
    pub fn open_group(&self, params: NewGroup) -> AppResult<StrategyGroup> {
        let group = self.reconciler.open_group(params)?;
        self.persist(Mutation::group(&group, MutationReason::GroupUpdate));
        Ok(group)
    }

    /// Submit `lots` more lots of a group through the order-mode gate.
    ///
    /// In virtual mode the synthesized fill is reconciled before returning.
    /// If the gate refuses the order, the new lots are failed and the error
    /// is returned.
    pub async fn submit_entry(&self, group_id: GroupId, lots: u8) -> AppResult<EntryReport> {
        let submitted =
            self.reconciler
                .submit_lots(group_id, lots, self.config.max_slippage_points)?;
        for position in &submitted.positions {
            self.persist(Mutation::position(position, MutationReason::GroupUpdate));
        }

        let mut outcomes = submitted.late_matches;
        self.handle_outcomes(&outcomes);

        let late: HashSet<PositionId> = outcomes
            .iter()
            .filter_map(|o| match o {
                MatchOutcome::Filled(m) => Some(m.position.position_id),
                _ => None,
            })
            .collect();
        let pending_ids: Vec<PositionId> = submitted
            .positions
            .iter()
            .map(|p| p.position_id)
            .filter(|id| !late.contains(id))
            .collect();

        let group = self
            .reconciler
            .group(group_id)
            .ok_or(ReconcileError::GroupNotFound(group_id))?;
        self.persist(Mutation::group(&group, MutationReason::GroupUpdate));

        if pending_ids.is_empty() {
            debug!(group_id = %group_id, "Retained fills covered all new lots");
            return Ok(EntryReport {
                positions: submitted.positions,
                submission: None,
                outcomes,
            });
        }

        let order = EntryOrder {
            group_id,
            product: group.product.clone(),
            direction: group.direction,
            price: group.target_price,
            quantity: pending_ids.len() as u32,
            max_slippage_points: self.config.max_slippage_points,
        };

        let submission = match self.gate.submit(order).await {
            Ok(Submission::Virtual(event)) => {
                outcomes.extend(self.process_event(&event));
                Submission::Virtual(event)
            }
            Ok(real) => real,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "Entry order refused");
                let failed = self.reconciler.abandon_lots(group_id, &pending_ids)?;
                for position in &failed {
                    self.persist(Mutation::position(position, MutationReason::OrderFailed));
                }
                if let Some(group) = self.reconciler.group(group_id) {
                    self.persist(Mutation::group(&group, MutationReason::OrderFailed));
                }
                return Err(e.into());
            }
        };

        Ok(EntryReport {
            positions: submitted.positions,
            submission: Some(submission),
            outcomes,
        })
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Decode and reconcile one raw broker reply record.
    ///
    /// Acknowledgements and reports for exit orders yield no outcomes.
    pub fn on_broker_report(&self, raw: &str) -> AppResult<Vec<MatchOutcome>> {
        let event = match self.parser.parse(raw) {
            Ok(Some(event)) => {
                Metrics::report_parsed("parsed");
                event
            }
            Ok(None) => {
                Metrics::report_parsed("ignored");
                return Ok(Vec::new());
            }
            Err(e) => {
                Metrics::report_parsed("malformed");
                return Err(e.into());
            }
        };

        if let Some(order_no) = event.order_no.as_deref() {
            if self.exits.broker().owns_order(order_no) {
                debug!(
                    order_no = %order_no,
                    sequence_id = %event.sequence_id,
                    "Exit order report skipped"
                );
                return Ok(Vec::new());
            }
        }

        Ok(self.process_event(&event))
    }

    fn process_event(&self, event: &FillEvent) -> Vec<MatchOutcome> {
        let outcomes = self.reconciler.apply(event);
        let units = outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::Filled(_) | MatchOutcome::Released(_)))
            .count() as u32;
        if units > 0 {
            self.gate.confirm(&event.product, event.direction, units);
        }
        self.handle_outcomes(&outcomes);
        outcomes
    }

    fn handle_outcomes(&self, outcomes: &[MatchOutcome]) {
        for outcome in outcomes {
            match outcome {
                MatchOutcome::Filled(m) => {
                    self.persist(Mutation::position(&m.position, MutationReason::FillConfirmed));
                    self.persist(Mutation::group(&m.group, MutationReason::FillConfirmed));
                    match self
                        .risk
                        .register(m.position.clone(), UpdateReason::FillConfirmedInit)
                    {
                        Ok(state) => self.persist(Mutation::risk(
                            m.position.position_id,
                            Some(state),
                            MutationReason::FillConfirmed,
                        )),
                        Err(e) => warn!(
                            position_id = %m.position.position_id,
                            error = %e,
                            "Risk registration failed"
                        ),
                    }
                }
                MatchOutcome::Released(r) => {
                    self.persist(Mutation::position(&r.position, MutationReason::OrderFailed));
                    self.persist(Mutation::group(&r.group, MutationReason::OrderFailed));
                }
                MatchOutcome::Duplicate(_)
                | MatchOutcome::Unmatched { .. }
                | MatchOutcome::AfterComplete { .. } => {}
            }
        }
        Metrics::active_positions_set(self.risk.tracked_count());
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Evaluate every active lot of `product` against `price`.
    ///
    /// Lots are evaluated concurrently; each result is persisted as soon as
    /// its own evaluation finishes. Evaluations come back in position-id
    /// order.
    pub async fn on_tick(&self, product: &ProductCode, price: Price) -> Vec<Evaluation> {
        let ids = self.risk.active_positions(product);
        let evaluate = move |position_id: PositionId| async move {
            match self.risk.evaluate(position_id, price).await {
                Ok(evaluation) => {
                    self.persist_evaluation(&evaluation);
                    Some(evaluation)
                }
                Err(PositionError::ShuttingDown) => {
                    debug!(
                        product = %product,
                        position_id = %position_id,
                        "Tick ignored, risk engine shutting down"
                    );
                    None
                }
                Err(e) => {
                    warn!(position_id = %position_id, error = %e, "Risk evaluation failed");
                    None
                }
            }
        };
        let evaluations: Vec<Evaluation> = join_all(ids.into_iter().map(evaluate))
            .await
            .into_iter()
            .flatten()
            .collect();
        Metrics::active_positions_set(self.risk.tracked_count());
        evaluations
    }

    async fn evaluate_tick(&self, product: ProductCode, price: Price) -> Vec<Evaluation> {
        self.on_tick(&product, price).await
    }

    fn persist_evaluation(&self, evaluation: &Evaluation) {
        match evaluation {
            Evaluation::Holding {
                position_id,
                risk,
                changes,
            }
            | Evaluation::ExitFailed {
                position_id,
                risk,
                changes,
                ..
            } => {
                let reason = changes
                    .iter()
                    .map(|c| MutationReason::from_update(*c))
                    .max_by_key(|r| r.priority());
                if let Some(reason) = reason {
                    self.persist(Mutation::risk(*position_id, Some(risk.clone()), reason));
                }
            }
            Evaluation::Exited { position, .. } => {
                if let Err(e) = self.reconciler.mark_exited(position) {
                    warn!(position_id = %position.position_id, error = %e, "Exit not mirrored");
                }
                self.persist(Mutation::position(position, MutationReason::Exit));
                self.persist(Mutation::risk(position.position_id, None, MutationReason::Exit));
                self.retire_if_finished(position.group_id);
            }
            Evaluation::AlreadyExited { .. } => {}
        }
    }

    /// Release per-group risk bookkeeping once no lot of the group can
    /// fill or exit again.
    fn retire_if_finished(&self, group_id: GroupId) {
        let Some(group) = self.reconciler.group(group_id) else {
            return;
        };
        if group.is_open() {
            return;
        }
        let finished = self
            .reconciler
            .positions(group_id)
            .iter()
            .all(|p| matches!(p.status, PositionStatus::Exited | PositionStatus::Failed));
        if finished {
            self.risk.forget_group(group_id);
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Expire unconfirmed real orders and drop orphaned fills.
    pub fn sweep(&self, now: u64) -> SweepReport {
        let expired = self.gate.expire_unconfirmed(now);
        for order in &expired {
            error!(
                error = %order.to_error(),
                group_id = %order.group_id,
                remaining = order.remaining,
                "Order needs manual reconciliation"
            );
        }
        let orphaned = self.reconciler.sweep_orphans(now);
        SweepReport { expired, orphaned }
    }

    /// Rebuild in-memory state from a persisted snapshot.
    ///
    /// Must run before any event is handled.
    pub fn recover(&self, snapshot: &StateSnapshot) -> AppResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for group in snapshot.groups.values() {
            let records = snapshot.positions_of(group.group_id);
            self.reconciler.restore_group(group.clone(), records.clone())?;
            report.groups += 1;

            for record in records {
                let status = record.status;
                match status {
                    PositionStatus::Active => {
                        match snapshot.risk.get(&record.position_id) {
                            Some(state) => self.risk.restore(record, state.clone())?,
                            None => {
                                self.risk.register(record, UpdateReason::Initialization)?;
                            }
                        }
                        report.active += 1;
                    }
                    PositionStatus::Exited => {
                        if let (Some(entry), Some(exit)) = (record.entry_price, record.exit_price) {
                            self.risk.record_realized(
                                record.group_id,
                                record.lot_id,
                                record.direction.excursion(entry, exit),
                            );
                        }
                    }
                    PositionStatus::Pending => report.pending += 1,
                    PositionStatus::Failed => {}
                }
            }
        }
        Metrics::active_positions_set(self.risk.tracked_count());
        info!(
            groups = report.groups,
            active = report.active,
            pending = report.pending,
            "State recovered"
        );
        Ok(report)
    }

    /// Stop tick intake, wait for in-flight exits, then stop persistence
    /// with the configured policy.
    pub async fn shutdown(&self) -> AppResult<StopReport> {
        info!("Shutting down");
        self.risk.shutdown();
        self.risk.wait_idle().await;
        let report = self
            .persistence
            .stop(self.config.persistence.stop_policy)
            .await?;
        info!(
            exits = self.risk.exit_count(),
            exit_failures = self.risk.failure_count(),
            tracked = self.risk.tracked_count(),
            "Shutdown complete"
        );
        Ok(report)
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Handle one event. Errors are logged, never propagated.
    pub async fn handle_event(&self, event: BotEvent) {
        match event {
            BotEvent::Report(raw) => {
                if let Err(e) = self.on_broker_report(&raw) {
                    warn!(error = %e, "Report handling error");
                }
            }
            BotEvent::Tick { product, price } => {
                self.on_tick(&product, price).await;
            }
            BotEvent::Entry { params, lots } => match self.open_group(params) {
                Ok(group) => {
                    if let Err(e) = self.submit_entry(group.group_id, lots).await {
                        warn!(group_id = %group.group_id, error = %e, "Entry failed");
                    }
                }
                Err(e) => warn!(error = %e, "Group rejected"),
            },
            BotEvent::SetMode(mode) => {
                if let Err(e) = self.request_mode(mode) {
                    warn!(requested = %mode, error = %e, "Mode change refused");
                }
            }
            BotEvent::Shutdown => {}
        }
    }

    /// Run until `Shutdown`, channel close, or Ctrl-C, then shut down.
    ///
    /// Tick evaluations run alongside the loop; reports and entries are
    /// handled while earlier ticks are still waiting on exit executors.
    /// In-flight ticks finish before shutdown.
    pub async fn run(&self, mut events: mpsc::Receiver<BotEvent>) -> AppResult<StopReport> {
        let mut sweep =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Entering main event loop");
        let mut handled = 0u64;
        let mut ticks = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;

                Some(_) = ticks.next(), if !ticks.is_empty() => {}

                _ = sweep.tick() => {
                    self.sweep(now_ms());
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }

                event = events.recv() => match event {
                    Some(BotEvent::Shutdown) | None => break,
                    Some(BotEvent::Tick { product, price }) => {
                        ticks.push(self.evaluate_tick(product, price));
                        handled += 1;
                    }
                    Some(event) => {
                        self.handle_event(event).await;
                        handled += 1;
                    }
                },
            }
        }

        info!(handled, in_flight_ticks = ticks.len(), "Event loop finished");
        while ticks.next().await.is_some() {}
        self.shutdown().await
    }

    fn persist(&self, mutation: Mutation) {
        self.persistence.schedule(mutation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotbot_core::{Direction, GroupStatus};
    use lotbot_executor::MockBroker;
    use lotbot_persistence::MemoryStore;
    use lotbot_position::{BoxFuture, ExitExecutor, ExitResult, ExitTrigger};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Sleeps before reporting success.
    struct SlowExit {
        delay: Duration,
    }

    impl ExitExecutor for SlowExit {
        fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                ExitResult::ok(format!("SLOW-{}", trigger.position_id))
            })
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// Holds every exit until released.
    #[derive(Default)]
    struct HeldExit {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    impl ExitExecutor for HeldExit {
        fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.entered.notify_one();
                self.release.notified().await;
                ExitResult::ok(format!("HELD-{}", trigger.position_id))
            })
        }

        fn name(&self) -> &str {
            "held"
        }
    }

    /// Fill record in the default layout.
    fn fill_report(seq: &str, order_no: &str, price: &str) -> String {
        let mut fields = vec![""; 21];
        fields[0] = seq;
        fields[1] = "TF";
        fields[2] = "D";
        fields[3] = "N";
        fields[6] = "B";
        fields[8] = "MTX00";
        fields[10] = order_no;
        fields[11] = price;
        fields[20] = "1";
        fields.join(",")
    }

    fn app() -> (Application, Arc<MockBroker>, Arc<MemoryStore>) {
        let broker = Arc::new(MockBroker::new());
        let store = Arc::new(MemoryStore::new());
        let app = Application::new(AppConfig::default(), broker.clone(), store.clone());
        (app, broker, store)
    }

    fn params(direction: Direction, lots: u8) -> NewGroup {
        NewGroup {
            direction,
            product: ProductCode::new("MTX00"),
            target_price: Price::new(dec!(22500)),
            total_lots: lots,
        }
    }

    #[tokio::test]
    async fn test_virtual_entry_fills_immediately() {
        let (app, broker, _) = app();
        let group = app.open_group(params(Direction::Long, 2)).unwrap();
        let report = app.submit_entry(group.group_id, 2).await.unwrap();

        assert!(matches!(report.submission, Some(Submission::Virtual(_))));
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            app.reconciler().group(group.group_id).unwrap().status,
            GroupStatus::Complete
        );
        assert_eq!(app.risk_engine().tracked_count(), 2);
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_refused_entry_fails_new_lots() {
        let (app, broker, _) = app();
        broker.set_ready(true);
        app.request_mode(OrderMode::Real).unwrap();
        broker.set_ready(false);

        let group = app.open_group(params(Direction::Short, 3)).unwrap();
        assert!(app.submit_entry(group.group_id, 3).await.is_err());

        let positions = app.reconciler().positions(group.group_id);
        assert_eq!(positions.len(), 3);
        assert!(positions.iter().all(|p| p.status == PositionStatus::Failed));
        assert_eq!(app.reconciler().group(group.group_id).unwrap().submitted_lots, 0);
    }

    #[tokio::test]
    async fn test_real_entry_waits_for_reports() {
        let (app, broker, _) = app();
        app.request_mode(OrderMode::Real).unwrap();
        let group = app.open_group(params(Direction::Long, 1)).unwrap();

        let report = app.submit_entry(group.group_id, 1).await.unwrap();
        assert!(matches!(report.submission, Some(Submission::Real { .. })));
        assert!(report.outcomes.is_empty());
        assert_eq!(broker.orders().len(), 1);
        assert_eq!(app.gate().awaiting_count(), 1);

        let swept = app.sweep(now_ms() + 60_000);
        assert_eq!(swept.expired.len(), 1);
        assert_eq!(app.gate().awaiting_count(), 0);
    }

    #[tokio::test]
    async fn test_tick_exit_clears_risk_and_persists() {
        let (app, _, store) = app();
        let group = app.open_group(params(Direction::Long, 1)).unwrap();
        app.submit_entry(group.group_id, 1).await.unwrap();

        let product = ProductCode::new("MTX00");
        let held = app.on_tick(&product, Price::new(dec!(22520))).await;
        assert!(matches!(held[0], Evaluation::Holding { .. }));

        let exited = app.on_tick(&product, Price::new(dec!(22510))).await;
        assert!(matches!(exited[0], Evaluation::Exited { .. }));
        assert_eq!(app.risk_engine().tracked_count(), 0);
        assert_eq!(
            app.reconciler().positions(group.group_id)[0].status,
            PositionStatus::Exited
        );

        app.shutdown().await.unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.risk.is_empty());
        assert!(snapshot
            .positions
            .values()
            .all(|p| p.status == PositionStatus::Exited));
    }

    #[tokio::test]
    async fn test_recover_restores_tracking() {
        let (first, _, store) = app();
        first.start();
        let group = first.open_group(params(Direction::Short, 3)).unwrap();
        first.submit_entry(group.group_id, 2).await.unwrap();
        first.shutdown().await.unwrap();

        let (second, _, _) = app();
        let report = second.recover(&store.snapshot()).unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.active, 2);
        assert_eq!(second.risk_engine().tracked_count(), 2);

        let restored = second.reconciler().group(group.group_id).unwrap();
        assert_eq!(restored.filled_lots, 2);
        assert!(second.submit_entry(group.group_id, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_exit_does_not_serialize_sibling_lots() {
        let (app, _, _) = app();
        app.risk_engine().set_exit_executor(Arc::new(SlowExit {
            delay: Duration::from_millis(300),
        }));
        let group = app.open_group(params(Direction::Long, 3)).unwrap();
        app.submit_entry(group.group_id, 3).await.unwrap();

        let started = Instant::now();
        let evals = app
            .on_tick(&ProductCode::new("MTX00"), Price::new(dec!(22400)))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(evals.len(), 3);
        assert!(evals.iter().all(|e| matches!(e, Evaluation::Exited { .. })));
        let lots: Vec<u8> = evals
            .iter()
            .filter_map(|e| match e {
                Evaluation::Exited { trigger, .. } => Some(trigger.lot_id),
                _ => None,
            })
            .collect();
        assert_eq!(lots, vec![1, 2, 3]);
        assert!(
            elapsed < Duration::from_millis(600),
            "three exits took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_reports_are_reconciled_while_an_exit_is_held() {
        let (app, _, _) = app();
        app.start();
        app.request_mode(OrderMode::Real).unwrap();

        let first = app.open_group(params(Direction::Long, 1)).unwrap();
        app.submit_entry(first.group_id, 1).await.unwrap();
        app.on_broker_report(&fill_report("1", "M000001", "22500"))
            .unwrap();
        let second = app.open_group(params(Direction::Long, 1)).unwrap();
        app.submit_entry(second.group_id, 1).await.unwrap();

        let held = Arc::new(HeldExit::default());
        app.risk_engine().set_exit_executor(held.clone());

        let (tx, rx) = mpsc::channel(16);
        let driver = async {
            tx.send(BotEvent::Tick {
                product: ProductCode::new("MTX00"),
                price: Price::new(dec!(22400)),
            })
            .await
            .unwrap();
            held.entered.notified().await;

            tx.send(BotEvent::Report(fill_report("2", "M000002", "22501")))
                .await
                .unwrap();
            tokio::time::timeout(Duration::from_secs(2), async {
                while app.reconciler().group(second.group_id).unwrap().filled_lots == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("report waited behind the held exit");
            assert_eq!(app.risk_engine().exit_count(), 0);

            held.release.notify_one();
            tx.send(BotEvent::Shutdown).await.unwrap();
        };

        let (stopped, ()) = tokio::join!(app.run(rx), driver);
        stopped.unwrap();
        assert_eq!(held.calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.risk_engine().exit_count(), 1);
        assert_eq!(app.risk_engine().tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_group_releases_realized_points() {
        let (app, _, _) = app();
        let group = app.open_group(params(Direction::Long, 2)).unwrap();
        app.submit_entry(group.group_id, 2).await.unwrap();
        let product = ProductCode::new("MTX00");

        // Lot 1 trails out with a profit; lot 2 is still open.
        app.on_tick(&product, Price::new(dec!(22520))).await;
        app.on_tick(&product, Price::new(dec!(22510))).await;
        assert_eq!(app.risk_engine().tracked_count(), 1);
        assert_eq!(app.risk_engine().realized_group_count(), 1);

        app.on_tick(&product, Price::new(dec!(22400))).await;
        assert_eq!(app.risk_engine().tracked_count(), 0);
        assert_eq!(app.risk_engine().realized_group_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_report_is_an_error() {
        let (app, _, _) = app();
        assert!(app.on_broker_report("garbage").is_err());
    }
}
