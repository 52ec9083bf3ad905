//! Exit executors.
//!
//! The risk engine decides when a position exits; these decide how:
//! - [`SimulatedExitExecutor`]: records the exit and reports success
//! - [`BrokerExitExecutor`]: sends a market order on the opposite side
//! - [`RoutedExitExecutor`]: picks one of the two from the gate's current mode

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use lotbot_position::{BoxFuture, ExitExecutor, ExitResult, ExitTrigger};

use crate::broker::{BrokerGateway, OrderPurpose, OrderRequest, SubmitAck};
use crate::mode::{OrderMode, OrderModeGate};

/// Simulated exits kept for inspection.
pub const DEFAULT_EXIT_HISTORY: usize = 1_000;

/// Exit order numbers remembered for report filtering.
pub const DEFAULT_TRACKED_EXIT_ORDERS: usize = 10_000;

/// Exit executor for virtual mode and tests.
#[derive(Debug)]
pub struct SimulatedExitExecutor {
    seq: AtomicU64,
    history_limit: usize,
    exits: Mutex<VecDeque<ExitTrigger>>,
}

impl SimulatedExitExecutor {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_EXIT_HISTORY)
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            history_limit: limit.max(1),
            exits: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent exits, oldest first.
    pub fn exits(&self) -> Vec<ExitTrigger> {
        self.exits.lock().iter().cloned().collect()
    }

    /// Exits executed since start, including ones no longer in the history.
    pub fn total_exits(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedExitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitExecutor for SimulatedExitExecutor {
    fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult> {
        Box::pin(async move {
            let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let order_id = format!("SX-{n}");
            debug!(
                position_id = %trigger.position_id,
                order_id = %order_id,
                price = %trigger.current_price,
                "Simulated exit"
            );
            let mut exits = self.exits.lock();
            exits.push_back(trigger);
            while exits.len() > self.history_limit {
                exits.pop_front();
            }
            drop(exits);
            ExitResult::ok(order_id)
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Exit executor that places market orders through the broker.
///
/// Remembers the most recent order numbers it placed so reports for exit
/// orders can be kept away from entry reconciliation. The oldest number is
/// forgotten once `order_limit` is reached.
pub struct BrokerExitExecutor {
    broker: Arc<dyn BrokerGateway>,
    order_limit: usize,
    exit_orders: DashSet<String>,
    placement_order: Mutex<VecDeque<String>>,
}

impl BrokerExitExecutor {
    pub fn new(broker: Arc<dyn BrokerGateway>) -> Self {
        Self::with_order_limit(broker, DEFAULT_TRACKED_EXIT_ORDERS)
    }

    pub fn with_order_limit(broker: Arc<dyn BrokerGateway>, limit: usize) -> Self {
        Self {
            broker,
            order_limit: limit.max(1),
            exit_orders: DashSet::new(),
            placement_order: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether `order_no` was placed by this executor.
    pub fn owns_order(&self, order_no: &str) -> bool {
        self.exit_orders.contains(order_no)
    }

    pub fn tracked_orders(&self) -> usize {
        self.exit_orders.len()
    }

    fn remember_order(&self, order_no: String) {
        let mut placed = self.placement_order.lock();
        if !self.exit_orders.insert(order_no.clone()) {
            return;
        }
        placed.push_back(order_no);
        while placed.len() > self.order_limit {
            if let Some(oldest) = placed.pop_front() {
                self.exit_orders.remove(&oldest);
            }
        }
    }
}

impl ExitExecutor for BrokerExitExecutor {
    fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult> {
        Box::pin(async move {
            if !self.broker.is_ready() {
                warn!(position_id = %trigger.position_id, "Exit refused, broker not ready");
                return ExitResult::failed("broker not ready");
            }

            let request = OrderRequest {
                client_ref: OrderRequest::new_client_ref(OrderPurpose::Exit),
                group_id: Some(trigger.group_id),
                product: trigger.product.clone(),
                side: trigger.direction.opposite(),
                quantity: 1,
                price: None,
                max_slippage_points: Decimal::ZERO,
                purpose: OrderPurpose::Exit,
            };

            match self.broker.submit_order(request).await {
                SubmitAck::Accepted { order_no } => {
                    self.remember_order(order_no.clone());
                    debug!(
                        position_id = %trigger.position_id,
                        order_no = %order_no,
                        "Exit order accepted"
                    );
                    ExitResult::ok(order_no)
                }
                SubmitAck::Rejected { reason } => ExitResult::failed(reason),
            }
        })
    }

    fn name(&self) -> &str {
        "broker"
    }
}

/// Routes exits by the gate's mode at trigger time.
pub struct RoutedExitExecutor {
    gate: Arc<OrderModeGate>,
    simulated: Arc<SimulatedExitExecutor>,
    broker: Arc<BrokerExitExecutor>,
}

impl RoutedExitExecutor {
    pub fn new(gate: Arc<OrderModeGate>) -> Self {
        let broker = Arc::new(BrokerExitExecutor::new(gate.broker().clone()));
        Self {
            gate,
            simulated: Arc::new(SimulatedExitExecutor::new()),
            broker,
        }
    }

    pub fn simulated(&self) -> &Arc<SimulatedExitExecutor> {
        &self.simulated
    }

    pub fn broker(&self) -> &Arc<BrokerExitExecutor> {
        &self.broker
    }
}

impl ExitExecutor for RoutedExitExecutor {
    fn execute(&self, trigger: ExitTrigger) -> BoxFuture<'_, ExitResult> {
        match self.gate.mode() {
            OrderMode::Virtual => self.simulated.execute(trigger),
            OrderMode::Real => self.broker.execute(trigger),
        }
    }

    fn name(&self) -> &str {
        "routed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::mode::GateConfig;
    use lotbot_core::{Direction, ExitReason, GroupId, PositionId, Price, ProductCode};
    use rust_decimal_macros::dec;

    fn trigger(direction: Direction) -> ExitTrigger {
        ExitTrigger {
            position_id: PositionId(1),
            group_id: GroupId(1),
            lot_id: 1,
            product: ProductCode::new("MTX00"),
            direction,
            current_price: Price::new(dec!(22510)),
            stop_price: Price::new(dec!(22516)),
            reason: ExitReason::TrailingStop,
        }
    }

    #[tokio::test]
    async fn test_simulated_exit() {
        let exec = SimulatedExitExecutor::new();
        let result = exec.execute(trigger(Direction::Long)).await;
        assert!(result.success);
        assert_eq!(result.order_id.as_deref(), Some("SX-1"));
        assert_eq!(exec.exits().len(), 1);
    }

    #[tokio::test]
    async fn test_broker_exit_sends_opposite_side() {
        let broker = Arc::new(MockBroker::new());
        let exec = BrokerExitExecutor::new(broker.clone());

        let result = exec.execute(trigger(Direction::Short)).await;
        assert!(result.success);
        let order_no = result.order_id.unwrap();
        assert!(exec.owns_order(&order_no));

        let sent = &broker.orders()[0];
        assert_eq!(sent.side, Direction::Long);
        assert_eq!(sent.price, None);
        assert_eq!(sent.purpose, OrderPurpose::Exit);
    }

    #[tokio::test]
    async fn test_simulated_history_is_bounded() {
        let exec = SimulatedExitExecutor::with_history_limit(2);
        for _ in 0..5 {
            exec.execute(trigger(Direction::Long)).await;
        }
        assert_eq!(exec.exits().len(), 2);
        assert_eq!(exec.total_exits(), 5);
    }

    #[tokio::test]
    async fn test_broker_forgets_oldest_exit_orders() {
        let broker = Arc::new(MockBroker::new());
        let exec = BrokerExitExecutor::with_order_limit(broker, 2);

        let mut order_nos = Vec::new();
        for _ in 0..3 {
            let result = exec.execute(trigger(Direction::Long)).await;
            order_nos.push(result.order_id.unwrap());
        }
        assert_eq!(exec.tracked_orders(), 2);
        assert!(!exec.owns_order(&order_nos[0]));
        assert!(exec.owns_order(&order_nos[1]));
        assert!(exec.owns_order(&order_nos[2]));
    }

    #[tokio::test]
    async fn test_broker_exit_failure_is_reported() {
        let broker = Arc::new(MockBroker::new());
        let exec = BrokerExitExecutor::new(broker.clone());

        broker.set_ready(false);
        let result = exec.execute(trigger(Direction::Long)).await;
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("broker not ready"));

        broker.set_ready(true);
        broker.set_reject(Some("market closed"));
        let result = exec.execute(trigger(Direction::Long)).await;
        assert_eq!(result.error_message.as_deref(), Some("market closed"));
    }

    #[tokio::test]
    async fn test_routed_follows_mode() {
        let broker = Arc::new(MockBroker::new());
        let gate = Arc::new(OrderModeGate::new(GateConfig::default(), broker.clone()));
        let exec = RoutedExitExecutor::new(gate.clone());

        exec.execute(trigger(Direction::Long)).await;
        assert_eq!(exec.simulated().exits().len(), 1);
        assert!(broker.orders().is_empty());

        gate.request_mode(OrderMode::Real).unwrap();
        exec.execute(trigger(Direction::Long)).await;
        assert_eq!(broker.orders().len(), 1);
    }
}
