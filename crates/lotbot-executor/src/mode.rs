//! Virtual/real order-mode gate.
//!
//! In virtual mode an entry order is answered with a synthetic Filled report
//! at the requested price; nothing reaches the broker or the report parser.
//! In real mode the order goes through the [`BrokerGateway`] and waits for
//! the reconciler to see a matching fill or cancel. Orders that never get
//! one within `confirm_timeout_ms` are surfaced by
//! [`OrderModeGate::expire_unconfirmed`].

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lotbot_core::{now_ms, Direction, FillEvent, GroupId, Price, ProductCode, SequenceId};
use lotbot_telemetry::Metrics;

use crate::broker::{BrokerGateway, OrderPurpose, OrderRequest, SubmitAck};
use crate::error::{ExecutorError, ExecutorResult};

/// Order routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    Virtual,
    Real,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Virtual => "virtual",
            Self::Real => "real",
        }
    }
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderMode {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtual" | "sim" => Ok(Self::Virtual),
            "real" | "live" => Ok(Self::Real),
            other => Err(ExecutorError::InvalidMode(other.to_string())),
        }
    }
}

fn default_confirm_timeout_ms() -> u64 {
    10_000
}

/// Gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// How long a real order may wait for its first report.
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout_ms(),
        }
    }
}

/// Entry order for the lots of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOrder {
    pub group_id: GroupId,
    pub product: ProductCode,
    pub direction: Direction,
    pub price: Price,
    pub quantity: u32,
    pub max_slippage_points: Decimal,
}

/// How an entry order was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Synthetic fill to feed straight into the reconciler.
    Virtual(FillEvent),
    /// Accepted by the broker, awaiting reports.
    Real { order_no: String, deadline_ms: u64 },
}

/// A real order still waiting for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedOrder {
    pub order_no: String,
    pub group_id: GroupId,
    pub product: ProductCode,
    pub direction: Direction,
    /// Units not yet seen in a fill or cancel report.
    pub remaining: u32,
    pub submitted_at: u64,
    pub deadline_ms: u64,
}

impl UnconfirmedOrder {
    pub fn to_error(&self) -> ExecutorError {
        ExecutorError::UnconfirmedOrder {
            order_no: self.order_no.clone(),
            product: self.product.clone(),
        }
    }
}

/// Virtual/real order-mode gate.
pub struct OrderModeGate {
    config: GateConfig,
    broker: Arc<dyn BrokerGateway>,
    mode: RwLock<OrderMode>,
    awaiting: Mutex<VecDeque<UnconfirmedOrder>>,
    virtual_seq: AtomicU64,
}

impl OrderModeGate {
    /// Create a gate in virtual mode.
    pub fn new(config: GateConfig, broker: Arc<dyn BrokerGateway>) -> Self {
        Metrics::order_mode_set(OrderMode::Virtual.as_str());
        Self {
            config,
            broker,
            mode: RwLock::new(OrderMode::Virtual),
            awaiting: Mutex::new(VecDeque::new()),
            virtual_seq: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn mode(&self) -> OrderMode {
        *self.mode.read()
    }

    pub fn broker(&self) -> &Arc<dyn BrokerGateway> {
        &self.broker
    }

    /// Switch modes. Real mode requires the broker probe to be ready;
    /// otherwise the mode is left unchanged.
    pub fn request_mode(&self, requested: OrderMode) -> ExecutorResult<OrderMode> {
        if requested == OrderMode::Real && !self.broker.is_ready() {
            warn!(current = %self.mode(), "Real mode refused, broker API not ready");
            return Err(ExecutorError::ApiNotReady(
                "login, order and reply connections must all be up".to_string(),
            ));
        }
        let previous = std::mem::replace(&mut *self.mode.write(), requested);
        if previous != requested {
            info!(from = %previous, to = %requested, "Order mode changed");
            Metrics::order_mode_set(requested.as_str());
        }
        Ok(requested)
    }

    /// Route an entry order according to the current mode.
    pub async fn submit(&self, order: EntryOrder) -> ExecutorResult<Submission> {
        if order.quantity == 0 {
            return Err(ExecutorError::InvalidOrder("quantity must be >= 1".to_string()));
        }
        if !order.price.is_positive() {
            return Err(ExecutorError::InvalidOrder(format!(
                "price must be positive, got {}",
                order.price
            )));
        }

        match self.mode() {
            OrderMode::Virtual => Ok(self.simulate(order)),
            OrderMode::Real => self.submit_real(order).await,
        }
    }

    fn simulate(&self, order: EntryOrder) -> Submission {
        let seq = self.virtual_seq.fetch_add(1, Ordering::Relaxed);
        let event = FillEvent::filled(
            order.product,
            order.price,
            order.quantity,
            SequenceId::new(format!("V-{seq}")),
            Some(order.direction),
        );
        debug!(
            group_id = %order.group_id,
            sequence_id = %event.sequence_id,
            price = %event.price,
            quantity = event.quantity,
            "Virtual fill synthesized"
        );
        Metrics::order_submitted("virtual", "filled");
        Submission::Virtual(event)
    }

    async fn submit_real(&self, order: EntryOrder) -> ExecutorResult<Submission> {
        if !self.broker.is_ready() {
            Metrics::order_submitted("real", "not_ready");
            return Err(ExecutorError::ApiNotReady(
                "broker probe lost before submission".to_string(),
            ));
        }

        let request = OrderRequest {
            client_ref: OrderRequest::new_client_ref(OrderPurpose::Entry),
            group_id: Some(order.group_id),
            product: order.product.clone(),
            side: order.direction,
            quantity: order.quantity,
            price: Some(order.price),
            max_slippage_points: order.max_slippage_points,
            purpose: OrderPurpose::Entry,
        };
        let client_ref = request.client_ref.clone();

        match self.broker.submit_order(request).await {
            SubmitAck::Accepted { order_no } => {
                let submitted_at = now_ms();
                let deadline_ms = submitted_at + self.config.confirm_timeout_ms;
                self.awaiting.lock().push_back(UnconfirmedOrder {
                    order_no: order_no.clone(),
                    group_id: order.group_id,
                    product: order.product,
                    direction: order.direction,
                    remaining: order.quantity,
                    submitted_at,
                    deadline_ms,
                });
                info!(
                    group_id = %order.group_id,
                    order_no = %order_no,
                    client_ref = %client_ref,
                    quantity = order.quantity,
                    "Real order accepted"
                );
                Metrics::order_submitted("real", "accepted");
                Ok(Submission::Real {
                    order_no,
                    deadline_ms,
                })
            }
            SubmitAck::Rejected { reason } => {
                warn!(
                    group_id = %order.group_id,
                    client_ref = %client_ref,
                    reason = %reason,
                    "Real order rejected by gateway"
                );
                Metrics::order_submitted("real", "rejected");
                Err(ExecutorError::SubmissionFailed(reason))
            }
        }
    }

    /// Confirm `quantity` units reported for `product`, oldest orders first.
    ///
    /// Returns the number of units confirmed.
    pub fn confirm(
        &self,
        product: &ProductCode,
        direction: Option<Direction>,
        quantity: u32,
    ) -> u32 {
        let mut awaiting = self.awaiting.lock();
        let mut left = quantity;
        for entry in awaiting.iter_mut() {
            if left == 0 {
                break;
            }
            let matches = &entry.product == product && direction.map_or(true, |d| d == entry.direction);
            if !matches || entry.remaining == 0 {
                continue;
            }
            let take = entry.remaining.min(left);
            entry.remaining -= take;
            left -= take;
        }
        awaiting.retain(|e| e.remaining > 0);
        quantity - left
    }

    /// Remove and return orders past their confirmation deadline.
    pub fn expire_unconfirmed(&self, now: u64) -> Vec<UnconfirmedOrder> {
        let mut awaiting = self.awaiting.lock();
        let (expired, kept): (VecDeque<_>, VecDeque<_>) =
            awaiting.drain(..).partition(|e| now >= e.deadline_ms);
        *awaiting = kept;
        drop(awaiting);

        for order in &expired {
            warn!(
                order_no = %order.order_no,
                group_id = %order.group_id,
                product = %order.product,
                remaining = order.remaining,
                waited_ms = now.saturating_sub(order.submitted_at),
                "Order unconfirmed past deadline"
            );
            Metrics::unconfirmed_order();
        }
        expired.into_iter().collect()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use lotbot_core::ReportType;
    use rust_decimal_macros::dec;

    fn order(quantity: u32) -> EntryOrder {
        EntryOrder {
            group_id: GroupId(1),
            product: ProductCode::new("MTX00"),
            direction: Direction::Short,
            price: Price::new(dec!(22573)),
            quantity,
            max_slippage_points: dec!(5),
        }
    }

    fn gate() -> (OrderModeGate, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::new());
        (OrderModeGate::new(GateConfig::default(), broker.clone()), broker)
    }

    #[tokio::test]
    async fn test_virtual_mode_synthesizes_fill() {
        let (gate, broker) = gate();
        assert_eq!(gate.mode(), OrderMode::Virtual);

        let Submission::Virtual(event) = gate.submit(order(3)).await.unwrap() else {
            panic!("expected virtual fill");
        };
        assert_eq!(event.report_type, ReportType::Filled);
        assert_eq!(event.quantity, 3);
        assert_eq!(event.price.inner(), dec!(22573));
        assert_eq!(event.direction, Some(Direction::Short));
        assert!(event.sequence_id.as_str().starts_with("V-"));
        assert!(broker.orders().is_empty());

        let Submission::Virtual(next) = gate.submit(order(1)).await.unwrap() else {
            panic!("expected virtual fill");
        };
        assert_ne!(next.sequence_id, event.sequence_id);
    }

    #[test]
    fn test_real_mode_refused_when_not_ready() {
        let (gate, broker) = gate();
        broker.set_ready(false);
        assert!(matches!(
            gate.request_mode(OrderMode::Real),
            Err(ExecutorError::ApiNotReady(_))
        ));
        assert_eq!(gate.mode(), OrderMode::Virtual);

        broker.set_ready(true);
        assert_eq!(gate.request_mode(OrderMode::Real).unwrap(), OrderMode::Real);
        assert_eq!(gate.request_mode(OrderMode::Virtual).unwrap(), OrderMode::Virtual);
    }

    #[tokio::test]
    async fn test_real_submit_rechecks_probe() {
        let (gate, broker) = gate();
        gate.request_mode(OrderMode::Real).unwrap();
        broker.set_ready(false);
        assert!(matches!(
            gate.submit(order(1)).await,
            Err(ExecutorError::ApiNotReady(_))
        ));
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_real_submit_and_confirm() {
        let (gate, broker) = gate();
        gate.request_mode(OrderMode::Real).unwrap();

        let Submission::Real { order_no, .. } = gate.submit(order(2)).await.unwrap() else {
            panic!("expected real submission");
        };
        assert_eq!(order_no, "M000001");
        assert_eq!(broker.orders()[0].side, Direction::Short);
        assert_eq!(gate.awaiting_count(), 1);

        let product = ProductCode::new("MTX00");
        assert_eq!(gate.confirm(&product, Some(Direction::Long), 1), 0);
        assert_eq!(gate.confirm(&product, Some(Direction::Short), 1), 1);
        assert_eq!(gate.awaiting_count(), 1);
        assert_eq!(gate.confirm(&product, None, 5), 1);
        assert_eq!(gate.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_rejection() {
        let (gate, broker) = gate();
        gate.request_mode(OrderMode::Real).unwrap();
        broker.set_reject(Some("insufficient margin"));
        assert!(matches!(
            gate.submit(order(1)).await,
            Err(ExecutorError::SubmissionFailed(reason)) if reason == "insufficient margin"
        ));
        assert_eq!(gate.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_unconfirmed() {
        let (gate, _broker) = gate();
        gate.request_mode(OrderMode::Real).unwrap();
        let Submission::Real { deadline_ms, .. } = gate.submit(order(1)).await.unwrap() else {
            panic!("expected real submission");
        };

        assert!(gate.expire_unconfirmed(deadline_ms - 1).is_empty());
        let expired = gate.expire_unconfirmed(deadline_ms);
        assert_eq!(expired.len(), 1);
        assert!(matches!(
            expired[0].to_error(),
            ExecutorError::UnconfirmedOrder { .. }
        ));
        assert_eq!(gate.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_orders() {
        let (gate, _broker) = gate();
        assert!(matches!(
            gate.submit(order(0)).await,
            Err(ExecutorError::InvalidOrder(_))
        ));
        let mut zero_price = order(1);
        zero_price.price = Price::ZERO;
        assert!(gate.submit(zero_price).await.is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("REAL".parse::<OrderMode>().unwrap(), OrderMode::Real);
        assert_eq!("virtual".parse::<OrderMode>().unwrap(), OrderMode::Virtual);
        assert!("paper".parse::<OrderMode>().is_err());
    }
}
