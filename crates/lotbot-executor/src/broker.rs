//! Broker command surface.
//!
//! The broker is push-only for reports (they arrive through the reply
//! connection and the feed parser) and command-only for orders: submissions
//! and cancels are acknowledged asynchronously. [`BrokerGateway`] abstracts
//! the command side so the core never holds a vendor handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lotbot_core::{Direction, GroupId, Price, ProductCode};
use lotbot_position::BoxFuture;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::readiness::BrokerReadiness;

/// What an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderPurpose {
    Entry,
    Exit,
}

/// An order handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Client-side reference for log correlation.
    pub client_ref: String,
    pub group_id: Option<GroupId>,
    pub product: ProductCode,
    /// Trade side expressed as the position direction it opens
    /// (`Long` = buy, `Short` = sell).
    pub side: Direction,
    pub quantity: u32,
    /// Limit price; `None` for a market order.
    pub price: Option<Price>,
    pub max_slippage_points: Decimal,
    pub purpose: OrderPurpose,
}

impl OrderRequest {
    /// Generate a client reference like `ent-1a2b3c4d`.
    pub fn new_client_ref(purpose: OrderPurpose) -> String {
        let prefix = match purpose {
            OrderPurpose::Entry => "ent",
            OrderPurpose::Exit => "ext",
        };
        format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..8])
    }
}

/// Broker acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAck {
    /// Accepted; `order_no` is the broker order number.
    Accepted { order_no: String },
    Rejected { reason: String },
}

impl SubmitAck {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitAck::Accepted { .. })
    }
}

/// Broker command gateway.
pub trait BrokerGateway: Send + Sync {
    /// Readiness probe: logged in with order and reply connections up.
    fn is_ready(&self) -> bool;

    fn submit_order(&self, request: OrderRequest) -> BoxFuture<'_, SubmitAck>;

    fn cancel_order(&self, order_no: String) -> BoxFuture<'_, SubmitAck>;
}

/// Arc wrapper for BrokerGateway trait objects.
pub type DynBrokerGateway = Arc<dyn BrokerGateway>;

/// In-process broker for tests and offline runs.
///
/// Accepts every order with sequential order numbers unless told to reject.
#[derive(Debug)]
pub struct MockBroker {
    readiness: BrokerReadiness,
    orders: parking_lot::Mutex<Vec<OrderRequest>>,
    cancels: parking_lot::Mutex<Vec<String>>,
    reject_reason: parking_lot::Mutex<Option<String>>,
    next_order_no: AtomicU64,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a ready mock broker.
    pub fn new() -> Self {
        let (readiness, _rx) = BrokerReadiness::new();
        readiness.set_all(true);
        Self {
            readiness,
            orders: parking_lot::Mutex::new(Vec::new()),
            cancels: parking_lot::Mutex::new(Vec::new()),
            reject_reason: parking_lot::Mutex::new(None),
            next_order_no: AtomicU64::new(1),
        }
    }

    pub fn readiness(&self) -> &BrokerReadiness {
        &self.readiness
    }

    pub fn set_ready(&self, ready: bool) {
        self.readiness.set_all(ready);
    }

    /// Reject every subsequent command with `reason` (`None` to accept again).
    pub fn set_reject(&self, reason: Option<&str>) {
        *self.reject_reason.lock() = reason.map(str::to_string);
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    fn ack(&self) -> SubmitAck {
        if let Some(reason) = self.reject_reason.lock().clone() {
            return SubmitAck::Rejected { reason };
        }
        if !self.readiness.is_ready() {
            return SubmitAck::Rejected {
                reason: "not connected".to_string(),
            };
        }
        let n = self.next_order_no.fetch_add(1, Ordering::Relaxed);
        SubmitAck::Accepted {
            order_no: format!("M{n:06}"),
        }
    }
}

impl BrokerGateway for MockBroker {
    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    fn submit_order(&self, request: OrderRequest) -> BoxFuture<'_, SubmitAck> {
        Box::pin(async move {
            let ack = self.ack();
            self.orders.lock().push(request);
            ack
        })
    }

    fn cancel_order(&self, order_no: String) -> BoxFuture<'_, SubmitAck> {
        Box::pin(async move {
            let ack = match self.ack() {
                SubmitAck::Accepted { .. } => SubmitAck::Accepted {
                    order_no: order_no.clone(),
                },
                rejected => rejected,
            };
            self.cancels.lock().push(order_no);
            ack
        })
    }
}
