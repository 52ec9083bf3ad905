//! Order routing for lotbot.
//!
//! # Key Components
//!
//! - [`OrderModeGate`]: Virtual/real mode switch. Virtual orders become
//!   synthetic fills; real orders go to the broker and await confirmation
//! - [`BrokerReadiness`]: Login and connection flags behind the readiness probe
//! - [`BrokerGateway`]: Broker command surface (submit/cancel) with a
//!   [`MockBroker`] for tests and offline runs
//! - Exit executors: [`SimulatedExitExecutor`], [`BrokerExitExecutor`] and
//!   the mode-following [`RoutedExitExecutor`]

pub mod broker;
pub mod error;
pub mod exit;
pub mod mode;
pub mod readiness;

pub use broker::{BrokerGateway, DynBrokerGateway, MockBroker, OrderPurpose, OrderRequest, SubmitAck};
pub use error::{ExecutorError, ExecutorResult};
pub use exit::{BrokerExitExecutor, RoutedExitExecutor, SimulatedExitExecutor};
pub use mode::{EntryOrder, GateConfig, OrderMode, OrderModeGate, Submission, UnconfirmedOrder};
pub use readiness::BrokerReadiness;
