//! Data contracts for the external collaborators the engine consumes.
//!
//! The engine never talks to a transport: order totals, payout balances and
//! per-order refund outcomes come back through these traits as plain data.
//! Retry, backoff and timeout policy all belong to the collaborator side.

use crate::money::{Currency, Money};

/// A collaborator call failed outright. Surfaced to callers as
/// `EngineError::CollaboratorUnavailable`; the engine does not mutate state.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct CollabError(pub String);

/// Order totals as seen at request-creation time. The engine trusts this
/// snapshot and never re-queries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub total: Money,
    pub paid: bool,
}

pub trait OrderCatalog {
    /// Resolve the given order references for an event.
    fn orders(&self, event_id: &str, order_ids: &[String])
    -> Result<Vec<OrderSnapshot>, CollabError>;

    /// All paid orders of an event, used when a whole event is cancelled.
    fn paid_orders(&self, event_id: &str) -> Result<Vec<OrderSnapshot>, CollabError>;
}

/// Opaque reference to an initiated payout, echoed back on confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid,
    Failed { reason: String },
}

pub trait PayoutProvider {
    fn available_balance(&self, currency: Currency) -> Result<Money, CollabError>;
    fn initiate_payout(&self, amount: Money, destination: &str)
    -> Result<PayoutHandle, CollabError>;
    fn confirm_payout(&self, handle: &PayoutHandle) -> Result<PayoutOutcome, CollabError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Success,
    Failure { reason: String },
}

/// Invoked once per order when a refund request is processed. A failure here
/// is counted rather than propagated, since partial failure is a valid
/// terminal outcome of the batch.
pub trait OrderRefunder {
    fn refund_order(&self, order_id: &str, net_amount: Money) -> RefundOutcome;
}
