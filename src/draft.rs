//! Multi-step wizard validation for composing a refund request.
//!
//! The draft is an explicit value threaded through pure step functions:
//! each step returns a new draft plus a list of field errors, and a draft
//! with errors is handed back unchanged. Nothing here is trusted by the
//! engine. `RefundRequest::create` re-validates every step server-side.

use crate::calculator;
use crate::error::EngineError;
use crate::money::Money;
use crate::refund::{FineInput, OrderLine, RefundType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Figures shown on the review step. Recomputed from the frozen order list;
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSummary {
    pub total_refund_amount: Money,
    pub fine_amount: Money,
    pub net_refund_amount: Money,
    pub average_per_order: Money,
}

#[derive(Debug, Clone, Default)]
pub struct RefundDraft {
    pub refund_type: Option<RefundType>,
    pub order_ids: Vec<String>,
    pub reason: Option<String>,
    pub description: Option<String>,
    pub fine: Option<FineInput>,
}

impl RefundDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step 1: pick the refund type. Membership in the enum is the only
    /// check, so this step cannot fail.
    pub fn select_type(mut self, refund_type: RefundType) -> Self {
        self.refund_type = refund_type.into();
        self
    }

    /// Step 2: pick the orders. Skipped entirely for event cancellations,
    /// which auto-select every paid order of the event at submission time.
    pub fn select_orders(self, order_ids: Vec<String>) -> (Self, Vec<FieldError>) {
        let errors = match self.refund_type {
            None => vec![FieldError::new("refund_type", "select a refund type first")],
            Some(RefundType::EventCancellation) => vec![FieldError::new(
                "order_ids",
                "orders are selected automatically when cancelling an event",
            )],
            Some(refund_type) => order_selection_errors(refund_type, &order_ids),
        };
        if !errors.is_empty() {
            return (self, errors);
        }

        let draft = Self { order_ids, ..self };
        (draft, Vec::new())
    }

    /// Step 3a: the reason shown to guests. 10 to 500 characters, with an
    /// optional description of up to 500.
    pub fn with_reason(self, reason: &str, description: Option<&str>) -> (Self, Vec<FieldError>) {
        let mut errors = Vec::new();
        reason_errors(reason, description, &mut errors);
        if !errors.is_empty() {
            return (self, errors);
        }

        let draft = Self {
            reason: Some(reason.to_string()),
            description: description.map(str::to_string),
            ..self
        };
        (draft, Vec::new())
    }

    /// Step 3b: toggle the cancellation fine. The 100% upper bound here is
    /// advisory; the calculator rejects a fine that would consume the whole
    /// refund when the request is actually created.
    pub fn with_fine(self, fine: Option<FineInput>) -> (Self, Vec<FieldError>) {
        let mut errors = Vec::new();
        if let Some(fine) = &fine {
            fine_errors(fine, &mut errors);
        }
        if !errors.is_empty() {
            return (self, errors);
        }

        let draft = Self { fine, ..self };
        (draft, Vec::new())
    }

    /// Step 4: recompute the money figures from the frozen order list for
    /// display. Fails rather than showing a figure the engine would refuse.
    pub fn review(&self, orders: &[OrderLine]) -> Result<ReviewSummary, EngineError> {
        let currency = orders
            .first()
            .map(|order| order.amount.currency())
            .ok_or(EngineError::ValidationFailed {
                field: "order_ids",
                message: "select at least one order".to_string(),
            })?;

        let mut total: i64 = 0;
        for order in orders {
            crate::money::ensure_same_currency(currency, order.amount.currency())?;
            total = total
                .checked_add(order.amount.minor_units())
                .ok_or(EngineError::ValidationFailed {
                    field: "total_refund_amount",
                    message: "refund total overflows minor units".to_string(),
                })?;
        }
        let total_refund_amount = Money::new(total, currency)?;

        let fine_amount = match &self.fine {
            Some(fine) => calculator::compute_fine(total_refund_amount, fine.percentage)?,
            None => Money::zero(currency),
        };
        let net_refund_amount = calculator::compute_net_refund(total_refund_amount, fine_amount)?;
        let average_per_order = calculator::average_per_order(net_refund_amount, orders.len())?;

        Ok(ReviewSummary {
            total_refund_amount,
            fine_amount,
            net_refund_amount,
            average_per_order,
        })
    }

    /// Re-run every step's checks against the resolved order snapshot. This
    /// is what request creation consults; a submission with any error is
    /// never turned into a request.
    pub fn validate(&self, orders: &[OrderLine]) -> Vec<FieldError> {
        let mut errors = Vec::new();

        let Some(refund_type) = self.refund_type else {
            errors.push(FieldError::new("refund_type", "select a refund type"));
            return errors;
        };

        let order_ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        match refund_type {
            // selection was automatic; the snapshot still has to be non-empty
            RefundType::EventCancellation => {
                if orders.is_empty() {
                    errors.push(FieldError::new(
                        "order_ids",
                        "the event has no paid orders to refund",
                    ));
                }
            }
            refund_type => errors.extend(order_selection_errors(refund_type, &order_ids)),
        }

        match &self.reason {
            Some(reason) => reason_errors(reason, self.description.as_deref(), &mut errors),
            None => errors.push(FieldError::new("reason", "a refund requires a reason")),
        }

        if let Some(fine) = &self.fine {
            fine_errors(fine, &mut errors);
        }

        errors
    }
}

fn order_selection_errors(refund_type: RefundType, order_ids: &[String]) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match refund_type {
        RefundType::SingleOrder if order_ids.len() != 1 => {
            errors.push(FieldError::new("order_ids", "select only one order"));
        }
        RefundType::BulkRefund if order_ids.is_empty() => {
            errors.push(FieldError::new("order_ids", "select at least one order"));
        }
        _ => {}
    }

    let mut seen = std::collections::BTreeSet::new();
    for order_id in order_ids {
        if !seen.insert(order_id) {
            errors.push(FieldError::new(
                "order_ids",
                format!("order {order_id} is selected twice"),
            ));
        }
    }
    errors
}

fn reason_errors(reason: &str, description: Option<&str>, errors: &mut Vec<FieldError>) {
    let len = reason.trim().chars().count();
    if len < 10 {
        errors.push(FieldError::new(
            "reason",
            "the reason must be at least 10 characters",
        ));
    } else if len > 500 {
        errors.push(FieldError::new(
            "reason",
            "the reason must be at most 500 characters",
        ));
    }
    if let Some(description) = description
        && description.chars().count() > 500
    {
        errors.push(FieldError::new(
            "description",
            "the description must be at most 500 characters",
        ));
    }
}

fn fine_errors(fine: &FineInput, errors: &mut Vec<FieldError>) {
    if fine.percentage == 0 || fine.percentage > 100 {
        errors.push(FieldError::new(
            "fine_percentage",
            "the fine must be between 1 and 100 percent",
        ));
    }
    if fine.reason.trim().is_empty() {
        errors.push(FieldError::new("fine_reason", "a fine requires a reason"));
    }
}
