//! Refund request lifecycle: reversing ticket orders, optionally minus a
//! cancellation fine.
//!
//! PENDING -> APPROVED -> PROCESSED, with REJECTED as the other terminal.
//! Processing fans out one refund instruction per order; partial failure is
//! a valid terminal outcome, surfaced through the processed/failed counts.

use std::fmt;

use chrono::Utc;

use crate::audit::{Actor, AuditAction};
use crate::calculator;
use crate::draft::RefundDraft;
use crate::error::EngineError;
use crate::money::{Currency, Money, ensure_same_currency};
use crate::utils::{self, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Processed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Approved => "APPROVED",
            RefundStatus::Rejected => "REJECTED",
            RefundStatus::Processed => "PROCESSED",
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefundStatus::Rejected | RefundStatus::Processed)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundType {
    #[n(0)]
    EventCancellation,
    #[n(1)]
    BulkRefund,
    #[n(2)]
    SingleOrder,
}

/// Who asked for the refund. Guest contact details and organizer ids are
/// mutually exclusive by construction.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    #[n(0)]
    Organizer {
        #[n(0)]
        id: String,
    },
    #[n(1)]
    Guest {
        #[n(0)]
        name: String,
        #[n(1)]
        email: String,
    },
}

impl Requester {
    pub fn is_guest(&self) -> bool {
        matches!(self, Requester::Guest { .. })
    }

    /// Where status notifications for this request go.
    pub fn recipient(&self) -> &str {
        match self {
            Requester::Organizer { id } => id,
            Requester::Guest { email, .. } => email,
        }
    }
}

/// One order's share of the refund, snapshotted from the order collaborator
/// at creation time and never re-queried.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct OrderLine {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub amount: Money,
}

/// Fine details supplied by a caller, before amounts are computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineInput {
    pub percentage: u8,
    pub reason: String,
}

/// A validated cancellation fine with its computed amount.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Fine {
    #[n(0)]
    pub percentage: u8,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub amount: Money,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct RefundRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub event_id: String,
    #[n(2)]
    pub requester: Requester,
    #[n(3)]
    pub refund_type: RefundType,
    #[n(4)]
    pub orders: Vec<OrderLine>,
    #[n(5)]
    pub currency: Currency,
    #[n(6)]
    pub total_refund_amount: Money,
    #[n(7)]
    pub fine: Option<Fine>,
    #[n(8)]
    pub reason: String,
    #[n(9)]
    pub description: Option<String>,
    #[n(10)]
    pub status: RefundStatus,
    #[n(11)]
    pub rejection_reason: Option<String>,
    #[n(12)]
    pub admin_notes: Option<String>,
    #[n(13)]
    pub approved_by: Option<String>,
    #[n(14)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub rejected_by: Option<String>,
    #[n(16)]
    pub rejected_at: Option<TimeStamp<Utc>>,
    #[n(17)]
    pub processed_by: Option<String>,
    #[n(18)]
    pub processed_at: Option<TimeStamp<Utc>>,
    #[n(19)]
    pub refunds_processed: Option<u32>,
    #[n(20)]
    pub refunds_failed: Option<u32>,
    #[n(21)]
    pub requested_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone)]
pub enum RefundCommand {
    Approve {
        admin_notes: Option<String>,
    },
    Reject {
        reason: String,
    },
    /// Terminal transition recorded after the per-order refund instructions
    /// have all reported back. An optional fine supplied here replaces the
    /// one captured at creation, after full re-validation.
    Process {
        fine: Option<FineInput>,
        processed: u32,
        failed: u32,
    },
}

impl RefundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RefundCommand::Approve { .. } => "approve",
            RefundCommand::Reject { .. } => "reject",
            RefundCommand::Process { .. } => "process",
        }
    }
}

/// Validate a fine against a refund total: percentage strictly inside
/// (0, 100), non-empty reason, and the fine must leave a positive net.
pub(crate) fn validate_fine(total: Money, input: &FineInput) -> Result<Fine, EngineError> {
    if input.percentage == 0 {
        return Err(EngineError::InvalidFinePercentage(0));
    }
    if input.reason.trim().is_empty() {
        return Err(EngineError::ValidationFailed {
            field: "fine_reason",
            message: "a fine requires a reason".to_string(),
        });
    }
    let amount = calculator::compute_fine(total, input.percentage)?;
    calculator::compute_net_refund(total, amount)?;
    Ok(Fine {
        percentage: input.percentage,
        reason: input.reason.clone(),
        amount,
    })
}

impl RefundRequest {
    /// Server-side creation from an accumulated wizard draft. All wizard
    /// steps are re-validated here; client-side results are advisory only.
    pub fn create(
        draft: RefundDraft,
        requester: Requester,
        event_id: String,
        orders: Vec<OrderLine>,
    ) -> anyhow::Result<Self> {
        if let Some(error) = draft.validate(&orders).into_iter().next() {
            return Err(EngineError::ValidationFailed {
                field: error.field,
                message: error.message,
            }
            .into());
        }
        // validate() guarantees the type is present
        let refund_type = draft.refund_type.ok_or(EngineError::ValidationFailed {
            field: "refund_type",
            message: "select a refund type".to_string(),
        })?;

        let currency = orders[0].amount.currency();
        let mut total: i64 = 0;
        for order in &orders {
            ensure_same_currency(currency, order.amount.currency())?;
            total = total
                .checked_add(order.amount.minor_units())
                .ok_or(EngineError::ValidationFailed {
                    field: "total_refund_amount",
                    message: "refund total overflows minor units".to_string(),
                })?;
        }
        let total_refund_amount = Money::new(total, currency)?;

        let fine = match &draft.fine {
            Some(input) => Some(validate_fine(total_refund_amount, input)?),
            None => None,
        };

        let reason = draft.reason.clone().ok_or(EngineError::ValidationFailed {
            field: "reason",
            message: "a refund requires a reason".to_string(),
        })?;

        Ok(Self {
            id: utils::new_request_id(utils::REFUND_HRP)?,
            event_id,
            requester,
            refund_type,
            orders,
            currency,
            total_refund_amount,
            fine,
            reason,
            description: draft.description.clone(),
            status: RefundStatus::Pending,
            rejection_reason: None,
            admin_notes: None,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            processed_by: None,
            processed_at: None,
            refunds_processed: None,
            refunds_failed: None,
            requested_at: TimeStamp::new(),
        })
    }

    pub fn has_fine(&self) -> bool {
        self.fine.is_some()
    }

    pub fn fine_amount(&self) -> Money {
        match &self.fine {
            Some(fine) => fine.amount,
            None => Money::zero(self.currency),
        }
    }

    /// Always recomputed from the total and the fine, never stored.
    pub fn net_refund_amount(&self) -> Result<Money, EngineError> {
        match &self.fine {
            Some(fine) => calculator::compute_net_refund(self.total_refund_amount, fine.amount),
            None => Ok(self.total_refund_amount),
        }
    }

    pub fn order_ids(&self) -> impl Iterator<Item = &str> {
        self.orders.iter().map(|order| order.order_id.as_str())
    }

    fn require_status(
        &self,
        wanted: RefundStatus,
        command: &'static str,
    ) -> Result<(), EngineError> {
        if self.status != wanted {
            return Err(EngineError::InvalidTransition {
                from: self.status.as_str(),
                command,
            });
        }
        Ok(())
    }

    /// Apply a command. Guards are checked before the first mutation.
    pub fn apply(
        &mut self,
        command: RefundCommand,
        actor: &Actor,
        now: TimeStamp<Utc>,
    ) -> Result<AuditAction, EngineError> {
        match command {
            RefundCommand::Approve { admin_notes } => {
                self.require_status(RefundStatus::Pending, "approve")?;

                self.status = RefundStatus::Approved;
                self.admin_notes = admin_notes;
                self.approved_by = Some(actor.id.clone());
                self.approved_at = Some(now);
                Ok(AuditAction::Approved)
            }

            RefundCommand::Reject { reason } => {
                self.require_status(RefundStatus::Pending, "reject")?;
                if reason.trim().chars().count() < 10 {
                    return Err(EngineError::ValidationFailed {
                        field: "rejection_reason",
                        message: "a rejection requires a reason of at least 10 characters"
                            .to_string(),
                    });
                }

                self.status = RefundStatus::Rejected;
                self.rejection_reason = Some(reason);
                self.rejected_by = Some(actor.id.clone());
                self.rejected_at = Some(now);
                Ok(AuditAction::Rejected)
            }

            RefundCommand::Process {
                fine,
                processed,
                failed,
            } => {
                self.require_status(RefundStatus::Approved, "process")?;
                let fine = match &fine {
                    Some(input) => Some(validate_fine(self.total_refund_amount, input)?),
                    None => self.fine.clone(),
                };

                self.fine = fine;
                self.status = RefundStatus::Processed;
                self.refunds_processed = Some(processed);
                self.refunds_failed = Some(failed);
                self.processed_by = Some(actor.id.clone());
                self.processed_at = Some(now);
                Ok(AuditAction::Processed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ActorRole;
    use crate::draft::RefundDraft;

    fn admin() -> Actor {
        Actor::new("usr_admin", ActorRole::Admin)
    }

    fn order(id: &str, minor: i64) -> OrderLine {
        OrderLine {
            order_id: id.to_string(),
            amount: Money::new(minor, Currency::GBP).unwrap(),
        }
    }

    fn pending_request(fine: Option<FineInput>) -> RefundRequest {
        let draft = RefundDraft::new().select_type(RefundType::BulkRefund);
        let (draft, errors) =
            draft.select_orders(vec!["ord_1".to_string(), "ord_2".to_string()]);
        assert!(errors.is_empty());
        let (draft, errors) = draft.with_reason(
            "duplicate charge reported by several guests",
            None,
        );
        assert!(errors.is_empty());
        let (draft, errors) = draft.with_fine(fine);
        assert!(errors.is_empty());

        RefundRequest::create(
            draft,
            Requester::Organizer {
                id: "org_1".to_string(),
            },
            "evt_1".to_string(),
            vec![order("ord_1", 12_000), order("ord_2", 8_000)],
        )
        .unwrap()
    }

    #[test]
    fn create_sums_order_totals() {
        let request = pending_request(None);

        assert_eq!(request.status, RefundStatus::Pending);
        assert_eq!(request.total_refund_amount.minor_units(), 20_000);
        assert!(!request.has_fine());
        assert_eq!(request.net_refund_amount().unwrap().minor_units(), 20_000);
        assert!(request.id.starts_with("rfn1"));
        assert!(!request.requester.is_guest());
    }

    #[test]
    fn create_with_fine_computes_amounts() {
        let request = pending_request(Some(FineInput {
            percentage: 15,
            reason: "organizer cancellation policy".to_string(),
        }));

        assert_eq!(request.fine_amount().minor_units(), 3_000);
        assert_eq!(request.net_refund_amount().unwrap().minor_units(), 17_000);
    }

    #[test]
    fn full_fine_is_rejected_at_creation() {
        let draft = RefundDraft::new().select_type(RefundType::BulkRefund);
        let (draft, _) = draft.select_orders(vec!["ord_1".to_string()]);
        let (draft, _) = draft.with_reason("event moved and guests want out", None);
        let (draft, errors) = draft.with_fine(Some(FineInput {
            percentage: 100,
            reason: "full penalty".to_string(),
        }));
        // step three treats the upper bound as advisory
        assert!(errors.is_empty());

        let err = RefundRequest::create(
            draft,
            Requester::Organizer {
                id: "org_1".to_string(),
            },
            "evt_1".to_string(),
            vec![order("ord_1", 10_000)],
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidFinePercentage(100))
        ));
    }

    #[test]
    fn approve_then_process_with_partial_failure() {
        let mut request = pending_request(None);

        request
            .apply(
                RefundCommand::Approve { admin_notes: None },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();
        assert_eq!(request.status, RefundStatus::Approved);

        request
            .apply(
                RefundCommand::Process {
                    fine: None,
                    processed: 1,
                    failed: 1,
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        assert_eq!(request.status, RefundStatus::Processed);
        assert_eq!(request.refunds_processed, Some(1));
        assert_eq!(request.refunds_failed, Some(1));
        assert!(request.status.is_terminal());
    }

    #[test]
    fn process_from_pending_is_invalid() {
        let mut request = pending_request(None);

        let err = request
            .apply(
                RefundCommand::Process {
                    fine: None,
                    processed: 2,
                    failed: 0,
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: "PENDING",
                command: "process"
            }
        ));
        assert_eq!(request.status, RefundStatus::Pending);
        assert!(request.refunds_processed.is_none());
    }

    #[test]
    fn process_can_apply_a_late_fine() {
        let mut request = pending_request(None);
        request
            .apply(
                RefundCommand::Approve { admin_notes: None },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        request
            .apply(
                RefundCommand::Process {
                    fine: Some(FineInput {
                        percentage: 10,
                        reason: "late cancellation".to_string(),
                    }),
                    processed: 2,
                    failed: 0,
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        assert_eq!(request.fine_amount().minor_units(), 2_000);
        assert_eq!(request.net_refund_amount().unwrap().minor_units(), 18_000);
    }

    #[test]
    fn process_rejects_a_zero_percentage_fine() {
        let mut request = pending_request(None);
        request
            .apply(
                RefundCommand::Approve { admin_notes: None },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        let err = request
            .apply(
                RefundCommand::Process {
                    fine: Some(FineInput {
                        percentage: 0,
                        reason: "none".to_string(),
                    }),
                    processed: 2,
                    failed: 0,
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidFinePercentage(0)));
        assert_eq!(request.status, RefundStatus::Approved);
    }

    #[test]
    fn guest_requesters_are_notified_by_email() {
        let requester = Requester::Guest {
            name: "Sam Doe".to_string(),
            email: "sam@example.com".to_string(),
        };
        assert!(requester.is_guest());
        assert_eq!(requester.recipient(), "sam@example.com");
    }

    #[test]
    fn cbor_roundtrip() {
        let original = pending_request(Some(FineInput {
            percentage: 15,
            reason: "organizer cancellation policy".to_string(),
        }));

        let encoding = minicbor::to_vec(&original).unwrap();
        let decode: RefundRequest = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }
}
