//! Settlement request lifecycle: an organizer withdrawing net event earnings.
//!
//! The state machine is PENDING -> APPROVED -> PAID, with REJECTED as the
//! other terminal. A Stripe payout is a two-step affair: `PayStripe` records
//! the initiated payout while the request stays APPROVED, and only
//! `ConfirmPayout` with a `Paid` outcome moves it to PAID. A settlement is
//! never reported paid before funds actually move.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;

use crate::audit::{Actor, AuditAction};
use crate::calculator::{self, FeePaidBy};
use crate::collab::PayoutOutcome;
use crate::error::EngineError;
use crate::money::{Adjustment, Currency, Money, ensure_same_currency};
use crate::utils::{self, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Paid,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Approved => "APPROVED",
            SettlementStatus::Rejected => "REJECTED",
            SettlementStatus::Paid => "PAID",
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Rejected | SettlementStatus::Paid)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    #[n(0)]
    BankTransfer,
    #[n(1)]
    Stripe,
}

/// Inputs to create a new settlement request. Order totals, fees and refund
/// totals are supplied by the caller; the engine only derives the payable
/// amounts from them.
#[derive(Debug, Clone)]
pub struct NewSettlement {
    pub event_id: String,
    pub organizer_id: String,
    pub currency: Currency,
    pub total_sales: Money,
    pub processing_fees: Money,
    pub total_refunds: Money,
    pub platform_fee_percentage: u8,
    pub parlomo_fee: Money,
    pub fee_paid_by: FeePaidBy,
    /// Opaque payout destination details, validated externally.
    pub payment_details: BTreeMap<String, String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub event_id: String,
    #[n(2)]
    pub organizer_id: String,
    #[n(3)]
    pub currency: Currency,
    #[n(4)]
    pub total_sales: Money,
    #[n(5)]
    pub processing_fees: Money,
    #[n(6)]
    pub total_refunds: Money,
    #[n(7)]
    pub platform_fee: Money,
    #[n(8)]
    pub platform_fee_percentage: u8,
    #[n(9)]
    pub parlomo_fee: Money,
    #[n(10)]
    pub fee_paid_by: FeePaidBy,
    /// Settlement base amount; may be negative when the organizer owes the
    /// platform.
    #[n(11)]
    pub amount: Adjustment,
    #[n(12)]
    pub admin_adjustment: Option<Adjustment>,
    #[n(13)]
    pub adjustment_reason: Option<String>,
    #[n(14)]
    pub final_amount: Adjustment,
    #[n(15)]
    pub status: SettlementStatus,
    #[n(16)]
    pub payment_method: Option<PaymentMethod>,
    #[n(17)]
    pub payment_details: BTreeMap<String, String>,
    #[n(18)]
    pub transaction_reference: Option<String>,
    #[n(19)]
    pub payment_description: Option<String>,
    #[n(20)]
    pub rejection_reason: Option<String>,
    #[n(21)]
    pub approved_by: Option<String>,
    #[n(22)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(23)]
    pub rejected_by: Option<String>,
    #[n(24)]
    pub rejected_at: Option<TimeStamp<Utc>>,
    #[n(25)]
    pub paid_by: Option<String>,
    #[n(26)]
    pub paid_at: Option<TimeStamp<Utc>>,
    /// Set while a Stripe payout is awaiting provider confirmation.
    #[n(27)]
    pub payout_handle: Option<String>,
    #[n(28)]
    pub requested_at: TimeStamp<Utc>,
}

/// Every mutation of a settlement request goes through one of these.
#[derive(Debug, Clone)]
pub enum SettlementCommand {
    Approve {
        adjustment: Option<Adjustment>,
        adjustment_reason: Option<String>,
    },
    Reject {
        reason: String,
    },
    PayStripe {
        available_balance: Money,
        payout_handle: String,
    },
    ConfirmPayout {
        outcome: PayoutOutcome,
    },
    PayManual {
        transaction_reference: String,
        description: Option<String>,
    },
}

impl SettlementCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SettlementCommand::Approve { .. } => "approve",
            SettlementCommand::Reject { .. } => "reject",
            SettlementCommand::PayStripe { .. } => "pay_stripe",
            SettlementCommand::ConfirmPayout { .. } => "confirm_payout",
            SettlementCommand::PayManual { .. } => "pay_manual",
        }
    }
}

impl SettlementRequest {
    /// Create a new PENDING request, deriving the platform fee and the
    /// settlement base amount from the supplied totals.
    pub fn create(input: NewSettlement) -> anyhow::Result<Self> {
        // the money fields must agree with the declared request currency;
        // compute_settlement_amount checks them against each other
        ensure_same_currency(input.currency, input.total_sales.currency())?;

        let (platform_fee, amount) = calculator::compute_settlement_amount(
            input.total_sales,
            input.processing_fees,
            input.total_refunds,
            input.platform_fee_percentage,
            input.fee_paid_by,
            input.parlomo_fee,
        )?;

        Ok(Self {
            id: utils::new_request_id(utils::SETTLEMENT_HRP)?,
            event_id: input.event_id,
            organizer_id: input.organizer_id,
            currency: input.currency,
            total_sales: input.total_sales,
            processing_fees: input.processing_fees,
            total_refunds: input.total_refunds,
            platform_fee,
            platform_fee_percentage: input.platform_fee_percentage,
            parlomo_fee: input.parlomo_fee,
            fee_paid_by: input.fee_paid_by,
            amount,
            admin_adjustment: None,
            adjustment_reason: None,
            final_amount: amount,
            status: SettlementStatus::Pending,
            payment_method: None,
            payment_details: input.payment_details,
            transaction_reference: None,
            payment_description: None,
            rejection_reason: None,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            paid_by: None,
            paid_at: None,
            payout_handle: None,
            requested_at: TimeStamp::new(),
        })
    }

    fn require_status(
        &self,
        wanted: SettlementStatus,
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

    /// Apply a command. Every guard is checked before the first mutation, so
    /// a failed transition leaves the request untouched.
    pub fn apply(
        &mut self,
        command: SettlementCommand,
        actor: &Actor,
        now: TimeStamp<Utc>,
    ) -> Result<AuditAction, EngineError> {
        match command {
            SettlementCommand::Approve {
                adjustment,
                adjustment_reason,
            } => {
                self.require_status(SettlementStatus::Pending, "approve")?;

                let final_amount = match adjustment {
                    Some(adjustment) => {
                        ensure_same_currency(adjustment.currency(), self.currency)?;
                        if adjustment.is_zero() {
                            return Err(EngineError::ValidationFailed {
                                field: "admin_adjustment",
                                message: "an adjustment of zero must be omitted".to_string(),
                            });
                        }
                        let reason_len = adjustment_reason
                            .as_deref()
                            .map(|r| r.trim().chars().count())
                            .unwrap_or(0);
                        if reason_len < 5 {
                            return Err(EngineError::ValidationFailed {
                                field: "adjustment_reason",
                                message: "an adjustment requires a reason of at least 5 characters"
                                    .to_string(),
                            });
                        }
                        calculator::apply_adjustment(self.amount, adjustment)?
                    }
                    None => {
                        if adjustment_reason.is_some() {
                            return Err(EngineError::ValidationFailed {
                                field: "adjustment_reason",
                                message: "a reason was given without an adjustment".to_string(),
                            });
                        }
                        self.amount
                    }
                };

                self.admin_adjustment = adjustment;
                self.adjustment_reason = adjustment_reason;
                self.final_amount = final_amount;
                self.status = SettlementStatus::Approved;
                self.approved_by = Some(actor.id.clone());
                self.approved_at = Some(now);
                Ok(AuditAction::Approved)
            }

            SettlementCommand::Reject { reason } => {
                self.require_status(SettlementStatus::Pending, "reject")?;
                if reason.trim().chars().count() < 10 {
                    return Err(EngineError::ValidationFailed {
                        field: "rejection_reason",
                        message: "a rejection requires a reason of at least 10 characters"
                            .to_string(),
                    });
                }

                self.status = SettlementStatus::Rejected;
                self.rejection_reason = Some(reason);
                self.rejected_by = Some(actor.id.clone());
                self.rejected_at = Some(now);
                Ok(AuditAction::Rejected)
            }

            SettlementCommand::PayStripe {
                available_balance,
                payout_handle,
            } => {
                self.require_status(SettlementStatus::Approved, "pay_stripe")?;
                if self.payout_handle.is_some() {
                    return Err(EngineError::InvalidTransition {
                        from: self.status.as_str(),
                        command: "pay_stripe",
                    });
                }
                ensure_same_currency(available_balance.currency(), self.currency)?;
                if self.final_amount.minor_units() <= 0 {
                    return Err(EngineError::ValidationFailed {
                        field: "final_amount",
                        message: format!("{} is not payable", self.final_amount),
                    });
                }
                if available_balance.minor_units() < self.final_amount.minor_units() {
                    return Err(EngineError::InsufficientBalance {
                        available: available_balance.minor_units(),
                        required: self.final_amount.minor_units(),
                    });
                }

                // stays APPROVED until the provider confirms
                self.payment_method = Some(PaymentMethod::Stripe);
                self.payout_handle = Some(payout_handle);
                Ok(AuditAction::PayoutInitiated)
            }

            SettlementCommand::ConfirmPayout { outcome } => {
                self.require_status(SettlementStatus::Approved, "confirm_payout")?;
                if self.payout_handle.is_none() {
                    return Err(EngineError::ValidationFailed {
                        field: "payout_handle",
                        message: "no payout has been initiated".to_string(),
                    });
                }

                match outcome {
                    PayoutOutcome::Paid => {
                        self.status = SettlementStatus::Paid;
                        self.paid_by = Some(actor.id.clone());
                        self.paid_at = Some(now);
                        Ok(AuditAction::PayoutConfirmed)
                    }
                    PayoutOutcome::Failed { .. } => {
                        // the payout did not move funds; allow a retry
                        self.payout_handle = None;
                        self.payment_method = None;
                        Ok(AuditAction::PayoutFailed)
                    }
                }
            }

            SettlementCommand::PayManual {
                transaction_reference,
                description,
            } => {
                self.require_status(SettlementStatus::Approved, "pay_manual")?;
                if self.payout_handle.is_some() {
                    return Err(EngineError::InvalidTransition {
                        from: self.status.as_str(),
                        command: "pay_manual",
                    });
                }
                if transaction_reference.trim().chars().count() < 3 {
                    return Err(EngineError::ValidationFailed {
                        field: "transaction_reference",
                        message: "a manual payout requires a transaction reference of at least 3 characters"
                            .to_string(),
                    });
                }
                if self.final_amount.minor_units() <= 0 {
                    return Err(EngineError::ValidationFailed {
                        field: "final_amount",
                        message: format!("{} is not payable", self.final_amount),
                    });
                }

                self.payment_method = Some(PaymentMethod::BankTransfer);
                self.transaction_reference = Some(transaction_reference);
                self.payment_description = description;
                self.status = SettlementStatus::Paid;
                self.paid_by = Some(actor.id.clone());
                self.paid_at = Some(now);
                Ok(AuditAction::PaidManual)
            }
        }
    }
}
