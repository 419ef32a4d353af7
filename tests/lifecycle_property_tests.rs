//! Property-based tests for the request state machines.
//!
//! Commands are applied directly through the pure `apply` functions, with no
//! database involved, so proptest can drive long random command sequences
//! cheaply. The invariants under test: rejected commands never mutate the
//! request, terminal statuses accept nothing, and every accepted transition
//! follows the lifecycle table.

use std::collections::BTreeMap;

use proptest::prelude::*;
use settlement_approval::{
    audit::{Actor, ActorRole},
    calculator::FeePaidBy,
    collab::PayoutOutcome,
    draft::RefundDraft,
    money::{Adjustment, Currency, Money},
    refund::{
        FineInput, OrderLine, RefundCommand, RefundRequest, RefundStatus, RefundType, Requester,
    },
    settlement::{NewSettlement, SettlementCommand, SettlementRequest, SettlementStatus},
    utils::TimeStamp,
};

fn admin() -> Actor {
    Actor::new("usr_admin", ActorRole::Admin)
}

fn pending_settlement() -> SettlementRequest {
    SettlementRequest::create(NewSettlement {
        event_id: "evt_1".to_string(),
        organizer_id: "org_1".to_string(),
        currency: Currency::GBP,
        total_sales: Money::new(60_000, Currency::GBP).unwrap(),
        processing_fees: Money::new(4_000, Currency::GBP).unwrap(),
        total_refunds: Money::zero(Currency::GBP),
        platform_fee_percentage: 10,
        parlomo_fee: Money::zero(Currency::GBP),
        fee_paid_by: FeePaidBy::Buyer,
        payment_details: BTreeMap::new(),
    })
    .unwrap()
}

fn pending_refund(amounts: &[i64]) -> RefundRequest {
    let draft = RefundDraft::new().select_type(RefundType::BulkRefund);
    let order_ids: Vec<String> = (0..amounts.len()).map(|i| format!("ord_{i}")).collect();
    let (draft, errors) = draft.select_orders(order_ids.clone());
    assert!(errors.is_empty());
    let (draft, errors) = draft.with_reason("guests reported duplicate charges", None);
    assert!(errors.is_empty());

    let orders = order_ids
        .into_iter()
        .zip(amounts)
        .map(|(order_id, minor)| OrderLine {
            order_id,
            amount: Money::new(*minor, Currency::GBP).unwrap(),
        })
        .collect();

    RefundRequest::create(
        draft,
        Requester::Organizer {
            id: "org_1".to_string(),
        },
        "evt_1".to_string(),
        orders,
    )
    .unwrap()
}

fn settlement_command_strategy() -> impl Strategy<Value = SettlementCommand> {
    prop_oneof![
        Just(SettlementCommand::Approve {
            adjustment: None,
            adjustment_reason: None,
        }),
        (-10_000i64..10_000).prop_map(|minor| SettlementCommand::Approve {
            adjustment: Some(Adjustment::new(minor, Currency::GBP)),
            adjustment_reason: Some("reconciliation correction".to_string()),
        }),
        Just(SettlementCommand::Reject {
            reason: "sales totals do not match the event ledger".to_string(),
        }),
        Just(SettlementCommand::PayStripe {
            available_balance: Money::new(10_000_000, Currency::GBP).unwrap(),
            payout_handle: "po_prop_1".to_string(),
        }),
        Just(SettlementCommand::ConfirmPayout {
            outcome: PayoutOutcome::Paid,
        }),
        Just(SettlementCommand::ConfirmPayout {
            outcome: PayoutOutcome::Failed {
                reason: "destination account closed".to_string(),
            },
        }),
        Just(SettlementCommand::PayManual {
            transaction_reference: "TX-PROP-001".to_string(),
            description: None,
        }),
    ]
}

fn refund_command_strategy() -> impl Strategy<Value = RefundCommand> {
    prop_oneof![
        Just(RefundCommand::Approve { admin_notes: None }),
        Just(RefundCommand::Reject {
            reason: "the orders were already refunded manually".to_string(),
        }),
        (0u32..4, 0u32..4).prop_map(|(processed, failed)| RefundCommand::Process {
            fine: None,
            processed,
            failed,
        }),
        (1u8..100).prop_map(|percentage| RefundCommand::Process {
            fine: Some(FineInput {
                percentage,
                reason: "cancellation policy".to_string(),
            }),
            processed: 1,
            failed: 0,
        }),
    ]
}

/// The edges a settlement is allowed to take, as (from, to) status pairs.
/// PayStripe and a failed confirmation keep the request in APPROVED.
fn settlement_edge_is_legal(from: SettlementStatus, to: SettlementStatus) -> bool {
    matches!(
        (from, to),
        (SettlementStatus::Pending, SettlementStatus::Approved)
            | (SettlementStatus::Pending, SettlementStatus::Rejected)
            | (SettlementStatus::Approved, SettlementStatus::Approved)
            | (SettlementStatus::Approved, SettlementStatus::Paid)
    )
}

fn refund_edge_is_legal(from: RefundStatus, to: RefundStatus) -> bool {
    matches!(
        (from, to),
        (RefundStatus::Pending, RefundStatus::Approved)
            | (RefundStatus::Pending, RefundStatus::Rejected)
            | (RefundStatus::Approved, RefundStatus::Processed)
    )
}

proptest! {
    /// Any random command sequence only ever walks legal settlement edges,
    /// and a refused command leaves the request byte-for-byte unchanged.
    #[test]
    fn settlement_sequences_only_take_legal_edges(
        commands in prop::collection::vec(settlement_command_strategy(), 1..12),
    ) {
        let mut request = pending_settlement();

        for command in commands {
            let before = request.clone();
            match request.apply(command, &admin(), TimeStamp::new()) {
                Ok(_) => {
                    prop_assert!(settlement_edge_is_legal(before.status, request.status));
                    prop_assert!(!before.status.is_terminal());
                }
                Err(_) => prop_assert_eq!(&request, &before),
            }
        }
    }

    /// Once a settlement reaches a terminal status it stays there: no
    /// command in the vocabulary is accepted any more.
    #[test]
    fn terminal_settlements_refuse_every_command(
        commands in prop::collection::vec(settlement_command_strategy(), 1..8),
    ) {
        let mut request = pending_settlement();
        request
            .apply(
                SettlementCommand::Reject {
                    reason: "sales totals do not match the event ledger".to_string(),
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        let terminal = request.clone();
        for command in commands {
            prop_assert!(request.apply(command, &admin(), TimeStamp::new()).is_err());
            prop_assert_eq!(&request, &terminal);
        }
    }

    /// A second approval of the same request is always refused, whatever
    /// adjustment it carries.
    #[test]
    fn approvals_are_not_repeatable(adjustment in -10_000i64..10_000) {
        let mut request = pending_settlement();
        request
            .apply(
                SettlementCommand::Approve {
                    adjustment: None,
                    adjustment_reason: None,
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap();

        let approved = request.clone();
        let err = request
            .apply(
                SettlementCommand::Approve {
                    adjustment: Some(Adjustment::new(adjustment, Currency::GBP)),
                    adjustment_reason: Some("reconciliation correction".to_string()),
                },
                &admin(),
                TimeStamp::new(),
            )
            .unwrap_err();

        prop_assert!(
            matches!(
                err,
                settlement_approval::error::EngineError::InvalidTransition { .. }
            ),
            "expected InvalidTransition, got {:?}",
            err
        );
        prop_assert_eq!(&request, &approved);
    }

    /// Refund sequences walk legal edges only, and the money invariant
    /// holds at every accepted step: fine + net == total.
    #[test]
    fn refund_sequences_only_take_legal_edges(
        amounts in prop::collection::vec(100i64..100_000, 1..5),
        commands in prop::collection::vec(refund_command_strategy(), 1..12),
    ) {
        let mut request = pending_refund(&amounts);
        let total = request.total_refund_amount;

        for command in commands {
            let before = request.clone();
            match request.apply(command, &admin(), TimeStamp::new()) {
                Ok(_) => {
                    prop_assert!(refund_edge_is_legal(before.status, request.status));
                    let net = request.net_refund_amount().unwrap();
                    prop_assert_eq!(
                        request.fine_amount().minor_units() + net.minor_units(),
                        total.minor_units()
                    );
                }
                Err(_) => prop_assert_eq!(&request, &before),
            }
        }
    }
}
