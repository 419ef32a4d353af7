//! Service layer API for the settlement and refund workflows.
//!
//! Requests and the audit trail live in sled trees, one per logical table.
//! A transition loads the stored record, applies the command, and writes the
//! result back with `compare_and_swap` against the bytes it read. Losing
//! that race is a `StaleState`, so two admins acting on the same request can
//! never silently overwrite each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audit::{
    Actor, AuditAction, AuditLogEntry, AuditTrail, NotificationEvent, NotificationSink,
    RequestKind,
};
use crate::collab::{CollabError, OrderCatalog, OrderRefunder, PayoutProvider, RefundOutcome};
use crate::draft::RefundDraft;
use crate::error::EngineError;
use crate::money::{Adjustment, Money, round_half_up};
use crate::refund::{
    FineInput, OrderLine, RefundCommand, RefundRequest, RefundStatus, RefundType, Requester,
};
use crate::settlement::{NewSettlement, SettlementCommand, SettlementRequest, SettlementStatus};
use crate::utils::TimeStamp;

/// Zero-based page selector for the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 0,
            size: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: Page,
}

#[derive(Debug, Clone, Default)]
pub struct SettlementFilter {
    pub status: Option<SettlementStatus>,
    pub event_id: Option<String>,
    pub organizer_id: Option<String>,
    pub page: Page,
}

#[derive(Debug, Clone, Default)]
pub struct RefundFilter {
    pub status: Option<RefundStatus>,
    pub event_id: Option<String>,
    pub page: Page,
}

pub struct FinanceService {
    settlements: sled::Tree,
    refunds: sled::Tree,
    /// One claim per refund id, taken before its per-order instructions are
    /// dispatched. A refund that lost the claim never reaches the refunder.
    dispatches: sled::Tree,
    audit: AuditTrail,
    notifier: Option<Box<dyn NotificationSink + Send + Sync>>,
}

impl FinanceService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Ok(Self {
            settlements: instance.open_tree("settlement_requests")?,
            refunds: instance.open_tree("refund_requests")?,
            dispatches: instance.open_tree("refund_dispatches")?,
            audit: AuditTrail::open(&instance)?,
            notifier: None,
        })
    }

    /// Attach the external notifier. Without one, transitions are still
    /// audited but no notification events leave the engine.
    pub fn with_notifier(mut self, notifier: Box<dyn NotificationSink + Send + Sync>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn record<T>(
        &self,
        kind: RequestKind,
        request_id: &str,
        action: AuditAction,
        actor: &Actor,
        before_status: &str,
        after_status: &str,
        recipient: &str,
        payload: &T,
    ) -> anyhow::Result<()>
    where
        T: minicbor::Encode<()>,
    {
        let entry = AuditLogEntry::record(
            request_id,
            kind,
            action,
            actor,
            before_status,
            after_status,
            payload,
        )?;
        self.audit.append(&entry)?;

        if let Some(notifier) = &self.notifier {
            notifier.notify(NotificationEvent {
                request_id: request_id.to_string(),
                new_status: after_status.to_string(),
                recipient: recipient.to_string(),
            });
        }

        tracing::info!(
            request_id,
            kind = kind.as_str(),
            action = action.as_str(),
            after_status,
            "recorded transition"
        );
        Ok(())
    }

    // ---- settlements ----

    fn load_settlement(&self, id: &str) -> anyhow::Result<(sled::IVec, SettlementRequest)> {
        let bytes = self
            .settlements
            .get(id.as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("settlement request not found: {id}"))?;
        let request = minicbor::decode(&bytes)?;
        Ok((bytes, request))
    }

    /// Submit a new settlement request for approval.
    pub fn create_settlement_request(
        &self,
        input: NewSettlement,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        let request = SettlementRequest::create(input)?;

        self.settlements
            .insert(request.id.as_bytes(), minicbor::to_vec(&request)?)?;
        self.record(
            RequestKind::Settlement,
            &request.id,
            AuditAction::Created,
            actor,
            "NONE",
            request.status.as_str(),
            &request.organizer_id,
            &request,
        )?;

        Ok(request)
    }

    /// Run one settlement command against the stored request.
    ///
    /// `expected_amount` is the `final_amount` the caller last observed, for
    /// money-affecting commands; a mismatch (or losing the write race) is a
    /// `StaleState` and the caller should refetch before retrying.
    fn transition_settlement(
        &self,
        id: &str,
        expected_amount: Option<Adjustment>,
        command: SettlementCommand,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        let (stored_bytes, stored) = self.load_settlement(id)?;

        if let Some(expected) = expected_amount
            && expected != stored.final_amount
        {
            return Err(EngineError::StaleState {
                expected: expected.to_string(),
                actual: stored.final_amount.to_string(),
            }
            .into());
        }

        let before_status = stored.status;
        let mut updated = stored.clone();
        let action = updated.apply(command, actor, TimeStamp::new())?;

        self.settlements
            .compare_and_swap(
                id.as_bytes(),
                Some(stored_bytes),
                Some(minicbor::to_vec(&updated)?),
            )?
            .map_err(|_| EngineError::StaleState {
                expected: before_status.to_string(),
                actual: "a concurrent update".to_string(),
            })?;

        self.record(
            RequestKind::Settlement,
            id,
            action,
            actor,
            before_status.as_str(),
            updated.status.as_str(),
            &updated.organizer_id,
            &updated,
        )?;

        Ok(updated)
    }

    /// Approve a PENDING settlement, optionally applying an admin adjustment.
    pub fn approve_settlement(
        &self,
        id: &str,
        expected_amount: Adjustment,
        adjustment: Option<Adjustment>,
        adjustment_reason: Option<String>,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        self.transition_settlement(
            id,
            Some(expected_amount),
            SettlementCommand::Approve {
                adjustment,
                adjustment_reason,
            },
            actor,
        )
    }

    pub fn reject_settlement(
        &self,
        id: &str,
        reason: String,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        self.transition_settlement(id, None, SettlementCommand::Reject { reason }, actor)
    }

    /// Initiate a Stripe payout for an APPROVED settlement. The request stays
    /// APPROVED until [`confirm_settlement_payout`] reports the provider's
    /// outcome.
    ///
    /// [`confirm_settlement_payout`]: FinanceService::confirm_settlement_payout
    pub fn pay_settlement_stripe(
        &self,
        id: &str,
        expected_amount: Adjustment,
        provider: &dyn PayoutProvider,
        destination: &str,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        let (_, stored) = self.load_settlement(id)?;

        // pre-flight the transition guards before money moves at the provider
        if stored.status != SettlementStatus::Approved || stored.payout_handle.is_some() {
            return Err(EngineError::InvalidTransition {
                from: stored.status.as_str(),
                command: "pay_stripe",
            }
            .into());
        }
        if stored.final_amount.minor_units() <= 0 {
            return Err(EngineError::ValidationFailed {
                field: "final_amount",
                message: format!("{} is not payable", stored.final_amount),
            }
            .into());
        }

        let available_balance = provider
            .available_balance(stored.currency)
            .map_err(collaborator_unavailable)?;
        if available_balance.minor_units() < stored.final_amount.minor_units() {
            return Err(EngineError::InsufficientBalance {
                available: available_balance.minor_units(),
                required: stored.final_amount.minor_units(),
            }
            .into());
        }

        let payable = Money::new(stored.final_amount.minor_units(), stored.currency)?;
        let handle = provider
            .initiate_payout(payable, destination)
            .map_err(collaborator_unavailable)?;

        self.transition_settlement(
            id,
            Some(expected_amount),
            SettlementCommand::PayStripe {
                available_balance,
                payout_handle: handle.0,
            },
            actor,
        )
    }

    /// Ask the provider for the outcome of an initiated payout and record it.
    /// `Paid` moves the settlement to PAID; `Failed` clears the pending
    /// payout so it can be retried.
    pub fn confirm_settlement_payout(
        &self,
        id: &str,
        provider: &dyn PayoutProvider,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        let (_, stored) = self.load_settlement(id)?;
        let handle = stored
            .payout_handle
            .clone()
            .ok_or(EngineError::ValidationFailed {
                field: "payout_handle",
                message: "no payout has been initiated".to_string(),
            })?;

        let outcome = provider
            .confirm_payout(&crate::collab::PayoutHandle(handle))
            .map_err(collaborator_unavailable)?;

        self.transition_settlement(
            id,
            None,
            SettlementCommand::ConfirmPayout { outcome },
            actor,
        )
    }

    /// Record a payout that happened outside the payout provider, e.g. a
    /// bank transfer run by the finance team.
    pub fn pay_settlement_manual(
        &self,
        id: &str,
        transaction_reference: String,
        description: Option<String>,
        actor: &Actor,
    ) -> anyhow::Result<SettlementRequest> {
        self.transition_settlement(
            id,
            None,
            SettlementCommand::PayManual {
                transaction_reference,
                description,
            },
            actor,
        )
    }

    // ---- refunds ----

    fn load_refund(&self, id: &str) -> anyhow::Result<(sled::IVec, RefundRequest)> {
        let bytes = self
            .refunds
            .get(id.as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("refund request not found: {id}"))?;
        let request = minicbor::decode(&bytes)?;
        Ok((bytes, request))
    }

    /// Turn an accumulated wizard draft into a PENDING refund request. Order
    /// totals are snapshotted from the catalog here and trusted from then on.
    pub fn create_refund_request(
        &self,
        draft: RefundDraft,
        requester: Requester,
        event_id: &str,
        catalog: &dyn OrderCatalog,
        actor: &Actor,
    ) -> anyhow::Result<RefundRequest> {
        let snapshots = match draft.refund_type {
            Some(RefundType::EventCancellation) => catalog.paid_orders(event_id),
            _ => catalog.orders(event_id, &draft.order_ids),
        }
        .map_err(collaborator_unavailable)?;

        if let Some(unpaid) = snapshots.iter().find(|order| !order.paid) {
            return Err(EngineError::ValidationFailed {
                field: "order_ids",
                message: format!("order {} is not paid", unpaid.order_id),
            }
            .into());
        }

        let orders: Vec<OrderLine> = snapshots
            .into_iter()
            .map(|order| OrderLine {
                order_id: order.order_id,
                amount: order.total,
            })
            .collect();

        let request = RefundRequest::create(draft, requester, event_id.to_string(), orders)?;

        self.refunds
            .insert(request.id.as_bytes(), minicbor::to_vec(&request)?)?;
        self.record(
            RequestKind::Refund,
            &request.id,
            AuditAction::Created,
            actor,
            "NONE",
            request.status.as_str(),
            request.requester.recipient(),
            &request,
        )?;

        Ok(request)
    }

    fn transition_refund(
        &self,
        id: &str,
        command: RefundCommand,
        actor: &Actor,
    ) -> anyhow::Result<RefundRequest> {
        let (stored_bytes, stored) = self.load_refund(id)?;

        let before_status = stored.status;
        let mut updated = stored.clone();
        let action = updated.apply(command, actor, TimeStamp::new())?;

        self.refunds
            .compare_and_swap(
                id.as_bytes(),
                Some(stored_bytes),
                Some(minicbor::to_vec(&updated)?),
            )?
            .map_err(|_| EngineError::StaleState {
                expected: before_status.to_string(),
                actual: "a concurrent update".to_string(),
            })?;

        self.record(
            RequestKind::Refund,
            id,
            action,
            actor,
            before_status.as_str(),
            updated.status.as_str(),
            updated.requester.recipient(),
            &updated,
        )?;

        Ok(updated)
    }

    pub fn approve_refund(
        &self,
        id: &str,
        admin_notes: Option<String>,
        actor: &Actor,
    ) -> anyhow::Result<RefundRequest> {
        self.transition_refund(id, RefundCommand::Approve { admin_notes }, actor)
    }

    pub fn reject_refund(
        &self,
        id: &str,
        reason: String,
        actor: &Actor,
    ) -> anyhow::Result<RefundRequest> {
        self.transition_refund(id, RefundCommand::Reject { reason }, actor)
    }

    /// Process an APPROVED refund: fan out one refund instruction per
    /// snapshot order, wait for every outcome, then record PROCESSED with
    /// the observed counts. Failed per-order refunds are counted, never
    /// retried. They are flagged for manual follow-up.
    ///
    /// `expected_net` is the net refund amount the caller last observed
    /// (before any fine supplied here); a mismatch is a `StaleState`.
    pub fn process_refund(
        &self,
        id: &str,
        expected_net: Money,
        fine: Option<FineInput>,
        refunder: &dyn OrderRefunder,
        actor: &Actor,
    ) -> anyhow::Result<RefundRequest> {
        let (_, stored) = self.load_refund(id)?;

        if stored.status != RefundStatus::Approved {
            return Err(EngineError::InvalidTransition {
                from: stored.status.as_str(),
                command: "process",
            }
            .into());
        }
        let current_net = stored.net_refund_amount()?;
        if expected_net != current_net {
            return Err(EngineError::StaleState {
                expected: expected_net.to_string(),
                actual: current_net.to_string(),
            }
            .into());
        }

        // validate a late fine before anything is dispatched
        let effective_fine = match &fine {
            Some(input) => Some(crate::refund::validate_fine(
                stored.total_refund_amount,
                input,
            )?),
            None => stored.fine.clone(),
        };
        let fine_percentage = effective_fine.as_ref().map(|f| f.percentage).unwrap_or(0);

        // claim the dispatch before any money moves: of two concurrent
        // process calls exactly one holds the claim, the other fails here
        // and never reaches the refunder
        self.dispatches
            .compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(vec![1u8]))?
            .map_err(|_| EngineError::StaleState {
                expected: RefundStatus::Approved.as_str().to_string(),
                actual: "a concurrent process".to_string(),
            })?;

        let mut processed = 0u32;
        let mut failed = 0u32;
        for order in &stored.orders {
            let net = per_order_net(order.amount, fine_percentage)?;
            match refunder.refund_order(&order.order_id, net) {
                RefundOutcome::Success => processed += 1,
                RefundOutcome::Failure { reason } => {
                    tracing::warn!(
                        request_id = id,
                        order_id = order.order_id.as_str(),
                        reason,
                        "per-order refund failed"
                    );
                    failed += 1;
                }
            }
        }

        // instructions were dispatched: the terminal status is recorded
        // unconditionally with whatever counts were observed. The claim
        // above makes this write exclusive, so a plain insert is enough.
        let before_status = stored.status;
        let mut updated = stored;
        let action = updated.apply(
            RefundCommand::Process {
                fine,
                processed,
                failed,
            },
            actor,
            TimeStamp::new(),
        )?;
        self.refunds
            .insert(id.as_bytes(), minicbor::to_vec(&updated)?)?;

        self.record(
            RequestKind::Refund,
            id,
            action,
            actor,
            before_status.as_str(),
            updated.status.as_str(),
            updated.requester.recipient(),
            &updated,
        )?;

        Ok(updated)
    }

    // ---- query surface ----

    pub fn get_settlement(&self, id: &str) -> anyhow::Result<Option<SettlementRequest>> {
        match self.settlements.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_refund(&self, id: &str) -> anyhow::Result<Option<RefundRequest>> {
        match self.refunds.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_settlement_requests(
        &self,
        filter: &SettlementFilter,
    ) -> anyhow::Result<Paged<SettlementRequest>> {
        let mut matches = Vec::new();
        for item in self.settlements.iter() {
            let (_, bytes) = item?;
            let request: SettlementRequest = minicbor::decode(&bytes)?;
            if let Some(status) = filter.status
                && request.status != status
            {
                continue;
            }
            if let Some(event_id) = &filter.event_id
                && &request.event_id != event_id
            {
                continue;
            }
            if let Some(organizer_id) = &filter.organizer_id
                && &request.organizer_id != organizer_id
            {
                continue;
            }
            matches.push(request);
        }
        Ok(paginate(matches, filter.page, |request| {
            request.requested_at.clone()
        }))
    }

    pub fn list_refund_requests(
        &self,
        filter: &RefundFilter,
    ) -> anyhow::Result<Paged<RefundRequest>> {
        let mut matches = Vec::new();
        for item in self.refunds.iter() {
            let (_, bytes) = item?;
            let request: RefundRequest = minicbor::decode(&bytes)?;
            if let Some(status) = filter.status
                && request.status != status
            {
                continue;
            }
            if let Some(event_id) = &filter.event_id
                && &request.event_id != event_id
            {
                continue;
            }
            matches.push(request);
        }
        Ok(paginate(matches, filter.page, |request| {
            request.requested_at.clone()
        }))
    }

    pub fn get_audit_log(&self, request_id: &str) -> anyhow::Result<Vec<AuditLogEntry>> {
        self.audit.list(request_id)
    }

    /// Status counts as a query-time aggregation; nothing is cached.
    pub fn settlement_status_counts(&self) -> anyhow::Result<BTreeMap<&'static str, u64>> {
        let mut counts = BTreeMap::new();
        for item in self.settlements.iter() {
            let (_, bytes) = item?;
            let request: SettlementRequest = minicbor::decode(&bytes)?;
            *counts.entry(request.status.as_str()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn refund_status_counts(&self) -> anyhow::Result<BTreeMap<&'static str, u64>> {
        let mut counts = BTreeMap::new();
        for item in self.refunds.iter() {
            let (_, bytes) = item?;
            let request: RefundRequest = minicbor::decode(&bytes)?;
            *counts.entry(request.status.as_str()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn collaborator_unavailable(err: CollabError) -> EngineError {
    tracing::warn!(error = %err, "collaborator call failed");
    EngineError::CollaboratorUnavailable(err.to_string())
}

/// An order's share of the refund: its snapshot total minus its share of the
/// fine, rounded half-up per order.
fn per_order_net(amount: Money, fine_percentage: u8) -> Result<Money, EngineError> {
    let fine = round_half_up(
        amount.minor_units() as i128 * fine_percentage as i128,
        100,
    );
    Money::new((amount.minor_units() - fine).max(0), amount.currency())
}

fn paginate<T, K, F>(mut matches: Vec<T>, page: Page, sort_key: F) -> Paged<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    // newest first
    matches.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    let total = matches.len();
    let size = page.size.max(1);
    let items = matches
        .into_iter()
        .skip(page.number * size)
        .take(size)
        .collect();
    Paged { items, total, page }
}
