//! Append-only audit trail. Every transition appends exactly one entry;
//! the trail is the source of truth for who did what and when, and the
//! status field on a request is a denormalized cache of the latest entry.

use crate::utils::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    #[n(0)]
    Settlement,
    #[n(1)]
    Refund,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Settlement => "settlement",
            RequestKind::Refund => "refund",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    #[n(0)]
    Organizer,
    #[n(1)]
    Admin,
    #[n(2)]
    Guest,
    #[n(3)]
    System,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    #[n(0)]
    Created,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    PayoutInitiated,
    #[n(4)]
    PayoutConfirmed,
    #[n(5)]
    PayoutFailed,
    #[n(6)]
    PaidManual,
    #[n(7)]
    Processed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::PayoutInitiated => "payout_initiated",
            AuditAction::PayoutConfirmed => "payout_confirmed",
            AuditAction::PayoutFailed => "payout_failed",
            AuditAction::PaidManual => "paid_manual",
            AuditAction::Processed => "processed",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AuditLogEntry {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub request_kind: RequestKind,
    #[n(2)]
    pub action: AuditAction,
    #[n(3)]
    pub actor: Actor,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
    #[n(5)]
    pub before_status: String,
    #[n(6)]
    pub after_status: String,
    #[n(7)]
    #[cbor(with = "minicbor::bytes")]
    pub payload_snapshot: Vec<u8>,
    #[n(8)]
    pub snapshot_hash: String,
}

impl AuditLogEntry {
    /// Build an entry with a CBOR snapshot of the request as it stood after
    /// the transition, content-addressed with a sha256 digest.
    pub fn record<T>(
        request_id: &str,
        request_kind: RequestKind,
        action: AuditAction,
        actor: &Actor,
        before_status: &str,
        after_status: &str,
        payload: &T,
    ) -> anyhow::Result<Self>
    where
        T: minicbor::Encode<()>,
    {
        let payload_snapshot = minicbor::to_vec(payload)?;
        let snapshot_hash = sha256::digest(&payload_snapshot);

        Ok(Self {
            request_id: request_id.to_string(),
            request_kind,
            action,
            actor: actor.clone(),
            timestamp: TimeStamp::new(),
            before_status: before_status.to_string(),
            after_status: after_status.to_string(),
            payload_snapshot,
            snapshot_hash,
        })
    }
}

/// One notification per transition, handed to the external notifier. The
/// engine never delivers anything itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub request_id: String,
    pub new_status: String,
    pub recipient: String,
}

pub trait NotificationSink {
    fn notify(&self, event: NotificationEvent);
}

/// Sled-backed trail, keyed by `(request_id, sequence_no)` so that
/// `scan_prefix` yields a request's timeline in order.
pub struct AuditTrail {
    tree: sled::Tree,
}

impl AuditTrail {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree("audit_log")?,
        })
    }

    fn key(request_id: &str, sequence_no: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(request_id.len() + 9);
        key.extend_from_slice(request_id.as_bytes());
        key.push(b'/');
        key.extend_from_slice(&sequence_no.to_be_bytes());
        key
    }

    fn prefix(request_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(request_id.len() + 1);
        prefix.extend_from_slice(request_id.as_bytes());
        prefix.push(b'/');
        prefix
    }

    fn next_sequence(&self, request_id: &str) -> anyhow::Result<u64> {
        let last = self.tree.scan_prefix(Self::prefix(request_id)).last();
        match last {
            Some(entry) => {
                let (key, _) = entry?;
                let tail: [u8; 8] = key[key.len() - 8..]
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("malformed audit key for {request_id}"))?;
                Ok(u64::from_be_bytes(tail) + 1)
            }
            None => Ok(0),
        }
    }

    /// The only write operation. Assigns the next free sequence number for
    /// the entry's request and returns it. Each slot is taken with a
    /// compare_and_swap against an empty key, so two concurrent appends can
    /// race for the same number but never overwrite each other; the loser
    /// moves on to the next slot.
    pub fn append(&self, entry: &AuditLogEntry) -> anyhow::Result<u64> {
        let bytes = minicbor::to_vec(entry)?;
        let mut sequence_no = self.next_sequence(&entry.request_id)?;
        loop {
            let claimed = self.tree.compare_and_swap(
                Self::key(&entry.request_id, sequence_no),
                None::<&[u8]>,
                Some(bytes.clone()),
            )?;
            if claimed.is_ok() {
                return Ok(sequence_no);
            }
            sequence_no += 1;
        }
    }

    /// A request's timeline, ascending by sequence number.
    pub fn list(&self, request_id: &str) -> anyhow::Result<Vec<AuditLogEntry>> {
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(Self::prefix(request_id)) {
            let (_, value) = item?;
            entries.push(minicbor::decode(&value)?);
        }
        Ok(entries)
    }

    pub fn latest(&self, request_id: &str) -> anyhow::Result<Option<AuditLogEntry>> {
        match self.tree.scan_prefix(Self::prefix(request_id)).last() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(minicbor::decode(&value)?))
            }
            None => Ok(None),
        }
    }
}
