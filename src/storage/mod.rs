//! Storage interfaces and implementations.
//!
//! Services depend on the traits here; the SQLite backend is the durable
//! implementation and the in-memory backend serves tests and standalone
//! runs. Both enforce the same write-side invariants: the width cap is
//! re-checked inside the insert transaction, funding verification is a
//! conditional status swap, and transfers settle all-or-nothing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{PlanConfig, StorageConfig};
use crate::model::{
    BalanceSummary, EntryStatus, EntryType, FundingEvent, LedgerEntry, LineageSnapshot, Member,
    NewMember, OtpState, Tombstone,
};

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryLedgerStore, MemoryMemberStore, MemoryOtpStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteLedgerStore, SqliteMemberStore, SqliteOtpStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("width cap reached under parent {parent}")]
    CapExceeded { parent: Uuid },

    #[error("status conflict: {message}")]
    StatusConflict { message: String },

    #[error("insufficient funds for {owner}")]
    InsufficientFunds { owner: Uuid },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// How a ledger write moves the owner's balance summary. Applied atomically
/// with the entry itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceEffect {
    pub available: i64,
    pub lifetime: i64,
}

impl BalanceEffect {
    pub const NONE: BalanceEffect = BalanceEffect {
        available: 0,
        lifetime: 0,
    };

    pub fn available(delta: i64) -> Self {
        Self {
            available: delta,
            lifetime: 0,
        }
    }

    pub fn earning(amount: i64) -> Self {
        Self {
            available: amount,
            lifetime: amount,
        }
    }
}

/// The two-party posting a transfer (or archival fund sweep) settles in a
/// single transaction.
#[derive(Debug, Clone)]
pub struct TransferPosting {
    /// Shared transaction id written into both rows' metadata.
    pub tx_id: Uuid,
    pub sender: Uuid,
    pub recipient: Uuid,
    /// Positive amount moved from sender to recipient.
    pub amount_minor: i64,
    pub actor: String,
    pub out_type: EntryType,
    pub in_type: EntryType,
    /// Transfers credit the recipient's lifetime earnings; archival sweeps
    /// do not.
    pub credit_lifetime: bool,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Filter for ledger listings.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub entry_type: Option<EntryType>,
    pub status: Option<EntryStatus>,
}

/// Canonical member directory operations.
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Create tables (where applicable) and seed the reserved root member.
    async fn init(&self) -> Result<()>;

    /// Insert a member. When `parent_id` is a non-root member, the direct
    /// child count is re-checked inside the same write transaction and the
    /// insert fails with `CapExceeded` before any mutation.
    async fn insert(&self, member: NewMember) -> Result<Member>;

    async fn get(&self, id: Uuid) -> Result<Member>;
    async fn find_by_referral(&self, code: &str) -> Result<Option<Member>>;
    async fn find_by_member_no(&self, member_no: &str) -> Result<Option<Member>>;
    async fn get_root(&self) -> Result<Member>;

    async fn count_children(&self, id: Uuid) -> Result<u32>;
    async fn list_children(&self, id: Uuid) -> Result<Vec<Member>>;

    /// Attach a queued member to a parent, cap-checked, clearing the
    /// placement deadline. Fails if the member is already placed.
    async fn assign_parent(&self, member: Uuid, parent: Uuid, split: bool) -> Result<Member>;

    /// Push a queued member's placement deadline out.
    async fn set_placement_deadline(&self, member: Uuid, deadline: DateTime<Utc>) -> Result<()>;

    /// Grow the package by a verified deposit and flip activation.
    async fn record_funding(&self, member: Uuid, delta_minor: i64) -> Result<Member>;

    async fn set_kyc(&self, member: Uuid, verified: bool) -> Result<()>;

    /// Soft-delete with a tombstone. The caller has already swept funds and
    /// verified the member is childless.
    async fn archive(&self, member: Uuid, tombstone: Tombstone) -> Result<()>;

    /// Atomic increment-and-read of the member-number sequence.
    async fn next_member_no(&self) -> Result<u64>;

    /// Funded, unarchived members — the ROI batch population.
    async fn list_funded(&self) -> Result<Vec<Member>>;
}

/// Append-only ledger, balance summaries, and funding events.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Append an entry and apply its balance effect atomically, creating
    /// the summary row on first touch.
    async fn append(&self, entry: &LedgerEntry, effect: BalanceEffect) -> Result<()>;

    /// Bounded status transition guarded by the expected current status;
    /// `StatusConflict` on mismatch. The effect settles alongside.
    async fn update_status(
        &self,
        id: Uuid,
        expected: EntryStatus,
        next: EntryStatus,
        effect: BalanceEffect,
    ) -> Result<LedgerEntry>;

    async fn get_entry(&self, id: Uuid) -> Result<LedgerEntry>;
    async fn list_for_owner(&self, owner: Uuid, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>>;

    async fn balance(&self, owner: Uuid) -> Result<Option<BalanceSummary>>;
    async fn ensure_balance(&self, owner: Uuid) -> Result<BalanceSummary>;

    /// Debit sender, credit recipient, and write both rows in one
    /// transaction. `InsufficientFunds` when the sender cannot cover it.
    async fn apply_transfer(
        &self,
        posting: &TransferPosting,
    ) -> Result<(LedgerEntry, LedgerEntry)>;

    async fn insert_funding(&self, event: &FundingEvent) -> Result<()>;
    async fn get_funding(&self, id: Uuid) -> Result<FundingEvent>;
    async fn find_funding_by_order(&self, order_no: &str) -> Result<Option<FundingEvent>>;

    /// Conditional PENDING -> VERIFIED swap recording the lineage snapshot.
    /// `StatusConflict` when the event is no longer pending — the
    /// double-verification guard.
    async fn mark_funding_verified(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        lineage: LineageSnapshot,
    ) -> Result<FundingEvent>;

    /// Conditional PENDING -> terminal failure status.
    async fn mark_funding_failed(
        &self,
        id: Uuid,
        status: crate::model::FundingStatus,
    ) -> Result<FundingEvent>;

    async fn count_verified_funding(&self, owner: Uuid) -> Result<u32>;
}

/// One-time-password state per member.
#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn get(&self, owner: Uuid) -> Result<Option<OtpState>>;
    async fn put(&self, state: &OtpState) -> Result<()>;
    async fn clear_code(&self, owner: Uuid) -> Result<()>;
}

/// Storage handles the services are built from.
#[derive(Clone)]
pub struct Stores {
    pub members: Arc<dyn MemberStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub otp: Arc<dyn OtpStore>,
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig, plan: &PlanConfig) -> Result<Stores> {
    info!("Storage: {} at {}", config.storage_type, config.path);

    match config.storage_type.as_str() {
        "memory" => {
            let members = Arc::new(MemoryMemberStore::new(plan.width_cap));
            let ledger = Arc::new(MemoryLedgerStore::new());
            let otp = Arc::new(MemoryOtpStore::new());
            members.init().await?;
            Ok(Stores {
                members,
                ledger,
                otp,
            })
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let members = Arc::new(SqliteMemberStore::new(pool.clone(), plan.width_cap));
            members.init().await?;
            let ledger = Arc::new(SqliteLedgerStore::new(pool.clone()));
            ledger.init().await?;
            let otp = Arc::new(SqliteOtpStore::new(pool));
            otp.init().await?;

            Ok(Stores {
                members,
                ledger,
                otp,
            })
        }
        other => Err(StorageError::Backend(format!(
            "unknown storage type: {other}"
        ))),
    }
}
