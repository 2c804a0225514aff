//! Domain types for the referral network.
//!
//! These are plain data carriers shared by the placement, commission, ledger,
//! and activation modules. Persisted enum names are part of the storage
//! contract and must remain stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Member number of the reserved network root.
pub const ROOT_MEMBER_NO: &str = "M-0";

/// A network participant: identity plus tree position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    /// Human-readable sequential id (`M-<n>`), issued atomically.
    pub member_no: String,
    /// Public code others use to name this member as their sponsor.
    pub referral_code: String,
    /// Original sponsor, fixed at signup. `None` only for the root.
    pub sponsor_id: Option<Uuid>,
    /// Tree parent. `None` while the member waits in the placement queue.
    pub parent_id: Option<Uuid>,
    /// True when the parent differs from the original sponsor.
    pub is_split_sponsor: bool,
    /// Accumulated package value in minor currency units. Monotonic.
    pub package_minor: i64,
    /// Flips true on first verified deposit.
    pub active: bool,
    pub kyc_verified: bool,
    pub joined_at: DateTime<Utc>,
    /// Set only while queued for deferred placement.
    pub placement_deadline: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl Member {
    /// The root is the only member without a sponsor.
    pub fn is_root(&self) -> bool {
        self.sponsor_id.is_none() && self.member_no == ROOT_MEMBER_NO
    }

    /// A member's tree position freezes once it has a child or a verified
    /// deposit. Children are checked separately by the store.
    pub fn placement_mutable(&self) -> bool {
        !self.active
    }
}

/// Fields needed to insert a member. The store assigns nothing; ids and
/// numbers are issued by the caller so the insert stays a single write.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub id: Uuid,
    pub member_no: String,
    pub referral_code: String,
    pub sponsor_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub is_split_sponsor: bool,
    pub joined_at: DateTime<Utc>,
    pub placement_deadline: Option<DateTime<Utc>>,
}

/// Outcome of a placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub original_sponsor: Uuid,
    pub parent: Uuid,
    pub is_split_sponsor: bool,
}

/// Status of a funding event (offline or gateway deposit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundingStatus {
    Pending,
    Verified,
    Rejected,
    Failed,
    Expired,
}

impl FundingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingStatus::Pending => "PENDING",
            FundingStatus::Verified => "VERIFIED",
            FundingStatus::Rejected => "REJECTED",
            FundingStatus::Failed => "FAILED",
            FundingStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(FundingStatus::Pending),
            "VERIFIED" => Some(FundingStatus::Verified),
            "REJECTED" => Some(FundingStatus::Rejected),
            "FAILED" => Some(FundingStatus::Failed),
            "EXPIRED" => Some(FundingStatus::Expired),
            _ => None,
        }
    }
}

/// Lineage captured at verification time, kept for audit even if the tree
/// later changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageSnapshot {
    pub sponsor_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    /// The exact ancestor chain used for the cascading bonus, nearest first.
    pub upline: Vec<Uuid>,
}

/// A deposit awaiting or past verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub id: Uuid,
    /// External order reference used by the payment gateway webhook.
    pub order_no: String,
    pub owner_id: Uuid,
    pub source_amount_minor: i64,
    pub source_currency: String,
    /// Amount in the settlement currency, converted at record time.
    pub settled_minor: i64,
    pub status: FundingStatus,
    /// Ledger row recording the deposit in transit.
    pub ledger_entry_id: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub lineage: Option<LineageSnapshot>,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry type. Persisted names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    OfflineDeposit,
    PackageActivation,
    Roi,
    Direct,
    Unilevel,
    Salary,
    WithdrawalRequest,
    Adjustment,
    TransferIn,
    TransferOut,
    FundTransferOnDelete,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::OfflineDeposit => "OFFLINE_DEPOSIT",
            EntryType::PackageActivation => "PACKAGE_ACTIVATION",
            EntryType::Roi => "ROI",
            EntryType::Direct => "DIRECT",
            EntryType::Unilevel => "UNILEVEL",
            EntryType::Salary => "SALARY",
            EntryType::WithdrawalRequest => "WITHDRAWAL_REQUEST",
            EntryType::Adjustment => "ADJUSTMENT",
            EntryType::TransferIn => "TRANSFER_IN",
            EntryType::TransferOut => "TRANSFER_OUT",
            EntryType::FundTransferOnDelete => "FUND_TRANSFER_ON_DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE_DEPOSIT" => Some(EntryType::OfflineDeposit),
            "PACKAGE_ACTIVATION" => Some(EntryType::PackageActivation),
            "ROI" => Some(EntryType::Roi),
            "DIRECT" => Some(EntryType::Direct),
            "UNILEVEL" => Some(EntryType::Unilevel),
            "SALARY" => Some(EntryType::Salary),
            "WITHDRAWAL_REQUEST" => Some(EntryType::WithdrawalRequest),
            "ADJUSTMENT" => Some(EntryType::Adjustment),
            "TRANSFER_IN" => Some(EntryType::TransferIn),
            "TRANSFER_OUT" => Some(EntryType::TransferOut),
            "FUND_TRANSFER_ON_DELETE" => Some(EntryType::FundTransferOnDelete),
            _ => None,
        }
    }

    /// Whether entries of this type move the spendable balance.
    ///
    /// Deposits-in-transit and package-activation records track principal,
    /// not spendable funds.
    pub fn affects_available(&self) -> bool {
        !matches!(self, EntryType::OfflineDeposit | EntryType::PackageActivation)
    }

    /// Earning types accrue lifetime earnings when posted.
    ///
    /// Transfers-in credit lifetime earnings too, but only through the
    /// transfer path, never through a generic post.
    pub fn is_earning(&self) -> bool {
        matches!(
            self,
            EntryType::Roi | EntryType::Direct | EntryType::Unilevel | EntryType::Salary
        )
    }
}

/// Ledger entry status. Persisted names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Verified,
    Posted,
    Rejected,
    Cancelled,
    Paid,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Verified => "VERIFIED",
            EntryStatus::Posted => "POSTED",
            EntryStatus::Rejected => "REJECTED",
            EntryStatus::Cancelled => "CANCELLED",
            EntryStatus::Paid => "PAID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EntryStatus::Pending),
            "VERIFIED" => Some(EntryStatus::Verified),
            "POSTED" => Some(EntryStatus::Posted),
            "REJECTED" => Some(EntryStatus::Rejected),
            "CANCELLED" => Some(EntryStatus::Cancelled),
            "PAID" => Some(EntryStatus::Paid),
            _ => None,
        }
    }

    /// Statuses whose entries count toward the reconstructed balance.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            EntryStatus::Posted | EntryStatus::Paid | EntryStatus::Verified
        )
    }
}

/// An immutable record of a single money movement.
///
/// Amounts never change after the entry settles; only the bounded status
/// transitions PENDING -> POSTED/REJECTED/PAID are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub entry_type: EntryType,
    /// Signed amount in minor units. Debits are negative.
    pub amount_minor: i64,
    pub status: EntryStatus,
    /// Who created the entry: a member id, admin name, or `system`.
    pub actor: String,
    /// Free-form context: source event ids, counterpart member, bonus level.
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether this entry counts toward the owner's reconstructed available
    /// balance. A pending withdrawal already debited the balance, so it is
    /// included despite not being settled yet.
    pub fn counts_toward_available(&self) -> bool {
        if !self.entry_type.affects_available() {
            return false;
        }
        if self.status.is_settled() {
            return true;
        }
        self.status == EntryStatus::Pending && self.entry_type == EntryType::WithdrawalRequest
    }
}

/// Derived, mutable running totals per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub owner_id: Uuid,
    /// Spendable balance in minor units.
    pub available_minor: i64,
    /// Monotonic earnings total. Never debited by spend.
    pub lifetime_minor: i64,
}

impl BalanceSummary {
    pub fn empty(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            available_minor: 0,
            lifetime_minor: 0,
        }
    }
}

/// One-time-password state for a member's transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpState {
    pub owner_id: Uuid,
    /// Hex SHA-512 over owner id and code. `None` after a code is consumed.
    pub code_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Requests inside the current rolling hour.
    pub request_count: u32,
    pub last_request_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OtpState {
    pub fn empty(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            code_hash: None,
            expires_at: None,
            request_count: 0,
            last_request_at: None,
            failed_attempts: 0,
            locked_until: None,
        }
    }
}

/// Tombstone left behind when a member is archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub member_id: Uuid,
    pub member_no: String,
    pub swept_minor: i64,
    pub actor: String,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_names_round_trip() {
        for ty in [
            EntryType::OfflineDeposit,
            EntryType::PackageActivation,
            EntryType::Roi,
            EntryType::Direct,
            EntryType::Unilevel,
            EntryType::Salary,
            EntryType::WithdrawalRequest,
            EntryType::Adjustment,
            EntryType::TransferIn,
            EntryType::TransferOut,
            EntryType::FundTransferOnDelete,
        ] {
            assert_eq!(EntryType::parse(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn deposit_records_do_not_touch_available() {
        assert!(!EntryType::OfflineDeposit.affects_available());
        assert!(!EntryType::PackageActivation.affects_available());
        assert!(EntryType::TransferOut.affects_available());
        assert!(EntryType::WithdrawalRequest.affects_available());
    }

    #[test]
    fn pending_withdrawal_counts_toward_available() {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            entry_type: EntryType::WithdrawalRequest,
            amount_minor: -500,
            status: EntryStatus::Pending,
            actor: "m".into(),
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(entry.counts_toward_available());

        let deposit = LedgerEntry {
            entry_type: EntryType::OfflineDeposit,
            ..entry.clone()
        };
        assert!(!deposit.counts_toward_available());
    }
}
