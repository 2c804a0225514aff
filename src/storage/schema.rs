//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, plus the DDL the stores run at init.

use sea_query::Iden;

/// Members table schema.
#[derive(Iden)]
pub enum Members {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "member_no"]
    MemberNo,
    #[iden = "referral_code"]
    ReferralCode,
    #[iden = "sponsor_id"]
    SponsorId,
    #[iden = "parent_id"]
    ParentId,
    #[iden = "is_split_sponsor"]
    IsSplitSponsor,
    #[iden = "package_minor"]
    PackageMinor,
    #[iden = "active"]
    Active,
    #[iden = "kyc_verified"]
    KycVerified,
    #[iden = "joined_at"]
    JoinedAt,
    #[iden = "placement_deadline"]
    PlacementDeadline,
    #[iden = "archived"]
    Archived,
}

/// Sequence counters table schema.
#[derive(Iden)]
pub enum Counters {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "value"]
    Value,
}

/// Ledger entries table schema.
#[derive(Iden)]
pub enum Ledger {
    #[iden = "ledger_entries"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "owner_id"]
    OwnerId,
    #[iden = "entry_type"]
    EntryType,
    #[iden = "amount_minor"]
    AmountMinor,
    #[iden = "status"]
    Status,
    #[iden = "actor"]
    Actor,
    #[iden = "meta"]
    Meta,
    #[iden = "created_at"]
    CreatedAt,
}

/// Balance summaries table schema.
#[derive(Iden)]
pub enum Balances {
    Table,
    #[iden = "owner_id"]
    OwnerId,
    #[iden = "available_minor"]
    AvailableMinor,
    #[iden = "lifetime_minor"]
    LifetimeMinor,
}

/// Funding events table schema.
#[derive(Iden)]
pub enum FundingEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "order_no"]
    OrderNo,
    #[iden = "owner_id"]
    OwnerId,
    #[iden = "source_amount_minor"]
    SourceAmountMinor,
    #[iden = "source_currency"]
    SourceCurrency,
    #[iden = "settled_minor"]
    SettledMinor,
    #[iden = "status"]
    Status,
    #[iden = "ledger_entry_id"]
    LedgerEntryId,
    #[iden = "verified_at"]
    VerifiedAt,
    #[iden = "lineage"]
    Lineage,
    #[iden = "created_at"]
    CreatedAt,
}

/// OTP state table schema.
#[derive(Iden)]
pub enum OtpStates {
    Table,
    #[iden = "owner_id"]
    OwnerId,
    #[iden = "code_hash"]
    CodeHash,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "request_count"]
    RequestCount,
    #[iden = "last_request_at"]
    LastRequestAt,
    #[iden = "failed_attempts"]
    FailedAttempts,
    #[iden = "locked_until"]
    LockedUntil,
}

/// Tombstones table schema.
#[derive(Iden)]
pub enum Tombstones {
    Table,
    #[iden = "member_id"]
    MemberId,
    #[iden = "member_no"]
    MemberNo,
    #[iden = "swept_minor"]
    SweptMinor,
    #[iden = "actor"]
    Actor,
    #[iden = "archived_at"]
    ArchivedAt,
}

/// SQL for creating the members and counters tables.
pub const CREATE_MEMBERS_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS members (
    id TEXT PRIMARY KEY,
    member_no TEXT NOT NULL UNIQUE,
    referral_code TEXT NOT NULL UNIQUE,
    sponsor_id TEXT,
    parent_id TEXT,
    is_split_sponsor INTEGER NOT NULL DEFAULT 0,
    package_minor INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 0,
    kyc_verified INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL,
    placement_deadline TEXT,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_members_parent ON members(parent_id);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tombstones (
    member_id TEXT PRIMARY KEY,
    member_no TEXT NOT NULL,
    swept_minor INTEGER NOT NULL,
    actor TEXT NOT NULL,
    archived_at TEXT NOT NULL
);
"#;

/// SQL for creating the ledger, balance, and funding tables.
pub const CREATE_LEDGER_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    status TEXT NOT NULL,
    actor TEXT NOT NULL,
    meta TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_owner ON ledger_entries(owner_id);

CREATE TABLE IF NOT EXISTS balances (
    owner_id TEXT PRIMARY KEY,
    available_minor INTEGER NOT NULL DEFAULT 0,
    lifetime_minor INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS funding_events (
    id TEXT PRIMARY KEY,
    order_no TEXT NOT NULL UNIQUE,
    owner_id TEXT NOT NULL,
    source_amount_minor INTEGER NOT NULL,
    source_currency TEXT NOT NULL,
    settled_minor INTEGER NOT NULL,
    status TEXT NOT NULL,
    ledger_entry_id TEXT,
    verified_at TEXT,
    lineage TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_funding_owner ON funding_events(owner_id);
"#;

/// SQL for creating the OTP state table.
pub const CREATE_OTP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS otp_states (
    owner_id TEXT PRIMARY KEY,
    code_hash TEXT,
    expires_at TEXT,
    request_count INTEGER NOT NULL DEFAULT 0,
    last_request_at TEXT,
    failed_attempts INTEGER NOT NULL DEFAULT 0,
    locked_until TEXT
);
"#;
