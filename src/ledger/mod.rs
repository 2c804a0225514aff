//! Ledger service: posting, balances, withdrawals, and OTP-gated transfers.
//!
//! Every money movement is an append-only ledger row plus an atomic balance
//! effect. Amounts never change after settling; corrections are new rows.
//! Transfers require a fresh one-time password and settle both legs in a
//! single storage transaction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha512};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::OtpConfig;
use crate::errors::{CoreError, Result};
use crate::model::{BalanceSummary, EntryStatus, EntryType, LedgerEntry, OtpState};
use crate::storage::{BalanceEffect, LedgerFilter, LedgerStore, MemberStore, OtpStore, TransferPosting};

/// Actor name recorded on system-originated entries.
pub const SYSTEM_ACTOR: &str = "system";

/// Outcome of replaying an owner's ledger against the stored summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub owner_id: Uuid,
    pub stored_available_minor: i64,
    pub computed_available_minor: i64,
}

impl ReconcileReport {
    pub fn consistent(&self) -> bool {
        self.stored_available_minor == self.computed_available_minor
    }
}

/// A member-to-member balance transfer request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub sender: Uuid,
    pub recipient: Uuid,
    pub amount_minor: i64,
    pub otp_code: String,
}

/// Posting, balance, withdrawal, and transfer operations over the ledger.
pub struct LedgerService {
    members: Arc<dyn MemberStore>,
    ledger: Arc<dyn LedgerStore>,
    otp: Arc<dyn OtpStore>,
    otp_config: OtpConfig,
    clock: Arc<dyn Clock>,
}

/// Hex SHA-512 over the owner id and code. Stored instead of the code.
pub fn hash_otp(owner: Uuid, code: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(owner.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

impl LedgerService {
    pub fn new(
        members: Arc<dyn MemberStore>,
        ledger: Arc<dyn LedgerStore>,
        otp: Arc<dyn OtpStore>,
        otp_config: OtpConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            members,
            ledger,
            otp,
            otp_config,
            clock,
        }
    }

    /// Append an entry, applying its balance effect atomically.
    ///
    /// The effect follows from type and status: entries that move the
    /// spendable balance apply their signed amount once countable, and
    /// earning types additionally accrue lifetime earnings when settled.
    pub async fn post(
        &self,
        owner: Uuid,
        entry_type: EntryType,
        amount_minor: i64,
        status: EntryStatus,
        actor: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            owner_id: owner,
            entry_type,
            amount_minor,
            status,
            actor: actor.to_string(),
            meta,
            created_at: self.clock.now(),
        };
        let effect = Self::effect_for(&entry);
        self.ledger
            .append(&entry, effect)
            .await
            .map_err(CoreError::from_storage)?;
        info!(
            owner = %owner,
            entry = %entry.id,
            entry_type = entry_type.as_str(),
            amount = amount_minor,
            "ledger entry posted"
        );
        Ok(entry)
    }

    fn effect_for(entry: &LedgerEntry) -> BalanceEffect {
        let available = if entry.counts_toward_available() {
            entry.amount_minor
        } else {
            0
        };
        let lifetime = if entry.entry_type.is_earning() && entry.status.is_settled() {
            entry.amount_minor
        } else {
            0
        };
        BalanceEffect {
            available,
            lifetime,
        }
    }

    /// Stored balance summary; zero for members with no ledger activity.
    pub async fn get_balance(&self, owner: Uuid) -> Result<BalanceSummary> {
        let summary = self
            .ledger
            .balance(owner)
            .await
            .map_err(CoreError::from_storage)?;
        Ok(summary.unwrap_or_else(|| BalanceSummary::empty(owner)))
    }

    pub async fn list_ledger(&self, owner: Uuid, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        self.ledger
            .list_for_owner(owner, filter)
            .await
            .map_err(CoreError::from_storage)
    }

    /// Replay the owner's entries and compare against the stored summary.
    /// Pending withdrawals count: their debit is already reflected.
    pub async fn reconcile(&self, owner: Uuid) -> Result<ReconcileReport> {
        let stored = self.get_balance(owner).await?;
        let entries = self
            .ledger
            .list_for_owner(owner, &LedgerFilter::default())
            .await
            .map_err(CoreError::from_storage)?;
        let computed = entries
            .iter()
            .filter(|e| e.counts_toward_available())
            .map(|e| e.amount_minor)
            .sum();
        let report = ReconcileReport {
            owner_id: owner,
            stored_available_minor: stored.available_minor,
            computed_available_minor: computed,
        };
        if !report.consistent() {
            warn!(
                owner = %owner,
                stored = report.stored_available_minor,
                computed = report.computed_available_minor,
                "balance summary out of step with ledger"
            );
        }
        Ok(report)
    }

    /// Issue a transfer OTP for the member, rate-limited inside a rolling
    /// window and refused entirely during lockout.
    ///
    /// Returns the plaintext code for delivery; only its hash is stored.
    pub async fn request_transfer_otp(&self, owner: Uuid) -> Result<String> {
        let member = self.members.get(owner).await.map_err(CoreError::from_storage)?;
        if member.archived {
            return Err(CoreError::Conflict(format!(
                "member {} is archived",
                member.member_no
            )));
        }

        let now = self.clock.now();
        let mut state = self
            .otp
            .get(owner)
            .await
            .map_err(CoreError::from_storage)?
            .unwrap_or_else(|| OtpState::empty(owner));

        if let Some(until) = state.locked_until {
            if now < until {
                return Err(CoreError::Authorization(format!(
                    "transfers locked until {until}"
                )));
            }
            // Lockout elapsed; start clean.
            state.locked_until = None;
            state.failed_attempts = 0;
        }

        let window = Duration::seconds(self.otp_config.request_window_secs);
        let in_window = state
            .last_request_at
            .map(|at| now - at < window)
            .unwrap_or(false);
        if in_window {
            if state.request_count >= self.otp_config.max_requests_per_window {
                return Err(CoreError::Conflict(
                    "too many code requests, retry later".to_string(),
                ));
            }
            state.request_count += 1;
        } else {
            state.request_count = 1;
        }

        let code = format!("{:06}", rand::rng().random_range(0..1_000_000));
        state.code_hash = Some(hash_otp(owner, &code));
        state.expires_at = Some(now + Duration::seconds(self.otp_config.ttl_secs));
        state.last_request_at = Some(now);
        self.otp.put(&state).await.map_err(CoreError::from_storage)?;
        info!(owner = %owner, "transfer code issued");
        Ok(code)
    }

    /// Verify the presented OTP, consuming it on success and counting
    /// failures toward lockout.
    async fn check_otp(&self, owner: Uuid, code: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self
            .otp
            .get(owner)
            .await
            .map_err(CoreError::from_storage)?
            .unwrap_or_else(|| OtpState::empty(owner));

        if let Some(until) = state.locked_until {
            if now < until {
                return Err(CoreError::Authorization(format!(
                    "transfers locked until {until}"
                )));
            }
        }

        let live = match (&state.code_hash, state.expires_at) {
            (Some(hash), Some(expires)) if now <= expires => Some(hash.clone()),
            _ => None,
        };
        let Some(expected) = live else {
            return Err(CoreError::Authorization(
                "no valid transfer code, request a new one".to_string(),
            ));
        };

        if hash_otp(owner, code) != expected {
            state.failed_attempts += 1;
            if state.failed_attempts >= self.otp_config.max_failed_attempts {
                state.locked_until =
                    Some(now + Duration::seconds(self.otp_config.lockout_secs));
                state.code_hash = None;
                state.expires_at = None;
                warn!(owner = %owner, "transfer lockout triggered");
            }
            self.otp.put(&state).await.map_err(CoreError::from_storage)?;
            return Err(CoreError::Authorization(
                "transfer code did not match".to_string(),
            ));
        }

        // Consumed: a code authorizes exactly one transfer.
        self.otp
            .clear_code(owner)
            .await
            .map_err(CoreError::from_storage)?;
        Ok(())
    }

    /// OTP-gated member-to-member transfer. Both legs settle in one storage
    /// transaction; on any failure neither balance moves.
    pub async fn transfer(&self, request: TransferRequest) -> Result<(LedgerEntry, LedgerEntry)> {
        if request.sender == request.recipient {
            return Err(CoreError::Validation(
                "cannot transfer to yourself".to_string(),
            ));
        }
        if request.amount_minor <= 0 {
            return Err(CoreError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        let sender = self
            .members
            .get(request.sender)
            .await
            .map_err(CoreError::from_storage)?;
        let recipient = self
            .members
            .get(request.recipient)
            .await
            .map_err(CoreError::from_storage)?;
        if recipient.archived {
            return Err(CoreError::Conflict(format!(
                "recipient {} is archived",
                recipient.member_no
            )));
        }

        let balance = self.get_balance(sender.id).await?;
        if balance.available_minor < request.amount_minor {
            return Err(CoreError::Conflict(format!(
                "insufficient funds: have {}, need {}",
                balance.available_minor, request.amount_minor
            )));
        }

        self.check_otp(sender.id, &request.otp_code).await?;

        let posting = TransferPosting {
            tx_id: Uuid::new_v4(),
            sender: sender.id,
            recipient: recipient.id,
            amount_minor: request.amount_minor,
            actor: sender.id.to_string(),
            out_type: EntryType::TransferOut,
            in_type: EntryType::TransferIn,
            credit_lifetime: true,
            meta: json!({
                "sender_no": sender.member_no,
                "recipient_no": recipient.member_no,
            }),
            created_at: self.clock.now(),
        };
        let (out, incoming) = self
            .ledger
            .apply_transfer(&posting)
            .await
            .map_err(CoreError::from_storage)?;
        info!(
            sender = %sender.member_no,
            recipient = %recipient.member_no,
            amount = request.amount_minor,
            tx = %posting.tx_id,
            "transfer settled"
        );
        Ok((out, incoming))
    }

    /// Debit the balance immediately and leave the entry pending payout.
    pub async fn request_withdrawal(
        &self,
        owner: Uuid,
        amount_minor: i64,
        actor: &str,
    ) -> Result<LedgerEntry> {
        if amount_minor <= 0 {
            return Err(CoreError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }
        let member = self.members.get(owner).await.map_err(CoreError::from_storage)?;
        if !member.kyc_verified {
            return Err(CoreError::Authorization(format!(
                "member {} must pass KYC before withdrawing",
                member.member_no
            )));
        }
        let balance = self.get_balance(owner).await?;
        if balance.available_minor < amount_minor {
            return Err(CoreError::Conflict(format!(
                "available balance {} cannot cover withdrawal {}",
                balance.available_minor, amount_minor
            )));
        }
        self.post(
            owner,
            EntryType::WithdrawalRequest,
            -amount_minor,
            EntryStatus::Pending,
            actor,
            json!({}),
        )
        .await
    }

    /// Mark a pending withdrawal as paid out. The balance was already
    /// debited at request time.
    pub async fn approve_withdrawal(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.ledger
            .update_status(entry_id, EntryStatus::Pending, EntryStatus::Paid, BalanceEffect::NONE)
            .await
            .map_err(CoreError::from_storage)
    }

    /// Reject a pending withdrawal, restoring the debited funds.
    pub async fn reject_withdrawal(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let entry = self
            .ledger
            .get_entry(entry_id)
            .await
            .map_err(CoreError::from_storage)?;
        if entry.entry_type != EntryType::WithdrawalRequest {
            return Err(CoreError::Conflict(format!(
                "entry {entry_id} is not a withdrawal request"
            )));
        }
        self.ledger
            .update_status(
                entry_id,
                EntryStatus::Pending,
                EntryStatus::Rejected,
                BalanceEffect::available(-entry.amount_minor),
            )
            .await
            .map_err(CoreError::from_storage)
    }

    /// Signed admin correction. Negative adjustments must be covered.
    pub async fn post_adjustment(
        &self,
        owner: Uuid,
        amount_minor: i64,
        actor: &str,
        note: &str,
    ) -> Result<LedgerEntry> {
        if amount_minor == 0 {
            return Err(CoreError::Validation(
                "adjustment amount must be nonzero".to_string(),
            ));
        }
        self.members.get(owner).await.map_err(CoreError::from_storage)?;
        if amount_minor < 0 {
            let balance = self.get_balance(owner).await?;
            if balance.available_minor < -amount_minor {
                return Err(CoreError::Conflict(format!(
                    "available balance {} cannot cover adjustment {}",
                    balance.available_minor, amount_minor
                )));
            }
        }
        self.post(
            owner,
            EntryType::Adjustment,
            amount_minor,
            EntryStatus::Posted,
            actor,
            json!({ "note": note }),
        )
        .await
    }

    /// Rank-salary payout, an earning credit.
    pub async fn post_salary(&self, owner: Uuid, amount_minor: i64, actor: &str) -> Result<LedgerEntry> {
        if amount_minor <= 0 {
            return Err(CoreError::Validation(
                "salary amount must be positive".to_string(),
            ));
        }
        self.members.get(owner).await.map_err(CoreError::from_storage)?;
        self.post(
            owner,
            EntryType::Salary,
            amount_minor,
            EntryStatus::Posted,
            actor,
            json!({}),
        )
        .await
    }
}
