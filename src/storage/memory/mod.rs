//! In-memory storage implementations.
//!
//! Same write-side semantics as the SQLite backend, held under a single
//! `RwLock` per store so every multi-step write commits or fails as a unit.
//! Used by tests and standalone runs; the ledger store carries a fault
//! injection toggle for transfer-atomicity tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{
    BalanceSummary, EntryStatus, FundingEvent, FundingStatus, LedgerEntry, LineageSnapshot,
    Member, NewMember, OtpState, Tombstone, ROOT_MEMBER_NO,
};
use crate::storage::{
    BalanceEffect, LedgerFilter, LedgerStore, MemberStore, OtpStore, Result, StorageError,
    TransferPosting,
};

#[derive(Default)]
struct MemberState {
    members: HashMap<Uuid, Member>,
    tombstones: HashMap<Uuid, Tombstone>,
    member_no_seq: u64,
    root_id: Option<Uuid>,
}

/// In-memory member directory.
pub struct MemoryMemberStore {
    width_cap: u32,
    state: RwLock<MemberState>,
}

impl MemoryMemberStore {
    pub fn new(width_cap: u32) -> Self {
        Self {
            width_cap,
            state: RwLock::new(MemberState::default()),
        }
    }

    /// Rewrite a member's join date. Test hook for date-sensitive batches.
    pub async fn set_joined_at(
        &self,
        member: Uuid,
        joined_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.joined_at = joined_at;
        Ok(())
    }

    fn count_children_locked(state: &MemberState, parent: Uuid) -> u32 {
        state
            .members
            .values()
            .filter(|m| m.parent_id == Some(parent) && !m.archived)
            .count() as u32
    }
}

#[async_trait]
impl MemberStore for MemoryMemberStore {
    async fn init(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.root_id.is_some() {
            return Ok(());
        }
        let root = Member {
            id: Uuid::new_v4(),
            member_no: ROOT_MEMBER_NO.to_string(),
            referral_code: "root".to_string(),
            sponsor_id: None,
            parent_id: None,
            is_split_sponsor: false,
            package_minor: 0,
            active: true,
            kyc_verified: true,
            joined_at: Utc::now(),
            placement_deadline: None,
            archived: false,
        };
        state.root_id = Some(root.id);
        state.members.insert(root.id, root);
        Ok(())
    }

    async fn insert(&self, member: NewMember) -> Result<Member> {
        let mut state = self.state.write().await;
        if let Some(parent) = member.parent_id {
            if !state.members.contains_key(&parent) {
                return Err(StorageError::NotFound {
                    what: "member",
                    key: parent.to_string(),
                });
            }
            // Root is exempt from the width cap.
            if state.root_id != Some(parent)
                && Self::count_children_locked(&state, parent) >= self.width_cap
            {
                return Err(StorageError::CapExceeded { parent });
            }
        }
        let row = Member {
            id: member.id,
            member_no: member.member_no,
            referral_code: member.referral_code,
            sponsor_id: member.sponsor_id,
            parent_id: member.parent_id,
            is_split_sponsor: member.is_split_sponsor,
            package_minor: 0,
            active: false,
            kyc_verified: false,
            joined_at: member.joined_at,
            placement_deadline: member.placement_deadline,
            archived: false,
        };
        state.members.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Member> {
        let state = self.state.read().await;
        state
            .members
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: id.to_string(),
            })
    }

    async fn find_by_referral(&self, code: &str) -> Result<Option<Member>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .find(|m| m.referral_code == code && !m.archived)
            .cloned())
    }

    async fn find_by_member_no(&self, member_no: &str) -> Result<Option<Member>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .find(|m| m.member_no == member_no)
            .cloned())
    }

    async fn get_root(&self) -> Result<Member> {
        let state = self.state.read().await;
        let root_id = state.root_id.ok_or(StorageError::NotFound {
            what: "member",
            key: ROOT_MEMBER_NO.to_string(),
        })?;
        Ok(state.members[&root_id].clone())
    }

    async fn count_children(&self, id: Uuid) -> Result<u32> {
        let state = self.state.read().await;
        Ok(Self::count_children_locked(&state, id))
    }

    async fn list_children(&self, id: Uuid) -> Result<Vec<Member>> {
        let state = self.state.read().await;
        let mut children: Vec<Member> = state
            .members
            .values()
            .filter(|m| m.parent_id == Some(id) && !m.archived)
            .cloned()
            .collect();
        children.sort_by_key(|m| m.joined_at);
        Ok(children)
    }

    async fn assign_parent(&self, member: Uuid, parent: Uuid, split: bool) -> Result<Member> {
        let mut state = self.state.write().await;
        if !state.members.contains_key(&parent) {
            return Err(StorageError::NotFound {
                what: "member",
                key: parent.to_string(),
            });
        }
        let current = state
            .members
            .get(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        if current.parent_id.is_some() {
            return Err(StorageError::StatusConflict {
                message: format!("member {member} is already placed"),
            });
        }
        if state.root_id != Some(parent)
            && Self::count_children_locked(&state, parent) >= self.width_cap
        {
            return Err(StorageError::CapExceeded { parent });
        }
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.parent_id = Some(parent);
        row.is_split_sponsor = split;
        row.placement_deadline = None;
        Ok(row.clone())
    }

    async fn set_placement_deadline(&self, member: Uuid, deadline: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.placement_deadline = Some(deadline);
        Ok(())
    }

    async fn record_funding(&self, member: Uuid, delta_minor: i64) -> Result<Member> {
        let mut state = self.state.write().await;
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.package_minor += delta_minor;
        row.active = true;
        Ok(row.clone())
    }

    async fn set_kyc(&self, member: Uuid, verified: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.kyc_verified = verified;
        Ok(())
    }

    async fn archive(&self, member: Uuid, tombstone: Tombstone) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .members
            .get_mut(&member)
            .ok_or_else(|| StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            })?;
        row.archived = true;
        state.tombstones.insert(member, tombstone);
        Ok(())
    }

    async fn next_member_no(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        state.member_no_seq += 1;
        Ok(state.member_no_seq)
    }

    async fn list_funded(&self) -> Result<Vec<Member>> {
        let state = self.state.read().await;
        let root_id = state.root_id;
        let mut members: Vec<Member> = state
            .members
            .values()
            .filter(|m| m.active && !m.archived && Some(m.id) != root_id && m.package_minor > 0)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    balances: HashMap<Uuid, BalanceSummary>,
    funding: HashMap<Uuid, FundingEvent>,
    order_index: HashMap<String, Uuid>,
}

impl LedgerState {
    fn apply_effect(&mut self, owner: Uuid, effect: BalanceEffect) {
        let summary = self
            .balances
            .entry(owner)
            .or_insert_with(|| BalanceSummary::empty(owner));
        summary.available_minor += effect.available;
        summary.lifetime_minor += effect.lifetime;
    }
}

/// In-memory ledger, balances, and funding events.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<LedgerState>,
    /// When set, the next transfer fails after the debit is computed but
    /// before anything commits — the rollback path under test.
    fail_next_transfer: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_transfer(&self) {
        self.fail_next_transfer.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, entry: &LedgerEntry, effect: BalanceEffect) -> Result<()> {
        let mut state = self.state.write().await;
        state.entries.push(entry.clone());
        state.apply_effect(entry.owner_id, effect);
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: EntryStatus,
        next: EntryStatus,
        effect: BalanceEffect,
    ) -> Result<LedgerEntry> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StorageError::NotFound {
                what: "ledger entry",
                key: id.to_string(),
            })?;
        if entry.status != expected {
            return Err(StorageError::StatusConflict {
                message: format!(
                    "entry {id} is {}, expected {}",
                    entry.status.as_str(),
                    expected.as_str()
                ),
            });
        }
        entry.status = next;
        let owner = entry.owner_id;
        let updated = entry.clone();
        state.apply_effect(owner, effect);
        Ok(updated)
    }

    async fn get_entry(&self, id: Uuid) -> Result<LedgerEntry> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: "ledger entry",
                key: id.to_string(),
            })
    }

    async fn list_for_owner(&self, owner: Uuid, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.owner_id == owner)
            .filter(|e| filter.entry_type.map_or(true, |t| e.entry_type == t))
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .cloned()
            .collect())
    }

    async fn balance(&self, owner: Uuid) -> Result<Option<BalanceSummary>> {
        let state = self.state.read().await;
        Ok(state.balances.get(&owner).cloned())
    }

    async fn ensure_balance(&self, owner: Uuid) -> Result<BalanceSummary> {
        let mut state = self.state.write().await;
        Ok(state
            .balances
            .entry(owner)
            .or_insert_with(|| BalanceSummary::empty(owner))
            .clone())
    }

    async fn apply_transfer(
        &self,
        posting: &TransferPosting,
    ) -> Result<(LedgerEntry, LedgerEntry)> {
        let mut state = self.state.write().await;

        let sender_balance =
            state
                .balances
                .get(&posting.sender)
                .ok_or(StorageError::NotFound {
                    what: "balance",
                    key: posting.sender.to_string(),
                })?;
        if sender_balance.available_minor < posting.amount_minor {
            return Err(StorageError::InsufficientFunds {
                owner: posting.sender,
            });
        }

        if self.fail_next_transfer.swap(false, Ordering::SeqCst) {
            // Nothing has been written yet; the lock guarantees no partial
            // state escapes.
            return Err(StorageError::Backend(
                "injected transfer failure".to_string(),
            ));
        }

        let mut meta = posting.meta.clone();
        if let Some(map) = meta.as_object_mut() {
            map.insert(
                "transaction_id".to_string(),
                serde_json::json!(posting.tx_id),
            );
        }

        let out_entry = LedgerEntry {
            id: Uuid::new_v4(),
            owner_id: posting.sender,
            entry_type: posting.out_type,
            amount_minor: -posting.amount_minor,
            status: EntryStatus::Posted,
            actor: posting.actor.clone(),
            meta: {
                let mut m = meta.clone();
                if let Some(map) = m.as_object_mut() {
                    map.insert(
                        "counterpart".to_string(),
                        serde_json::json!(posting.recipient),
                    );
                }
                m
            },
            created_at: posting.created_at,
        };
        let in_entry = LedgerEntry {
            id: Uuid::new_v4(),
            owner_id: posting.recipient,
            entry_type: posting.in_type,
            amount_minor: posting.amount_minor,
            status: EntryStatus::Posted,
            actor: posting.actor.clone(),
            meta: {
                let mut m = meta;
                if let Some(map) = m.as_object_mut() {
                    map.insert("counterpart".to_string(), serde_json::json!(posting.sender));
                }
                m
            },
            created_at: posting.created_at,
        };

        state.apply_effect(posting.sender, BalanceEffect::available(-posting.amount_minor));
        let credit = if posting.credit_lifetime {
            BalanceEffect::earning(posting.amount_minor)
        } else {
            BalanceEffect::available(posting.amount_minor)
        };
        state.apply_effect(posting.recipient, credit);
        state.entries.push(out_entry.clone());
        state.entries.push(in_entry.clone());

        Ok((out_entry, in_entry))
    }

    async fn insert_funding(&self, event: &FundingEvent) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .order_index
            .insert(event.order_no.clone(), event.id);
        state.funding.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_funding(&self, id: Uuid) -> Result<FundingEvent> {
        let state = self.state.read().await;
        state
            .funding
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: "funding event",
                key: id.to_string(),
            })
    }

    async fn find_funding_by_order(&self, order_no: &str) -> Result<Option<FundingEvent>> {
        let state = self.state.read().await;
        Ok(state
            .order_index
            .get(order_no)
            .and_then(|id| state.funding.get(id))
            .cloned())
    }

    async fn mark_funding_verified(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        lineage: LineageSnapshot,
    ) -> Result<FundingEvent> {
        let mut state = self.state.write().await;
        let event = state
            .funding
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound {
                what: "funding event",
                key: id.to_string(),
            })?;
        if event.status != FundingStatus::Pending {
            return Err(StorageError::StatusConflict {
                message: format!("funding event {id} is {}", event.status.as_str()),
            });
        }
        event.status = FundingStatus::Verified;
        event.verified_at = Some(at);
        event.lineage = Some(lineage);
        Ok(event.clone())
    }

    async fn mark_funding_failed(
        &self,
        id: Uuid,
        status: FundingStatus,
    ) -> Result<FundingEvent> {
        let mut state = self.state.write().await;
        let event = state
            .funding
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound {
                what: "funding event",
                key: id.to_string(),
            })?;
        if event.status != FundingStatus::Pending {
            return Err(StorageError::StatusConflict {
                message: format!("funding event {id} is {}", event.status.as_str()),
            });
        }
        event.status = status;
        Ok(event.clone())
    }

    async fn count_verified_funding(&self, owner: Uuid) -> Result<u32> {
        let state = self.state.read().await;
        Ok(state
            .funding
            .values()
            .filter(|f| f.owner_id == owner && f.status == FundingStatus::Verified)
            .count() as u32)
    }
}

/// In-memory OTP state.
#[derive(Default)]
pub struct MemoryOtpStore {
    state: RwLock<HashMap<Uuid, OtpState>>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, owner: Uuid) -> Result<Option<OtpState>> {
        let state = self.state.read().await;
        Ok(state.get(&owner).cloned())
    }

    async fn put(&self, otp: &OtpState) -> Result<()> {
        let mut state = self.state.write().await;
        state.insert(otp.owner_id, otp.clone());
        Ok(())
    }

    async fn clear_code(&self, owner: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(otp) = state.get_mut(&owner) {
            otp.code_hash = None;
            otp.expires_at = None;
            otp.failed_attempts = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryType;

    fn new_member(parent: Option<Uuid>, n: u64) -> NewMember {
        NewMember {
            id: Uuid::new_v4(),
            member_no: format!("M-{n}"),
            referral_code: format!("ref-{n}"),
            sponsor_id: parent,
            parent_id: parent,
            is_split_sponsor: false,
            joined_at: Utc::now(),
            placement_deadline: None,
        }
    }

    #[tokio::test]
    async fn insert_enforces_width_cap() {
        let store = MemoryMemberStore::new(2);
        store.init().await.unwrap();
        let root = store.get_root().await.unwrap();
        let sponsor = store.insert(new_member(Some(root.id), 1)).await.unwrap();

        store.insert(new_member(Some(sponsor.id), 2)).await.unwrap();
        store.insert(new_member(Some(sponsor.id), 3)).await.unwrap();
        let err = store
            .insert(new_member(Some(sponsor.id), 4))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CapExceeded { .. }));
        assert_eq!(store.count_children(sponsor.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn root_is_cap_exempt() {
        let store = MemoryMemberStore::new(2);
        store.init().await.unwrap();
        let root = store.get_root().await.unwrap();
        for n in 0..5 {
            store.insert(new_member(Some(root.id), n + 1)).await.unwrap();
        }
        assert_eq!(store.count_children(root.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn funding_verification_is_single_shot() {
        let store = MemoryLedgerStore::new();
        let event = FundingEvent {
            id: Uuid::new_v4(),
            order_no: "ORD-1".into(),
            owner_id: Uuid::new_v4(),
            source_amount_minor: 1000,
            source_currency: "USD".into(),
            settled_minor: 1000,
            status: FundingStatus::Pending,
            ledger_entry_id: None,
            verified_at: None,
            lineage: None,
            created_at: Utc::now(),
        };
        store.insert_funding(&event).await.unwrap();

        let lineage = LineageSnapshot {
            sponsor_id: None,
            parent_id: None,
            upline: vec![],
        };
        store
            .mark_funding_verified(event.id, Utc::now(), lineage.clone())
            .await
            .unwrap();
        let err = store
            .mark_funding_verified(event.id, Utc::now(), lineage)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn injected_transfer_failure_leaves_no_partial_state() {
        let store = MemoryLedgerStore::new();
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let seed = LedgerEntry {
            id: Uuid::new_v4(),
            owner_id: sender,
            entry_type: EntryType::Adjustment,
            amount_minor: 10_000,
            status: EntryStatus::Posted,
            actor: "admin".into(),
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        };
        store
            .append(&seed, BalanceEffect::available(10_000))
            .await
            .unwrap();

        store.fail_next_transfer();
        let posting = TransferPosting {
            tx_id: Uuid::new_v4(),
            sender,
            recipient,
            amount_minor: 4_000,
            actor: sender.to_string(),
            out_type: EntryType::TransferOut,
            in_type: EntryType::TransferIn,
            credit_lifetime: true,
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        };
        store.apply_transfer(&posting).await.unwrap_err();

        let sender_balance = store.balance(sender).await.unwrap().unwrap();
        assert_eq!(sender_balance.available_minor, 10_000);
        assert!(store.balance(recipient).await.unwrap().is_none());

        // Retry succeeds once the fault is gone.
        let (out_row, in_row) = store.apply_transfer(&posting).await.unwrap();
        assert_eq!(out_row.amount_minor, -4_000);
        assert_eq!(in_row.amount_minor, 4_000);
        let recipient_balance = store.balance(recipient).await.unwrap().unwrap();
        assert_eq!(recipient_balance.available_minor, 4_000);
        assert_eq!(recipient_balance.lifetime_minor, 4_000);
    }
}
