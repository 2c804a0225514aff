//! The SQLite backend fulfills the same storage contracts the services are
//! built on: cap-checked inserts, single-shot verification, atomic transfers.

#![cfg(feature = "sqlite")]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use upline::config::{PlanConfig, StorageConfig};
use upline::model::{
    EntryStatus, EntryType, FundingEvent, FundingStatus, LedgerEntry, LineageSnapshot, NewMember,
    OtpState,
};
use upline::storage::{init_storage, BalanceEffect, Stores, TransferPosting};

async fn sqlite_stores(dir: &tempfile::TempDir) -> Stores {
    let config = StorageConfig {
        storage_type: "sqlite".to_string(),
        path: dir
            .path()
            .join("upline.db")
            .to_string_lossy()
            .into_owned(),
    };
    init_storage(&config, &PlanConfig::default()).await.unwrap()
}

fn new_member(no: &str, sponsor: Uuid, parent: Uuid) -> NewMember {
    let id = Uuid::new_v4();
    NewMember {
        id,
        member_no: no.to_string(),
        referral_code: format!("ref-{no}"),
        sponsor_id: Some(sponsor),
        parent_id: Some(parent),
        is_split_sponsor: false,
        joined_at: Utc::now(),
        placement_deadline: None,
    }
}

fn entry(owner: Uuid, entry_type: EntryType, amount: i64, status: EntryStatus) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        owner_id: owner,
        entry_type,
        amount_minor: amount,
        status,
        actor: "test".to_string(),
        meta: json!({}),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn member_store_enforces_cap_and_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let stores = sqlite_stores(&dir).await;
    let root = stores.members.get_root().await.unwrap();

    // Sequence numbers survive in the database, not in process state.
    let first = stores.members.next_member_no().await.unwrap();
    let second = stores.members.next_member_no().await.unwrap();
    assert_eq!(second, first + 1);

    let parent = stores
        .members
        .insert(new_member("M-1", root.id, root.id))
        .await
        .unwrap();
    for i in 0..6 {
        stores
            .members
            .insert(new_member(&format!("M-1{i}"), parent.id, parent.id))
            .await
            .unwrap();
    }
    let err = stores
        .members
        .insert(new_member("M-17", parent.id, parent.id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        upline::storage::StorageError::CapExceeded { .. }
    ));
    assert_eq!(stores.members.count_children(parent.id).await.unwrap(), 6);

    // Lookup paths agree with each other.
    let by_code = stores
        .members
        .find_by_referral("ref-M-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_code.id, parent.id);
    let by_no = stores
        .members
        .find_by_member_no("M-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_no.id, parent.id);
}

#[tokio::test]
async fn funding_verification_is_single_shot() {
    let dir = tempfile::tempdir().unwrap();
    let stores = sqlite_stores(&dir).await;
    let root = stores.members.get_root().await.unwrap();
    let member = stores
        .members
        .insert(new_member("M-1", root.id, root.id))
        .await
        .unwrap();

    let event = FundingEvent {
        id: Uuid::new_v4(),
        order_no: "DEP-1".to_string(),
        owner_id: member.id,
        source_amount_minor: 50_000,
        source_currency: "USD".to_string(),
        settled_minor: 50_000,
        status: FundingStatus::Pending,
        ledger_entry_id: None,
        verified_at: None,
        lineage: None,
        created_at: Utc::now(),
    };
    stores.ledger.insert_funding(&event).await.unwrap();

    let lineage = LineageSnapshot {
        sponsor_id: Some(root.id),
        parent_id: Some(root.id),
        upline: vec![],
    };
    let verified = stores
        .ledger
        .mark_funding_verified(event.id, Utc::now(), lineage.clone())
        .await
        .unwrap();
    assert_eq!(verified.status, FundingStatus::Verified);
    assert!(verified.verified_at.is_some());

    let err = stores
        .ledger
        .mark_funding_verified(event.id, Utc::now(), lineage)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        upline::storage::StorageError::StatusConflict { .. }
    ));
    assert_eq!(
        stores.ledger.count_verified_funding(member.id).await.unwrap(),
        1
    );

    let by_order = stores
        .ledger
        .find_funding_by_order("DEP-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_order.status, FundingStatus::Verified);
}

#[tokio::test]
async fn transfers_settle_atomically_and_balances_persist() {
    let dir = tempfile::tempdir().unwrap();
    let stores = sqlite_stores(&dir).await;
    let root = stores.members.get_root().await.unwrap();
    let sender = stores
        .members
        .insert(new_member("M-1", root.id, root.id))
        .await
        .unwrap();
    let recipient = stores
        .members
        .insert(new_member("M-2", root.id, root.id))
        .await
        .unwrap();

    stores
        .ledger
        .append(
            &entry(sender.id, EntryType::Roi, 10_000, EntryStatus::Posted),
            BalanceEffect::earning(10_000),
        )
        .await
        .unwrap();

    let posting = TransferPosting {
        tx_id: Uuid::new_v4(),
        sender: sender.id,
        recipient: recipient.id,
        amount_minor: 4_000,
        actor: sender.id.to_string(),
        out_type: EntryType::TransferOut,
        in_type: EntryType::TransferIn,
        credit_lifetime: true,
        meta: json!({}),
        created_at: Utc::now(),
    };
    let (out, incoming) = stores.ledger.apply_transfer(&posting).await.unwrap();
    assert_eq!(out.amount_minor, -4_000);
    assert_eq!(incoming.amount_minor, 4_000);

    let sender_balance = stores.ledger.balance(sender.id).await.unwrap().unwrap();
    assert_eq!(sender_balance.available_minor, 6_000);
    let recipient_balance = stores.ledger.balance(recipient.id).await.unwrap().unwrap();
    assert_eq!(recipient_balance.available_minor, 4_000);
    assert_eq!(recipient_balance.lifetime_minor, 4_000);

    // An overdraft fails without touching either side.
    let overdraft = TransferPosting {
        tx_id: Uuid::new_v4(),
        amount_minor: 50_000,
        ..posting
    };
    let err = stores.ledger.apply_transfer(&overdraft).await.unwrap_err();
    assert!(matches!(
        err,
        upline::storage::StorageError::InsufficientFunds { .. }
    ));
    let sender_balance = stores.ledger.balance(sender.id).await.unwrap().unwrap();
    assert_eq!(sender_balance.available_minor, 6_000);
}

#[tokio::test]
async fn otp_state_round_trips_and_clears() {
    let dir = tempfile::tempdir().unwrap();
    let stores = sqlite_stores(&dir).await;
    let owner = Uuid::new_v4();

    assert!(stores.otp.get(owner).await.unwrap().is_none());

    let state = OtpState {
        owner_id: owner,
        code_hash: Some("abc123".to_string()),
        expires_at: Some(Utc::now()),
        request_count: 2,
        last_request_at: Some(Utc::now()),
        failed_attempts: 1,
        locked_until: None,
    };
    stores.otp.put(&state).await.unwrap();

    let loaded = stores.otp.get(owner).await.unwrap().unwrap();
    assert_eq!(loaded.code_hash.as_deref(), Some("abc123"));
    assert_eq!(loaded.request_count, 2);
    assert_eq!(loaded.failed_attempts, 1);

    stores.otp.clear_code(owner).await.unwrap();
    let cleared = stores.otp.get(owner).await.unwrap().unwrap();
    assert!(cleared.code_hash.is_none());
    assert!(cleared.expires_at.is_none());
    assert_eq!(cleared.failed_attempts, 0);
    // The rolling request window survives a consumed code.
    assert_eq!(cleared.request_count, 2);
}
