//! Deposit recording, verification, activation, and commission fan-out.
//!
//! A deposit flows Pending -> Verified exactly once; the verification swap is
//! a conditional status update, so concurrent confirmations pay bonuses only
//! once. Bonus fan-out happens after the swap: each bonus is its own
//! append-only ledger row.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::collaborators::fx::{convert_minor, FxRateCache};
use crate::collaborators::webhook;
use crate::collaborators::Notifier;
use crate::commission::{
    self, first_deposit_bonus, prorated_roi, reinvestment_bonus_bps, unilevel_awards, RoiPeriod,
};
use crate::config::{FxConfig, PlanConfig};
use crate::errors::{CoreError, Result};
use crate::ledger::{LedgerService, SYSTEM_ACTOR};
use crate::model::{
    EntryStatus, EntryType, FundingEvent, FundingStatus, LineageSnapshot, Member, Tombstone,
};
use crate::placement::PlacementEngine;
use crate::storage::{BalanceEffect, LedgerStore, MemberStore, TransferPosting};

/// Outcome of one monthly ROI batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoiRunReport {
    pub members_paid: u32,
    pub total_minor: i64,
}

/// Orchestrates deposits, verification, bonuses, archival, and the ROI batch.
pub struct ActivationService {
    members: Arc<dyn MemberStore>,
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    placement: Arc<PlacementEngine>,
    plan: PlanConfig,
    fx_config: FxConfig,
    fx: Arc<FxRateCache>,
    notifier: Arc<dyn Notifier>,
    webhook_secret: Vec<u8>,
    clock: Arc<dyn Clock>,
    verify_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ActivationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        members: Arc<dyn MemberStore>,
        store: Arc<dyn LedgerStore>,
        ledger: Arc<LedgerService>,
        placement: Arc<PlacementEngine>,
        plan: PlanConfig,
        fx_config: FxConfig,
        fx: Arc<FxRateCache>,
        notifier: Arc<dyn Notifier>,
        webhook_secret: Vec<u8>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            members,
            store,
            ledger,
            placement,
            plan,
            fx_config,
            fx,
            notifier,
            webhook_secret,
            clock,
            verify_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn owner_lock(&self, owner: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.verify_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(owner).or_default().clone()
    }

    fn notify_detached(&self, member: Uuid, template: &'static str, payload: serde_json::Value) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(member, template, payload).await {
                warn!(member = %member, template, error = %e, "notification failed");
            }
        });
    }

    /// Record a deposit awaiting verification: a Pending funding event plus
    /// a Pending deposit-in-transit ledger row. Foreign amounts convert into
    /// the settlement currency at today's cached rate.
    pub async fn record_deposit(
        &self,
        owner: Uuid,
        source_amount_minor: i64,
        currency: &str,
        actor: &str,
    ) -> Result<FundingEvent> {
        if source_amount_minor <= 0 {
            return Err(CoreError::Validation(
                "deposit amount must be positive".to_string(),
            ));
        }
        let member = self.members.get(owner).await.map_err(CoreError::from_storage)?;
        if member.archived {
            return Err(CoreError::Conflict(format!(
                "member {} is archived",
                member.member_no
            )));
        }

        let settled_minor = if currency == self.fx_config.settlement_currency {
            source_amount_minor
        } else {
            let rate = self.fx.rate(currency, false).await?;
            convert_minor(source_amount_minor, rate)
        };
        if settled_minor <= 0 {
            return Err(CoreError::Validation(format!(
                "deposit converts to nothing at the current {currency} rate"
            )));
        }

        let event_id = Uuid::new_v4();
        let order_no = format!("DEP-{}", &event_id.simple().to_string()[..12]);
        let entry = self
            .ledger
            .post(
                owner,
                EntryType::OfflineDeposit,
                settled_minor,
                EntryStatus::Pending,
                actor,
                json!({ "order_no": order_no, "funding_event": event_id }),
            )
            .await?;

        let event = FundingEvent {
            id: event_id,
            order_no,
            owner_id: owner,
            source_amount_minor,
            source_currency: currency.to_string(),
            settled_minor,
            status: FundingStatus::Pending,
            ledger_entry_id: Some(entry.id),
            verified_at: None,
            lineage: None,
            created_at: self.clock.now(),
        };
        self.store
            .insert_funding(&event)
            .await
            .map_err(CoreError::from_storage)?;
        info!(
            owner = %member.member_no,
            order = %event.order_no,
            settled = settled_minor,
            "deposit recorded"
        );
        Ok(event)
    }

    /// Verify a pending deposit and activate its consequences: commissions,
    /// package growth, and the activation record.
    ///
    /// Lineage is resolved and snapshotted before the status swap; only the
    /// caller that wins the swap pays bonuses, so double verification cannot
    /// double-pay. Verifications for one member run serially so the
    /// first-deposit classification always sees every earlier verified
    /// deposit, even when distinct pending deposits are confirmed at once.
    pub async fn verify_and_activate(&self, deposit_id: Uuid, actor: &str) -> Result<FundingEvent> {
        let event = self
            .store
            .get_funding(deposit_id)
            .await
            .map_err(CoreError::from_storage)?;
        let lock = self.owner_lock(event.owner_id).await;
        let _guard = lock.lock().await;
        self.verify_under_lock(deposit_id, actor).await
    }

    async fn verify_under_lock(&self, deposit_id: Uuid, actor: &str) -> Result<FundingEvent> {
        let event = self
            .store
            .get_funding(deposit_id)
            .await
            .map_err(CoreError::from_storage)?;
        if event.status != FundingStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "deposit {} is already {}",
                event.order_no,
                event.status.as_str()
            )));
        }

        let member = self
            .members
            .get(event.owner_id)
            .await
            .map_err(CoreError::from_storage)?;
        if member.archived {
            return Err(CoreError::Conflict(format!(
                "member {} is archived",
                member.member_no
            )));
        }
        let Some(parent_id) = member.parent_id else {
            return Err(CoreError::Conflict(format!(
                "member {} is not placed yet",
                member.member_no
            )));
        };

        // Resolve the full lineage before any mutation.
        let chain = self
            .placement
            .upline(member.id, self.plan.unilevel_levels + 1)
            .await?;
        // Cascade recipients start at the placement parent's parent.
        let cascade: Vec<Uuid> = chain.iter().skip(1).copied().collect();
        let lineage = LineageSnapshot {
            sponsor_id: member.sponsor_id,
            parent_id: member.parent_id,
            upline: cascade.clone(),
        };
        let prior_deposits = self
            .store
            .count_verified_funding(member.id)
            .await
            .map_err(CoreError::from_storage)?;

        // The swap; a concurrent verification loses here with a conflict.
        let event = self
            .store
            .mark_funding_verified(deposit_id, self.clock.now(), lineage)
            .await
            .map_err(CoreError::from_storage)?;

        self.award_commissions(&member, &event, prior_deposits, parent_id, &cascade)
            .await?;

        if let Some(entry_id) = event.ledger_entry_id {
            self.store
                .update_status(
                    entry_id,
                    EntryStatus::Pending,
                    EntryStatus::Posted,
                    BalanceEffect::NONE,
                )
                .await
                .map_err(CoreError::from_storage)?;
        }

        let member = self
            .members
            .record_funding(member.id, event.settled_minor)
            .await
            .map_err(CoreError::from_storage)?;
        self.ledger
            .post(
                member.id,
                EntryType::PackageActivation,
                event.settled_minor,
                EntryStatus::Posted,
                actor,
                json!({ "order_no": event.order_no, "package_minor": member.package_minor }),
            )
            .await?;
        self.store
            .ensure_balance(member.id)
            .await
            .map_err(CoreError::from_storage)?;

        info!(
            owner = %member.member_no,
            order = %event.order_no,
            package = member.package_minor,
            "deposit verified and activated"
        );
        self.notify_detached(
            member.id,
            "deposit_verified",
            json!({ "order_no": event.order_no, "amount_minor": event.settled_minor }),
        );
        Ok(event)
    }

    async fn award_commissions(
        &self,
        member: &Member,
        event: &FundingEvent,
        prior_deposits: u32,
        parent_id: Uuid,
        cascade: &[Uuid],
    ) -> Result<()> {
        let amount = event.settled_minor;
        if prior_deposits == 0 {
            // First verified deposit: sponsor bonus plus the cascade.
            if let Some(sponsor_id) = member.sponsor_id {
                let sponsor = self
                    .members
                    .get(sponsor_id)
                    .await
                    .map_err(CoreError::from_storage)?;
                let bonus = first_deposit_bonus(&self.plan, amount);
                if !sponsor.is_root() && bonus > 0 {
                    self.ledger
                        .post(
                            sponsor.id,
                            EntryType::Direct,
                            bonus,
                            EntryStatus::Posted,
                            SYSTEM_ACTOR,
                            json!({
                                "kind": "first_deposit",
                                "source_member": member.member_no,
                                "order_no": event.order_no,
                            }),
                        )
                        .await?;
                    self.notify_detached(
                        sponsor.id,
                        "direct_bonus",
                        json!({ "amount_minor": bonus, "source_member": member.member_no }),
                    );
                }
            }
            for award in unilevel_awards(&self.plan, amount, cascade) {
                self.ledger
                    .post(
                        award.recipient,
                        EntryType::Unilevel,
                        award.amount_minor,
                        EntryStatus::Posted,
                        SYSTEM_ACTOR,
                        json!({
                            "level": award.level,
                            "rate_bps": award.rate_bps,
                            "source_member": member.member_no,
                            "order_no": event.order_no,
                        }),
                    )
                    .await?;
            }
        } else {
            // Reinvestment: the current parent only, never the cascade again.
            let parent = self
                .members
                .get(parent_id)
                .await
                .map_err(CoreError::from_storage)?;
            let rate = reinvestment_bonus_bps(&self.plan, prior_deposits);
            let bonus = commission::apply_bps(amount, rate);
            if !parent.is_root() && bonus > 0 {
                self.ledger
                    .post(
                        parent.id,
                        EntryType::Direct,
                        bonus,
                        EntryStatus::Posted,
                        SYSTEM_ACTOR,
                        json!({
                            "kind": "reinvestment",
                            "deposit_index": prior_deposits + 1,
                            "rate_bps": rate,
                            "source_member": member.member_no,
                            "order_no": event.order_no,
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Webhook entry point for gateway-confirmed payments.
    ///
    /// An already-verified event is a safe no-op so the gateway may redeliver.
    pub async fn process_confirmed_funding(
        &self,
        order_no: &str,
        payload: &serde_json::Value,
        signature: &str,
    ) -> Result<FundingEvent> {
        if !webhook::verify_webhook_signature(&self.webhook_secret, payload, signature)? {
            return Err(CoreError::Authorization(format!(
                "webhook signature mismatch for order {order_no}"
            )));
        }
        let event = self
            .store
            .find_funding_by_order(order_no)
            .await
            .map_err(CoreError::from_storage)?
            .ok_or_else(|| CoreError::NotFound(format!("funding order {order_no}")))?;
        match event.status {
            FundingStatus::Verified => Ok(event),
            FundingStatus::Pending => self.verify_and_activate(event.id, "gateway").await,
            other => Err(CoreError::Conflict(format!(
                "funding order {order_no} is {}",
                other.as_str()
            ))),
        }
    }

    /// Reject a pending deposit: terminal funding status plus cancellation
    /// of the deposit-in-transit row.
    pub async fn reject_deposit(&self, deposit_id: Uuid, status: FundingStatus) -> Result<FundingEvent> {
        if matches!(status, FundingStatus::Pending | FundingStatus::Verified) {
            return Err(CoreError::Validation(format!(
                "{} is not a terminal failure status",
                status.as_str()
            )));
        }
        let event = self
            .store
            .mark_funding_failed(deposit_id, status)
            .await
            .map_err(CoreError::from_storage)?;
        if let Some(entry_id) = event.ledger_entry_id {
            self.store
                .update_status(
                    entry_id,
                    EntryStatus::Pending,
                    EntryStatus::Cancelled,
                    BalanceEffect::NONE,
                )
                .await
                .map_err(CoreError::from_storage)?;
        }
        Ok(event)
    }

    /// Soft-delete a childless member, sweeping any remaining balance to
    /// the root.
    pub async fn archive_member(&self, member_id: Uuid, actor: &str) -> Result<Tombstone> {
        let member = self
            .members
            .get(member_id)
            .await
            .map_err(CoreError::from_storage)?;
        if member.is_root() {
            return Err(CoreError::Validation("cannot archive the root".to_string()));
        }
        if member.archived {
            return Err(CoreError::Conflict(format!(
                "member {} is already archived",
                member.member_no
            )));
        }
        let children = self
            .members
            .count_children(member_id)
            .await
            .map_err(CoreError::from_storage)?;
        if children > 0 {
            return Err(CoreError::Conflict(format!(
                "member {} still has {children} direct children",
                member.member_no
            )));
        }

        let root = self.members.get_root().await.map_err(CoreError::from_storage)?;
        let balance = self.ledger.get_balance(member_id).await?;
        let swept = balance.available_minor;
        if swept > 0 {
            let posting = TransferPosting {
                tx_id: Uuid::new_v4(),
                sender: member_id,
                recipient: root.id,
                amount_minor: swept,
                actor: actor.to_string(),
                out_type: EntryType::FundTransferOnDelete,
                in_type: EntryType::FundTransferOnDelete,
                credit_lifetime: false,
                meta: json!({ "reason": "archive", "member_no": member.member_no }),
                created_at: self.clock.now(),
            };
            self.store
                .apply_transfer(&posting)
                .await
                .map_err(CoreError::from_storage)?;
        }

        let tombstone = Tombstone {
            member_id,
            member_no: member.member_no.clone(),
            swept_minor: swept,
            actor: actor.to_string(),
            archived_at: self.clock.now(),
        };
        self.members
            .archive(member_id, tombstone.clone())
            .await
            .map_err(CoreError::from_storage)?;
        info!(member = %member.member_no, swept, "member archived");
        Ok(tombstone)
    }

    /// Post the month's return for every active funded member, prorated by
    /// join date. Zero amounts produce no rows.
    pub async fn run_monthly_roi(&self, period: RoiPeriod) -> Result<RoiRunReport> {
        let population = self
            .members
            .list_funded()
            .await
            .map_err(CoreError::from_storage)?;
        let mut report = RoiRunReport::default();
        for member in population {
            let amount = prorated_roi(&self.plan, member.package_minor, member.joined_at, period);
            if amount == 0 {
                continue;
            }
            self.ledger
                .post(
                    member.id,
                    EntryType::Roi,
                    amount,
                    EntryStatus::Posted,
                    SYSTEM_ACTOR,
                    json!({ "year": period.year, "month": period.month }),
                )
                .await?;
            report.members_paid += 1;
            report.total_minor += amount;
        }
        info!(
            year = period.year,
            month = period.month,
            members = report.members_paid,
            total = report.total_minor,
            "monthly roi batch complete"
        );
        Ok(report)
    }
}

pub use builder::build_services;
pub use builder::Services;

mod builder {
    //! Wiring of stores, engines, and services from configuration.

    use std::time::Duration;

    use super::*;
    use crate::clock::SystemClock;
    use crate::collaborators::fx::{FixedRateProvider, HttpRateProvider, RateProvider};
    use crate::collaborators::LogNotifier;
    use crate::config::Config;
    use crate::storage::{init_storage, Stores};

    /// The assembled service graph.
    pub struct Services {
        pub stores: Stores,
        pub placement: Arc<PlacementEngine>,
        pub ledger: Arc<LedgerService>,
        pub activation: Arc<ActivationService>,
    }

    /// Build the full service graph from configuration with production
    /// collaborators.
    pub async fn build_services(config: &Config) -> Result<Services> {
        let stores = init_storage(&config.storage, &config.plan)
            .await
            .map_err(CoreError::from_storage)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let provider: Box<dyn RateProvider> = if config.fx.base_url.is_empty() {
            Box::new(FixedRateProvider::single(
                &config.fx.settlement_currency,
                1.0,
            ))
        } else {
            Box::new(HttpRateProvider::new(
                config.fx.base_url.clone(),
                config.fx.settlement_currency.clone(),
            ))
        };
        let fx = Arc::new(FxRateCache::new(
            provider,
            Duration::from_secs(config.fx.cache_ttl_secs),
        ));

        let placement = Arc::new(PlacementEngine::new(
            stores.members.clone(),
            config.plan.clone(),
            config.placement.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(LedgerService::new(
            stores.members.clone(),
            stores.ledger.clone(),
            stores.otp.clone(),
            config.otp.clone(),
            clock.clone(),
        ));
        let activation = Arc::new(ActivationService::new(
            stores.members.clone(),
            stores.ledger.clone(),
            ledger.clone(),
            placement.clone(),
            config.plan.clone(),
            config.fx.clone(),
            fx,
            Arc::new(LogNotifier),
            config.gateway.webhook_secret.clone().into_bytes(),
            clock,
        ));

        Ok(Services {
            stores,
            placement,
            ledger,
            activation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::collaborators::fx::FixedRateProvider;
    use crate::collaborators::LogNotifier;
    use crate::config::{Config, OtpConfig};
    use crate::placement::{OnboardRequest, SponsorRef};
    use crate::model::{BalanceSummary, LedgerEntry};
    use crate::storage::{
        LedgerFilter, MemoryLedgerStore, MemoryMemberStore, MemoryOtpStore,
        Result as StorageResult, Stores,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    const SECRET: &[u8] = b"dev-webhook-secret";

    struct Fixture {
        stores: Stores,
        members: Arc<MemoryMemberStore>,
        placement: Arc<PlacementEngine>,
        ledger: Arc<LedgerService>,
        activation: ActivationService,
    }

    async fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryLedgerStore::new())).await
    }

    async fn fixture_with_store(store: Arc<dyn LedgerStore>) -> Fixture {
        let config = Config::for_test();
        let members = Arc::new(MemoryMemberStore::new(config.plan.width_cap));
        members.init().await.unwrap();
        let otp = Arc::new(MemoryOtpStore::new());
        let stores = Stores {
            members: members.clone(),
            ledger: store.clone(),
            otp: otp.clone(),
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let placement = Arc::new(PlacementEngine::new(
            members.clone(),
            config.plan.clone(),
            config.placement.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(LedgerService::new(
            members.clone(),
            store.clone(),
            otp,
            OtpConfig::default(),
            clock.clone(),
        ));
        let fx = Arc::new(FxRateCache::new(
            Box::new(FixedRateProvider::single("EUR", 1.25)),
            StdDuration::from_secs(300),
        ));
        let activation = ActivationService::new(
            members.clone(),
            store,
            ledger.clone(),
            placement.clone(),
            config.plan.clone(),
            config.fx.clone(),
            fx,
            Arc::new(LogNotifier),
            SECRET.to_vec(),
            clock,
        );
        Fixture {
            stores,
            members,
            placement,
            ledger,
            activation,
        }
    }

    async fn onboard(f: &Fixture, sponsor: SponsorRef) -> Member {
        let (member, _) = f
            .placement
            .onboard(OnboardRequest {
                sponsor,
                designee: None,
            })
            .await
            .unwrap();
        member
    }

    async fn deposit_and_verify(f: &Fixture, owner: Uuid, amount: i64) -> FundingEvent {
        let event = f
            .activation
            .record_deposit(owner, amount, "USD", "admin")
            .await
            .unwrap();
        f.activation
            .verify_and_activate(event.id, "admin")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_deposit_pays_sponsor_and_cascade_once() {
        let f = fixture().await;
        // Chain: a -> b -> c -> d; d deposits.
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;
        let c = onboard(&f, SponsorRef::Id(b.id)).await;
        let d = onboard(&f, SponsorRef::Id(c.id)).await;

        deposit_and_verify(&f, d.id, 100_000).await;

        // Sponsor (= parent) c gets the 10% direct bonus.
        let c_balance = f.ledger.get_balance(c.id).await.unwrap();
        assert_eq!(c_balance.available_minor, 10_000);

        // Cascade starts at the parent's parent: b at level 1, a at level 2.
        let b_balance = f.ledger.get_balance(b.id).await.unwrap();
        assert_eq!(b_balance.available_minor, 5_000);
        let a_balance = f.ledger.get_balance(a.id).await.unwrap();
        assert_eq!(a_balance.available_minor, 4_000);

        // Depositor gained package, not spendable funds.
        let d = f.stores.members.get(d.id).await.unwrap();
        assert!(d.active);
        assert_eq!(d.package_minor, 100_000);
        assert_eq!(
            f.ledger.get_balance(d.id).await.unwrap().available_minor,
            0
        );
    }

    #[tokio::test]
    async fn double_verification_conflicts_without_double_pay() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;

        let event = f
            .activation
            .record_deposit(b.id, 50_000, "USD", "admin")
            .await
            .unwrap();
        f.activation
            .verify_and_activate(event.id, "admin")
            .await
            .unwrap();
        let err = f
            .activation
            .verify_and_activate(event.id, "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let a_balance = f.ledger.get_balance(a.id).await.unwrap();
        assert_eq!(a_balance.available_minor, 5_000);
    }

    #[tokio::test]
    async fn reinvestment_pays_parent_only_at_schedule_rate() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;
        let c = onboard(&f, SponsorRef::Id(b.id)).await;

        deposit_and_verify(&f, c.id, 100_000).await;
        let b_after_first = f.ledger.get_balance(b.id).await.unwrap().available_minor;
        let a_after_first = f.ledger.get_balance(a.id).await.unwrap().available_minor;

        // Second deposit: 8% to parent b, nothing new for a.
        deposit_and_verify(&f, c.id, 100_000).await;
        let b_balance = f.ledger.get_balance(b.id).await.unwrap();
        assert_eq!(b_balance.available_minor, b_after_first + 8_000);
        let a_balance = f.ledger.get_balance(a.id).await.unwrap();
        assert_eq!(a_balance.available_minor, a_after_first);

        // Third deposit steps down the schedule to 7%.
        deposit_and_verify(&f, c.id, 100_000).await;
        let b_balance = f.ledger.get_balance(b.id).await.unwrap();
        assert_eq!(b_balance.available_minor, b_after_first + 8_000 + 7_000);

        let c_member = f.stores.members.get(c.id).await.unwrap();
        assert_eq!(c_member.package_minor, 300_000);
    }

    /// Ledger store that widens the gap between the prior-deposit count and
    /// the verification swap, so an unserialized race is caught reliably.
    struct SlowCountStore {
        inner: MemoryLedgerStore,
    }

    #[async_trait::async_trait]
    impl LedgerStore for SlowCountStore {
        async fn init(&self) -> StorageResult<()> {
            self.inner.init().await
        }

        async fn append(&self, entry: &LedgerEntry, effect: BalanceEffect) -> StorageResult<()> {
            self.inner.append(entry, effect).await
        }

        async fn update_status(
            &self,
            id: Uuid,
            expected: EntryStatus,
            next: EntryStatus,
            effect: BalanceEffect,
        ) -> StorageResult<LedgerEntry> {
            self.inner.update_status(id, expected, next, effect).await
        }

        async fn get_entry(&self, id: Uuid) -> StorageResult<LedgerEntry> {
            self.inner.get_entry(id).await
        }

        async fn list_for_owner(
            &self,
            owner: Uuid,
            filter: &LedgerFilter,
        ) -> StorageResult<Vec<LedgerEntry>> {
            self.inner.list_for_owner(owner, filter).await
        }

        async fn balance(&self, owner: Uuid) -> StorageResult<Option<BalanceSummary>> {
            self.inner.balance(owner).await
        }

        async fn ensure_balance(&self, owner: Uuid) -> StorageResult<BalanceSummary> {
            self.inner.ensure_balance(owner).await
        }

        async fn apply_transfer(
            &self,
            posting: &TransferPosting,
        ) -> StorageResult<(LedgerEntry, LedgerEntry)> {
            self.inner.apply_transfer(posting).await
        }

        async fn insert_funding(&self, event: &FundingEvent) -> StorageResult<()> {
            self.inner.insert_funding(event).await
        }

        async fn get_funding(&self, id: Uuid) -> StorageResult<FundingEvent> {
            self.inner.get_funding(id).await
        }

        async fn find_funding_by_order(&self, order_no: &str) -> StorageResult<Option<FundingEvent>> {
            self.inner.find_funding_by_order(order_no).await
        }

        async fn mark_funding_verified(
            &self,
            id: Uuid,
            at: DateTime<Utc>,
            lineage: LineageSnapshot,
        ) -> StorageResult<FundingEvent> {
            self.inner.mark_funding_verified(id, at, lineage).await
        }

        async fn mark_funding_failed(
            &self,
            id: Uuid,
            status: FundingStatus,
        ) -> StorageResult<FundingEvent> {
            self.inner.mark_funding_failed(id, status).await
        }

        async fn count_verified_funding(&self, owner: Uuid) -> StorageResult<u32> {
            let count = self.inner.count_verified_funding(owner).await;
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            count
        }
    }

    #[tokio::test]
    async fn concurrent_deposit_verifications_classify_one_first_deposit() {
        let f = fixture_with_store(Arc::new(SlowCountStore {
            inner: MemoryLedgerStore::new(),
        }))
        .await;
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;
        let c = onboard(&f, SponsorRef::Id(b.id)).await;

        let first = f
            .activation
            .record_deposit(c.id, 100_000, "USD", "admin")
            .await
            .unwrap();
        let second = f
            .activation
            .record_deposit(c.id, 100_000, "USD", "admin")
            .await
            .unwrap();

        let Fixture {
            ledger, activation, ..
        } = f;
        let activation = Arc::new(activation);
        let one = tokio::spawn({
            let activation = activation.clone();
            async move { activation.verify_and_activate(first.id, "admin").await }
        });
        let two = tokio::spawn({
            let activation = activation.clone();
            async move { activation.verify_and_activate(second.id, "admin").await }
        });
        one.await.unwrap().unwrap();
        two.await.unwrap().unwrap();

        // One deposit was the first, the other a reinvestment: b holds one
        // direct bonus of each kind and a sees the cascade exactly once.
        let b_entries = ledger
            .list_ledger(b.id, &LedgerFilter::default())
            .await
            .unwrap();
        let first_bonuses = b_entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Direct && e.meta["kind"] == "first_deposit")
            .count();
        assert_eq!(first_bonuses, 1);
        let reinvestments = b_entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Direct && e.meta["kind"] == "reinvestment")
            .count();
        assert_eq!(reinvestments, 1);
        let cascade_rows = ledger
            .list_ledger(a.id, &LedgerFilter::default())
            .await
            .unwrap()
            .iter()
            .filter(|e| e.entry_type == EntryType::Unilevel)
            .count();
        assert_eq!(cascade_rows, 1);
        assert_eq!(
            ledger.get_balance(b.id).await.unwrap().available_minor,
            18_000
        );
    }

    #[tokio::test]
    async fn split_placement_routes_direct_to_sponsor_and_cascade_up_the_tree() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let s = onboard(&f, SponsorRef::Id(a.id)).await;
        let designee = onboard(&f, SponsorRef::Id(s.id)).await;
        for _ in 0..5 {
            onboard(&f, SponsorRef::Id(s.id)).await;
        }

        // s's direct line is full; the new member lands under the designee
        // but keeps s as the original sponsor.
        let (member, placement) = f
            .placement
            .onboard(OnboardRequest {
                sponsor: SponsorRef::Id(s.id),
                designee: Some(designee.id),
            })
            .await
            .unwrap();
        assert!(placement.is_split_sponsor);
        assert_eq!(placement.parent, designee.id);
        assert_eq!(member.sponsor_id, Some(s.id));

        deposit_and_verify(&f, member.id, 100_000).await;

        // Direct bonus follows the sponsor, not the tree parent.
        let s_entries = f
            .ledger
            .list_ledger(s.id, &LedgerFilter::default())
            .await
            .unwrap();
        let direct: i64 = s_entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Direct)
            .map(|e| e.amount_minor)
            .sum();
        assert_eq!(direct, 10_000);

        // The cascade climbs the placement chain from the designee's parent:
        // s at level 1, a at level 2. The designee earns nothing.
        let unilevel: i64 = s_entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Unilevel)
            .map(|e| e.amount_minor)
            .sum();
        assert_eq!(unilevel, 5_000);
        assert_eq!(
            f.ledger.get_balance(a.id).await.unwrap().available_minor,
            4_000
        );
        assert_eq!(
            f.ledger
                .get_balance(designee.id)
                .await
                .unwrap()
                .available_minor,
            0
        );
    }

    #[tokio::test]
    async fn foreign_deposit_settles_at_the_cached_rate() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let event = f
            .activation
            .record_deposit(a.id, 80_000, "EUR", "admin")
            .await
            .unwrap();
        assert_eq!(event.settled_minor, 100_000);
        assert_eq!(event.source_amount_minor, 80_000);
        assert_eq!(event.source_currency, "EUR");
    }

    #[tokio::test]
    async fn webhook_confirms_once_and_redelivers_safely() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;
        let event = f
            .activation
            .record_deposit(b.id, 50_000, "USD", "gateway")
            .await
            .unwrap();

        let payload = json!({ "order_no": event.order_no, "amount": 50_000 });
        let signature = webhook::sign_payload(SECRET, &payload).unwrap();

        let confirmed = f
            .activation
            .process_confirmed_funding(&event.order_no, &payload, &signature)
            .await
            .unwrap();
        assert_eq!(confirmed.status, FundingStatus::Verified);

        // Redelivery is a no-op, not an error, and pays nothing twice.
        let again = f
            .activation
            .process_confirmed_funding(&event.order_no, &payload, &signature)
            .await
            .unwrap();
        assert_eq!(again.status, FundingStatus::Verified);
        assert_eq!(
            f.ledger.get_balance(a.id).await.unwrap().available_minor,
            5_000
        );
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_refused() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let event = f
            .activation
            .record_deposit(a.id, 50_000, "USD", "gateway")
            .await
            .unwrap();

        let payload = json!({ "order_no": event.order_no });
        let err = f
            .activation
            .process_confirmed_funding(&event.order_no, &payload, "deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));

        let stored = f.stores.ledger.get_funding(event.id).await.unwrap();
        assert_eq!(stored.status, FundingStatus::Pending);
    }

    #[tokio::test]
    async fn rejected_deposit_cancels_the_transit_row() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let event = f
            .activation
            .record_deposit(a.id, 50_000, "USD", "admin")
            .await
            .unwrap();

        let rejected = f
            .activation
            .reject_deposit(event.id, FundingStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rejected.status, FundingStatus::Rejected);

        let entry = f
            .stores
            .ledger
            .get_entry(event.ledger_entry_id.unwrap())
            .await
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Cancelled);

        // A rejected deposit can no longer be verified.
        let err = f
            .activation
            .verify_and_activate(event.id, "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn archive_sweeps_funds_to_root_and_blocks_on_children() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        let b = onboard(&f, SponsorRef::Id(a.id)).await;

        deposit_and_verify(&f, b.id, 100_000).await;
        // a now holds the 10% direct bonus.
        let err = f.activation.archive_member(a.id, "admin").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let root = f.stores.members.get_root().await.unwrap();
        let tombstone = f.activation.archive_member(b.id, "admin").await.unwrap();
        assert_eq!(tombstone.swept_minor, 0);

        // Archive a: its bonus balance sweeps to the root.
        // First detach by archiving the child (done above), then archive.
        let tombstone = f.activation.archive_member(a.id, "admin").await.unwrap();
        assert_eq!(tombstone.swept_minor, 10_000);
        let root_balance = f.ledger.get_balance(root.id).await.unwrap();
        assert_eq!(root_balance.available_minor, 10_000);
        // Sweeps are not earnings.
        assert_eq!(root_balance.lifetime_minor, 0);

        let archived = f.stores.members.get(a.id).await.unwrap();
        assert!(archived.archived);
    }

    #[tokio::test]
    async fn monthly_roi_prorates_by_join_day() {
        let f = fixture().await;
        let a = onboard(&f, SponsorRef::Root).await;
        deposit_and_verify(&f, a.id, 120_000).await;

        // Pin the join date to the reference example: day 21 of September.
        let joined = Utc.with_ymd_and_hms(2025, 9, 21, 8, 0, 0).unwrap();
        f.members.set_joined_at(a.id, joined).await.unwrap();

        let report = f
            .activation
            .run_monthly_roi(RoiPeriod {
                year: 2025,
                month: 9,
            })
            .await
            .unwrap();
        assert_eq!(report.members_paid, 1);
        assert_eq!(report.total_minor, 4_000);

        // The next full month pays the whole 10%.
        let report = f
            .activation
            .run_monthly_roi(RoiPeriod {
                year: 2025,
                month: 10,
            })
            .await
            .unwrap();
        assert_eq!(report.total_minor, 12_000);
    }

    #[tokio::test]
    async fn roi_skips_unfunded_members() {
        let f = fixture().await;
        onboard(&f, SponsorRef::Root).await;

        let report = f
            .activation
            .run_monthly_roi(RoiPeriod {
                year: 2025,
                month: 9,
            })
            .await
            .unwrap();
        assert_eq!(report.members_paid, 0);
        assert_eq!(report.total_minor, 0);
    }
}
