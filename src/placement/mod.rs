//! Placement engine: sponsor resolution and width-capped tree insertion.
//!
//! Placement under one parent is serialized through a per-parent lock so two
//! concurrent requests cannot both pass the child-count check; the store
//! re-checks the cap inside its insert transaction as the backstop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{PlacementConfig, PlanConfig};
use crate::errors::{CoreError, Result};
use crate::model::{Member, NewMember, Placement};
use crate::storage::MemberStore;

/// How a caller names the requested sponsor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SponsorRef {
    /// Absent or empty: the reserved root.
    Root,
    Id(Uuid),
    /// Public referral code.
    Code(String),
}

impl SponsorRef {
    /// Empty input resolves to the root; anything else is an id when it
    /// parses as one, otherwise a referral code.
    pub fn from_opt(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => SponsorRef::Root,
            Some(s) => match Uuid::parse_str(s) {
                Ok(id) => SponsorRef::Id(id),
                Err(_) => SponsorRef::Code(s.to_string()),
            },
        }
    }
}

/// Request to onboard a member with immediate placement.
#[derive(Debug, Clone)]
pub struct OnboardRequest {
    pub sponsor: SponsorRef,
    /// Required when the sponsor's direct line is full, forbidden otherwise.
    pub designee: Option<Uuid>,
}

/// Decides tree parents for new and queued members.
pub struct PlacementEngine {
    members: Arc<dyn MemberStore>,
    plan: PlanConfig,
    config: PlacementConfig,
    clock: Arc<dyn Clock>,
    parent_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PlacementEngine {
    pub fn new(
        members: Arc<dyn MemberStore>,
        plan: PlanConfig,
        config: PlacementConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            members,
            plan,
            config,
            clock,
            parent_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn parent_lock(&self, parent: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.parent_locks.lock().await;
        // A strong count of 1 means only the registry holds the lock;
        // prune those so the map stays bounded by live contention.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(parent).or_default().clone()
    }

    /// Resolve a sponsor reference. Empty resolves to the root; a non-empty
    /// reference that matches nothing is the caller's error.
    pub async fn resolve_sponsor(&self, sponsor: &SponsorRef) -> Result<Member> {
        match sponsor {
            SponsorRef::Root => self.members.get_root().await.map_err(CoreError::from_storage),
            SponsorRef::Id(id) => self.members.get(*id).await.map_err(CoreError::from_storage),
            SponsorRef::Code(code) => self
                .members
                .find_by_referral(code)
                .await
                .map_err(CoreError::from_storage)?
                .ok_or_else(|| CoreError::NotFound(format!("sponsor {code}"))),
        }
    }

    async fn new_member_fields(&self) -> Result<(Uuid, String, String)> {
        let id = Uuid::new_v4();
        let seq = self
            .members
            .next_member_no()
            .await
            .map_err(CoreError::from_storage)?;
        let referral_code = id.simple().to_string()[..8].to_string();
        Ok((id, format!("M-{seq}"), referral_code))
    }

    /// Onboard a member with immediate placement.
    ///
    /// Sponsor resolution, the cap decision, and designee validity are all
    /// evaluated before any write; a failure leaves no partial state.
    pub async fn onboard(&self, request: OnboardRequest) -> Result<(Member, Placement)> {
        let sponsor = self.resolve_sponsor(&request.sponsor).await?;
        if sponsor.archived {
            return Err(CoreError::Conflict(format!(
                "sponsor {} is archived",
                sponsor.member_no
            )));
        }

        // Root parents are cap-exempt; no lock or designee logic applies.
        if sponsor.is_root() {
            if request.designee.is_some() {
                return Err(CoreError::Validation(
                    "designee must not be supplied when the sponsor has a free slot".to_string(),
                ));
            }
            let placement = Placement {
                original_sponsor: sponsor.id,
                parent: sponsor.id,
                is_split_sponsor: false,
            };
            let member = self.insert_placed(&placement).await?;
            return Ok((member, placement));
        }

        let sponsor_lock = self.parent_lock(sponsor.id).await;
        let _sponsor_guard = sponsor_lock.lock().await;

        let child_count = self
            .members
            .count_children(sponsor.id)
            .await
            .map_err(CoreError::from_storage)?;

        let placement = if child_count < self.plan.width_cap {
            if request.designee.is_some() {
                return Err(CoreError::Validation(
                    "designee must not be supplied when the sponsor has a free slot".to_string(),
                ));
            }
            Placement {
                original_sponsor: sponsor.id,
                parent: sponsor.id,
                is_split_sponsor: false,
            }
        } else {
            let designee_id = request.designee.ok_or_else(|| {
                CoreError::Validation(format!(
                    "sponsor {} direct line is full: designee required",
                    sponsor.member_no
                ))
            })?;
            let designee = self
                .members
                .get(designee_id)
                .await
                .map_err(CoreError::from_storage)?;
            if designee.parent_id != Some(sponsor.id) {
                return Err(CoreError::Validation(format!(
                    "designee {} is not a direct child of sponsor {}",
                    designee.member_no, sponsor.member_no
                )));
            }

            // Designees are strictly children of the already-held sponsor
            // lock, so this two-level acquisition cannot cycle.
            let designee_lock = self.parent_lock(designee.id).await;
            let _designee_guard = designee_lock.lock().await;

            let designee_children = self
                .members
                .count_children(designee.id)
                .await
                .map_err(CoreError::from_storage)?;
            if designee_children >= self.plan.width_cap {
                return Err(CoreError::Conflict(format!(
                    "designee {} direct line is full",
                    designee.member_no
                )));
            }

            let placement = Placement {
                original_sponsor: sponsor.id,
                parent: designee.id,
                is_split_sponsor: true,
            };
            let member = self.insert_placed(&placement).await?;
            return Ok((member, placement));
        };

        let member = self.insert_placed(&placement).await?;
        Ok((member, placement))
    }

    async fn insert_placed(&self, placement: &Placement) -> Result<Member> {
        let (id, member_no, referral_code) = self.new_member_fields().await?;
        let member = self
            .members
            .insert(NewMember {
                id,
                member_no: member_no.clone(),
                referral_code,
                sponsor_id: Some(placement.original_sponsor),
                parent_id: Some(placement.parent),
                is_split_sponsor: placement.is_split_sponsor,
                joined_at: self.clock.now(),
                placement_deadline: None,
            })
            .await
            .map_err(CoreError::from_storage)?;
        info!(
            member = %member_no,
            parent = %placement.parent,
            split = placement.is_split_sponsor,
            "member placed"
        );
        Ok(member)
    }

    /// Create a member without a tree position, waiting for the sponsor to
    /// place them before the deadline.
    pub async fn enqueue(&self, sponsor: SponsorRef) -> Result<Member> {
        let sponsor = self.resolve_sponsor(&sponsor).await?;
        if sponsor.is_root() {
            return Err(CoreError::Validation(
                "deferred placement requires a real sponsor".to_string(),
            ));
        }
        let (id, member_no, referral_code) = self.new_member_fields().await?;
        let deadline = self.clock.now() + Duration::hours(self.config.queue_deadline_hours);
        let member = self
            .members
            .insert(NewMember {
                id,
                member_no: member_no.clone(),
                referral_code,
                sponsor_id: Some(sponsor.id),
                parent_id: None,
                is_split_sponsor: false,
                joined_at: self.clock.now(),
                placement_deadline: Some(deadline),
            })
            .await
            .map_err(CoreError::from_storage)?;
        info!(member = %member_no, deadline = %deadline, "member queued for placement");
        Ok(member)
    }

    /// Sponsor places a queued member under themselves or one of their
    /// direct children. Past the deadline the queue entry stays blocked
    /// until an admin extends it.
    pub async fn place_queued(
        &self,
        sponsor_id: Uuid,
        member_id: Uuid,
        target_id: Uuid,
    ) -> Result<Member> {
        let member = self
            .members
            .get(member_id)
            .await
            .map_err(CoreError::from_storage)?;
        if member.parent_id.is_some() {
            return Err(CoreError::Conflict(format!(
                "member {} is already placed",
                member.member_no
            )));
        }
        if member.sponsor_id != Some(sponsor_id) {
            return Err(CoreError::Authorization(
                "only the original sponsor may place a queued member".to_string(),
            ));
        }
        match member.placement_deadline {
            Some(deadline) if self.clock.now() <= deadline => {}
            Some(_) => {
                return Err(CoreError::Conflict(format!(
                    "placement deadline for {} has passed",
                    member.member_no
                )));
            }
            None => {
                return Err(CoreError::Conflict(format!(
                    "member {} has no placement deadline",
                    member.member_no
                )));
            }
        }

        let target = self
            .members
            .get(target_id)
            .await
            .map_err(CoreError::from_storage)?;
        let is_self = target.id == sponsor_id;
        if !is_self && target.parent_id != Some(sponsor_id) {
            return Err(CoreError::Validation(format!(
                "target {} is neither the sponsor nor one of their direct children",
                target.member_no
            )));
        }

        let lock = self.parent_lock(target.id).await;
        let _guard = lock.lock().await;

        let placed = self
            .members
            .assign_parent(member_id, target.id, !is_self)
            .await
            .map_err(CoreError::from_storage)?;
        info!(member = %placed.member_no, parent = %target.member_no, "queued member placed");
        Ok(placed)
    }

    /// Admin relief for an expired queue entry: push the deadline out
    /// rather than auto-placing.
    pub async fn extend_deadline(
        &self,
        member_id: Uuid,
        new_deadline: DateTime<Utc>,
    ) -> Result<()> {
        let member = self
            .members
            .get(member_id)
            .await
            .map_err(CoreError::from_storage)?;
        if member.parent_id.is_some() {
            return Err(CoreError::Conflict(format!(
                "member {} is already placed",
                member.member_no
            )));
        }
        self.members
            .set_placement_deadline(member_id, new_deadline)
            .await
            .map_err(CoreError::from_storage)
    }

    /// Strict ancestors of `start`, nearest first, up to `levels`, stopping
    /// before the root. The cascading bonus walks this from the placement
    /// parent's parent.
    pub async fn upline(&self, start: Uuid, levels: usize) -> Result<Vec<Uuid>> {
        let mut ancestors = Vec::with_capacity(levels);
        let mut current = self
            .members
            .get(start)
            .await
            .map_err(CoreError::from_storage)?;
        while ancestors.len() < levels {
            let Some(parent_id) = current.parent_id else {
                break;
            };
            let parent = self
                .members
                .get(parent_id)
                .await
                .map_err(CoreError::from_storage)?;
            if parent.is_root() {
                break;
            }
            ancestors.push(parent.id);
            current = parent;
        }
        Ok(ancestors)
    }
}
