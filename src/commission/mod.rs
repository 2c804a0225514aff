//! Commission math.
//!
//! Pure functions over already-fetched state: no I/O, no clock reads. All
//! amounts are minor currency units; all rates are basis points. Amounts
//! that round to zero are dropped by the callers so the ledger never holds
//! zero-amount rows.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use uuid::Uuid;

use crate::config::PlanConfig;

/// Apply a basis-point rate, truncating toward zero.
pub fn apply_bps(amount_minor: i64, bps: u32) -> i64 {
    amount_minor.saturating_mul(bps as i64) / 10_000
}

/// Monthly ROI rate for a package value: a step function over the plan's
/// breakpoints. Packages below the lowest breakpoint earn nothing.
pub fn tiered_roi_rate_bps(plan: &PlanConfig, package_minor: i64) -> u32 {
    let mut rate = 0;
    for tier in &plan.roi_tiers {
        if package_minor >= tier.min_package_minor {
            rate = tier.monthly_rate_bps;
        } else {
            break;
        }
    }
    rate
}

/// First-deposit bonus, paid to the original sponsor.
pub fn first_deposit_bonus(plan: &PlanConfig, amount_minor: i64) -> i64 {
    apply_bps(amount_minor, plan.first_deposit_bonus_bps)
}

/// Reinvestment bonus rate for the n-th reinvestment deposit
/// (`prior_verified_deposits` >= 1). The schedule decreases for deposits
/// 1..=5 and flattens to the floor from 6 on.
pub fn reinvestment_bonus_bps(plan: &PlanConfig, prior_verified_deposits: u32) -> u32 {
    debug_assert!(prior_verified_deposits >= 1);
    plan.reinvestment_bps
        .get(prior_verified_deposits as usize - 1)
        .copied()
        .unwrap_or(plan.reinvestment_floor_bps)
}

/// One cascading-bonus payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnilevelAward {
    pub recipient: Uuid,
    /// 1-based level above the placement parent's parent.
    pub level: u32,
    pub rate_bps: u32,
    pub amount_minor: i64,
}

/// Cascading bonus for a first verified deposit.
///
/// `upline` is the ancestor chain starting at the placement parent's parent,
/// nearest first, already truncated at the root. Zero-rate tiers and amounts
/// that truncate to zero produce no award.
pub fn unilevel_awards(
    plan: &PlanConfig,
    amount_minor: i64,
    upline: &[Uuid],
) -> Vec<UnilevelAward> {
    upline
        .iter()
        .take(plan.unilevel_levels)
        .enumerate()
        .filter_map(|(i, recipient)| {
            let rate_bps = plan.unilevel_bps.get(i).copied().unwrap_or(0);
            if rate_bps == 0 {
                return None;
            }
            let amount = apply_bps(amount_minor, rate_bps);
            if amount == 0 {
                return None;
            }
            Some(UnilevelAward {
                recipient: *recipient,
                level: i as u32 + 1,
                rate_bps,
                amount_minor: amount,
            })
        })
        .collect()
}

/// A calendar month the ROI batch runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiPeriod {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl RoiPeriod {
    /// Days in the month; 0 for a period that is not a calendar month.
    pub fn days(&self) -> u32 {
        let first = NaiveDate::from_ymd_opt(self.year, self.month, 1);
        let next = if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        };
        match (first, next) {
            (Some(first), Some(next)) => (next - first).num_days() as u32,
            _ => 0,
        }
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at.year() == self.year && at.month() == self.month
    }

    fn is_before(&self, at: DateTime<Utc>) -> bool {
        (at.year(), at.month()) < (self.year, self.month)
    }
}

/// Periodic return for one member over one period, prorated by days active.
///
/// A member who joined mid-period earns `days_active / days_in_period` of
/// the full monthly return, join day inclusive. Members who joined after the
/// period earn nothing; members who joined before it earn the full amount.
pub fn prorated_roi(
    plan: &PlanConfig,
    package_minor: i64,
    joined_at: DateTime<Utc>,
    period: RoiPeriod,
) -> i64 {
    let rate_bps = tiered_roi_rate_bps(plan, package_minor);
    if rate_bps == 0 {
        return 0;
    }
    let full = apply_bps(package_minor, rate_bps);

    if period.is_before(joined_at) {
        return full;
    }
    if !period.contains(joined_at) {
        return 0;
    }

    let total_days = period.days() as i64;
    if total_days == 0 {
        return 0;
    }
    let days_active = total_days - joined_at.day() as i64 + 1;
    full * days_active / total_days
}
