//! Referral-network core: placement, commissions, ledger, and activation.
//!
//! The crate is organized around four services over shared storage traits:
//!
//! - [`placement`]: width-capped tree insertion and the deferred queue.
//! - [`commission`]: pure bonus and ROI math driven by [`config::PlanConfig`].
//! - [`ledger`]: append-only money movements, balances, and OTP-gated
//!   transfers.
//! - [`activation`]: deposit verification, commission fan-out, archival, and
//!   the monthly ROI batch.
//!
//! Storage is behind traits in [`storage`], with an in-memory backend for
//! tests and a SQLite backend (feature `sqlite`) for durable runs.

pub mod activation;
pub mod clock;
pub mod collaborators;
pub mod commission;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod model;
pub mod placement;
pub mod storage;
pub mod telemetry;

pub use errors::{CoreError, Result};
