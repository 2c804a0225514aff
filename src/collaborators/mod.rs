//! External collaborator seams: FX rates, notifications, payment gateway,
//! and webhook signatures.
//!
//! Services depend on the traits; production wiring injects the HTTP-backed
//! implementations and tests inject fixed ones.

pub mod fx;
pub mod gateway;
pub mod notify;
pub mod webhook;

pub use fx::{FixedRateProvider, FxRateCache, HttpRateProvider, RateProvider};
pub use gateway::PaymentGateway;
pub use notify::{LogNotifier, Notifier};
