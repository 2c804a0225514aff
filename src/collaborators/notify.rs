//! Best-effort member notifications.
//!
//! Activation and placement emit notifications after their own state has
//! committed; a notifier failure is logged and never propagated.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;

/// Delivery seam for member-facing messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, member: Uuid, template: &str, payload: serde_json::Value) -> Result<()>;
}

/// Notifier that only writes to the log. Stands in for mail or push
/// delivery in tests and standalone runs.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, member: Uuid, template: &str, payload: serde_json::Value) -> Result<()> {
        info!(member = %member, template, %payload, "notification");
        Ok(())
    }
}
