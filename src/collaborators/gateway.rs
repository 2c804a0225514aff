//! Payment gateway seam.
//!
//! The gateway confirms deposits asynchronously through the signed webhook;
//! the outbound side only creates invoices.

use async_trait::async_trait;

use crate::errors::Result;

/// An invoice handed to the external payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInvoice {
    pub order_no: String,
    /// Where the payer is sent to complete the payment.
    pub payment_url: String,
}

/// Outbound payment operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Register a payment of `amount_minor` in `currency` under `order_no`.
    async fn external_payment_invoice(
        &self,
        amount_minor: i64,
        currency: &str,
        order_no: &str,
    ) -> Result<PaymentInvoice>;
}
