//! Delivery client that only logs.
//!
//! Used when no provider integration is configured, so the full lifecycle
//! can run end to end without touching any mailbox or calendar.

use async_trait::async_trait;
use uuid::Uuid;

use deputy_core::payload::ActionPayload;

use crate::error::DeliveryError;
use crate::handler::{DeliveryClient, DeliveryReceipt};

pub struct DryRunDelivery;

#[async_trait]
impl DeliveryClient for DryRunDelivery {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn deliver(&self, payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
        let reference = format!("dry-run-{}", Uuid::new_v4());
        tracing::info!(
            action_type = %payload.action_type(),
            target = ?payload.target(),
            digest = %payload.digest(),
            reference = %reference,
            "Dry-run delivery"
        );
        Ok(DeliveryReceipt { reference })
    }
}
