//! Delivery client trait and registry.
//!
//! A delivery client performs the external side effect of an action
//! (sending mail, moving a message, writing a calendar entry). The
//! executor looks clients up by action type, falling back to a default
//! client when one is configured.

pub mod dry_run;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use deputy_core::payload::ActionPayload;
use deputy_core::types::ActionType;

use crate::error::DeliveryError;
pub use dry_run::DryRunDelivery;

/// Provider acknowledgement of a delivered action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider-side identifier of the effect, e.g. a message or event id.
    pub reference: String,
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the side effect. Called at most once per action.
    async fn deliver(&self, payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError>;
}

#[derive(Default, Clone)]
pub struct DeliveryRegistry {
    clients: HashMap<ActionType, Arc<dyn DeliveryClient>>,
    fallback: Option<Arc<dyn DeliveryClient>>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: ActionType, client: Arc<dyn DeliveryClient>) {
        self.clients.insert(action_type, client);
    }

    /// Client used for any action type without a dedicated one.
    pub fn with_fallback(mut self, client: Arc<dyn DeliveryClient>) -> Self {
        self.fallback = Some(client);
        self
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn DeliveryClient>> {
        self.clients
            .get(&action_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub async fn deliver(&self, payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
        let action_type = payload.action_type();
        let client = self
            .get(action_type)
            .ok_or(DeliveryError::Unsupported(action_type))?;
        client.deliver(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl DeliveryClient for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn deliver(&self, _payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
            Ok(DeliveryReceipt {
                reference: self.0.to_string(),
            })
        }
    }

    fn archive() -> ActionPayload {
        ActionPayload::ArchiveMessage {
            message_id: "m-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_unsupported() {
        let registry = DeliveryRegistry::new();
        assert_eq!(
            registry.deliver(&archive()).await,
            Err(DeliveryError::Unsupported(ActionType::ArchiveMessage))
        );
    }

    #[tokio::test]
    async fn test_dedicated_client_wins_over_fallback() {
        let mut registry = DeliveryRegistry::new().with_fallback(Arc::new(Fixed("fallback")));
        registry.register(ActionType::ArchiveMessage, Arc::new(Fixed("mail")));

        assert_eq!(registry.deliver(&archive()).await.unwrap().reference, "mail");
        let label = ActionPayload::LabelMessage {
            message_id: "m-1".to_string(),
            label: "receipts".to_string(),
        };
        assert_eq!(registry.deliver(&label).await.unwrap().reference, "fallback");
    }
}
