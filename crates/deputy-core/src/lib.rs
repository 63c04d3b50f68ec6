pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod payload;
pub mod policy;
pub mod trust;
pub mod types;

pub use audit::AuditRecord;
pub use config::DeputyConfig;
pub use error::{DeputyError, Result};
pub use events::EngineEvent;
pub use payload::{ActionPayload, ItemKind};
pub use policy::{ActionTemplate, Condition, Policy, TriggerEvent, TriggerKind};
pub use trust::{TrustLevel, TrustState};
pub use types::*;
