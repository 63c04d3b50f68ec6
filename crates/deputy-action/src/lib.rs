//! Managed-action engine for Deputy.
//!
//! Holds requested actions in a cancellable pending state until their undo
//! deadline, executes them through pluggable delivery clients, and records
//! every state transition in a hash-chained audit log. Policies can submit
//! actions autonomously, gated by the account's trust level and the
//! emergency pause switch.

pub mod audit;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod pause;
pub mod policy;
pub mod store;
pub mod trust;

pub use audit::{AuditLog, TrailVerification};
pub use deadline::{DeadlineManager, DispatchQueue};
pub use engine::Engine;
pub use error::{ActionError, DeliveryError, PolicyError, TransitionError, TrustError};
pub use executor::{ExecutionResult, Executor};
pub use handler::{DeliveryClient, DeliveryReceipt, DeliveryRegistry, DryRunDelivery};
pub use pause::PauseSwitch;
pub use policy::{NewPolicy, PolicyEngine, PolicyMatch};
pub use store::{ActionStore, SubmitRequest};
pub use trust::{Confirmation, Eligibility, TrustGate, TrustStatus};
