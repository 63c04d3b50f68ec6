//! Deputy Storage crate - SQLite persistence for the managed-action engine.
//!
//! Provides a WAL-mode SQLite database with migrations and repositories for
//! actions, the hash-chained audit log, trust levels, policies, and pause
//! switches. State transitions and their audit records are written in a
//! single transaction by [`ActionRepository::transition`].

pub mod actions;
pub mod audit;
pub mod db;
pub mod migrations;
pub mod pause;
pub mod policies;
pub mod trust;

pub use actions::{ActionFilter, ActionRepository, TransitionRequest};
pub use audit::{AuditQuery, AuditRepository};
pub use db::Database;
pub use pause::PauseRepository;
pub use policies::PolicyRepository;
pub use trust::{TrustChange, TrustRepository};
