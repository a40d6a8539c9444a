//! Ridepass Core Business Logic
//!
//! This crate orchestrates the credential primitives and token ledgers into
//! the account flows, and runs the background purge of expired tokens.

pub mod audit;
pub mod cleanup;
pub mod error;
pub mod service;

pub use audit::{AuditEvent, redact_ip, truncate_user_agent};
pub use cleanup::{CleanupSweeper, SweepReport};
pub use error::CoreError;
pub use service::{AuthPolicy, AuthService, Registration, Session};
