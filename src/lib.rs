// src/lib.rs

//! On-demand module delivery
//!
//! Installs optional application modules at runtime through an external
//! delivery backend and tracks each install as a session that subscribers
//! can follow from request to installed (or failed, or canceled).
//!
//! # Architecture
//!
//! - Controller-driven: one `DeliveryController` owns every session
//! - Backend-agnostic: the backend is injected as a `DeliveryBackend`
//! - Push-based: state changes are broadcast as immutable snapshots
//! - Idempotent requests: at most one backend install per module in flight

pub mod config;
pub mod delivery;
mod error;

pub use config::DeliveryConfig;
pub use delivery::{
    Action, BackendStatus, ConfirmationHandle, DeliveryBackend, DeliveryController,
    DeliverySession, MetricsSnapshot, ModuleId, SessionEvent, SessionHandle, SessionState,
    SessionSubscription, SimulatedBackend, StatusUpdate,
};
pub use error::{Error, ErrorKind, Result};
