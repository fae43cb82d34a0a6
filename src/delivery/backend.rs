// src/delivery/backend.rs

//! Delivery backend adapter
//!
//! The backend performs the actual download and installation. The
//! controller only talks to it through this trait and learns about progress
//! through the listener it registers. Timeouts, retries and transport live
//! in the adapter.

use super::{ConfirmationHandle, ModuleId, SessionHandle, StatusUpdate};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Callback the backend invokes for every session status change
///
/// Called from the backend's own execution context. Implementations behind
/// it return quickly and never block on consumers.
pub type StatusListener = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Interface to the external delivery service
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    /// Request installation of a module
    ///
    /// Resolves once the backend accepted the request. Progress arrives
    /// later through the status listener.
    async fn start_install(&self, module_id: &ModuleId) -> Result<SessionHandle>;

    /// Schedule removal of installed modules
    ///
    /// Resolves with the backend's acknowledgement. Removal itself may
    /// happen later.
    async fn deferred_uninstall(&self, module_ids: &[ModuleId]) -> Result<()>;

    /// Forward the caller's decision on a confirmation gate
    async fn resolve_user_confirmation(
        &self,
        handle: &ConfirmationHandle,
        approve: bool,
    ) -> Result<()>;

    /// Modules currently installed on the device
    async fn installed_modules(&self) -> Result<BTreeSet<ModuleId>>;

    /// Register the status listener
    ///
    /// A backend holds one listener; registering again replaces it.
    fn on_status_event(&self, listener: StatusListener);

    /// Get a human-readable name for this backend (for logging)
    fn name(&self) -> &str {
        "backend"
    }
}
