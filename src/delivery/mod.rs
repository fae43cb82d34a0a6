// src/delivery/mod.rs

//! On-demand module delivery
//!
//! Tracks the lifecycle of installing optional modules through an external
//! delivery backend. The backend does the real download and install work and
//! reports progress through status events; this module turns those events
//! into per-module session state and pushes snapshots to subscribers.
//!
//! # Architecture
//!
//! ```text
//! caller                DeliveryController              DeliveryBackend
//!   │                          │                               │
//!   ├─ install_or_open ───────►│── start_install ─────────────►│
//!   │◄── InstallStarted ───────┤                               │
//!   │                          │◄──── status events (async) ───┤
//!   │                          │  SessionStore (mutate)        │
//!   │◄── SessionEvents ────────┤  publish snapshot             │
//! ```
//!
//! # Module Structure
//!
//! - `status` - Backend status codes and the transition table
//! - `store` - Session store keyed by module id
//! - `events` - Snapshot broadcast to subscribers
//! - `installed` - View of the installed module set
//! - `backend` - Delivery backend adapter trait
//! - `controller` - The state machine and command surface
//! - `simulated` - In-process scripted backend
//! - `routes` - HTTP/SSE surface (feature `server`)

pub mod backend;
pub mod controller;
pub mod events;
pub mod installed;
#[cfg(feature = "server")]
pub mod routes;
pub mod simulated;
pub mod status;
pub mod store;

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub use backend::{DeliveryBackend, StatusListener};
pub use controller::DeliveryController;
pub use events::{SessionEvent, SessionEvents, SessionSubscription};
pub use installed::InstalledModules;
pub use simulated::{BackendCall, InstallScript, SimulatedBackend};
pub use status::{BackendStatus, StatusUpdate};
pub use store::SessionStore;

/// Identifier of an installable optional module
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// Default upper bound on identifier length
    pub const DEFAULT_MAX_LEN: usize = 128;

    /// Parse and validate a module identifier
    pub fn parse(id: &str) -> Result<Self> {
        Self::parse_with_limit(id, Self::DEFAULT_MAX_LEN)
    }

    /// Parse with an explicit length limit
    ///
    /// Module names are code identifiers: they start with an ASCII letter
    /// or underscore and continue with letters, digits, `_`, `.` or `-`.
    pub fn parse_with_limit(id: &str, max_len: usize) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidModuleId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let first = id.chars().next().ok_or_else(|| invalid("empty"))?;
        if id.len() > max_len {
            return Err(invalid(&format!("longer than {} bytes", max_len)));
        }
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(invalid("must start with a letter or underscore"));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(invalid(&format!("unexpected character {:?}", bad)));
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModuleId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ModuleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token for resolving a user-confirmation gate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationHandle(pub String);

/// Backend-assigned session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    /// Generate a fresh random handle
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No install requested
    None,
    /// Install request issued to the backend
    Requested,
    /// Backend accepted the request, not yet transferring
    Pending,
    /// Waiting on the caller to resolve a confirmation gate
    RequiresConfirmation,
    /// Bytes are being transferred
    Downloading,
    /// Transfer finished
    Downloaded,
    /// Backend is installing the module
    Installing,
    /// Module installed
    Installed,
    /// Backend is canceling the session
    Canceling,
    /// Session canceled (by the backend or by a denied confirmation)
    Canceled,
    /// Session failed with a backend error code
    Failed(i32),
}

impl SessionState {
    /// No further automatic transition happens from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Canceled | Self::Failed(_))
    }

    /// A backend session is active for this state
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() && *self != Self::None
    }

    /// Position along the install pipeline, if this state is on it
    pub fn pipeline_rank(&self) -> Option<u8> {
        match self {
            Self::Requested => Some(1),
            Self::Pending => Some(2),
            Self::Downloading => Some(3),
            Self::Downloaded => Some(4),
            Self::Installing => Some(5),
            Self::Installed => Some(6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Requested => "requested",
            Self::Pending => "pending",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(code) => write!(f, "failed({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Bookkeeping record for one module's delivery lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySession {
    pub module_id: ModuleId,
    pub state: SessionState,
    /// Meaningful while downloading
    pub bytes_downloaded: u64,
    /// Zero means the size is not known yet
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<ConfirmationHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<SessionHandle>,
    /// State to resume once a confirmation gate is approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<SessionState>,
    pub updated_at: DateTime<Utc>,
}

impl DeliverySession {
    /// Create a session in the `None` state
    pub fn new(module_id: ModuleId) -> Self {
        Self {
            module_id,
            state: SessionState::None,
            bytes_downloaded: 0,
            bytes_total: 0,
            pending_confirmation: None,
            last_error: None,
            session_handle: None,
            resume_state: None,
            updated_at: Utc::now(),
        }
    }

    /// Fraction of bytes transferred, in `[0, 1]`
    ///
    /// Zero while the total is unknown.
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_downloaded.min(self.bytes_total) as f64) / (self.bytes_total as f64)
    }

    /// Reset bookkeeping and mark a fresh install request
    pub(crate) fn begin_request(&mut self) {
        self.state = SessionState::Requested;
        self.bytes_downloaded = 0;
        self.bytes_total = 0;
        self.pending_confirmation = None;
        self.last_error = None;
        self.session_handle = None;
        self.resume_state = None;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Outcome of `install_or_open`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "module")]
pub enum Action {
    /// Module is installed; the caller launches its entry point
    #[serde(rename = "opened")]
    Open(ModuleId),
    /// A backend install request was issued
    #[serde(rename = "started")]
    InstallStarted(ModuleId),
    /// A session is already in flight; no new request was issued
    #[serde(rename = "in_progress")]
    AlreadyInProgress(ModuleId),
}

impl Action {
    pub fn module(&self) -> &ModuleId {
        match self {
            Self::Open(id) | Self::InstallStarted(id) | Self::AlreadyInProgress(id) => id,
        }
    }

    /// Wire name, as serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open(_) => "opened",
            Self::InstallStarted(_) => "started",
            Self::AlreadyInProgress(_) => "in_progress",
        }
    }
}

/// Controller counters
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// install_or_open calls
    pub install_requests: AtomicU64,
    /// Calls answered with `Open`
    pub opens: AtomicU64,
    /// Calls answered with `AlreadyInProgress`
    pub duplicates_suppressed: AtomicU64,
    /// start_install calls issued to the backend
    pub backend_install_calls: AtomicU64,
    pub sessions_installed: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub sessions_canceled: AtomicU64,
    /// Events that did not match the session's state
    pub events_ignored: AtomicU64,
    /// Events with a status code outside the known set
    pub unknown_statuses: AtomicU64,
    /// Modules acknowledged for deferred uninstall
    pub modules_uninstalled: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub install_requests: u64,
    pub opens: u64,
    pub duplicates_suppressed: u64,
    pub backend_install_calls: u64,
    pub sessions_installed: u64,
    pub sessions_failed: u64,
    pub sessions_canceled: u64,
    pub events_ignored: u64,
    pub unknown_statuses: u64,
    pub modules_uninstalled: u64,
}

impl DeliveryMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            install_requests: load(&self.install_requests),
            opens: load(&self.opens),
            duplicates_suppressed: load(&self.duplicates_suppressed),
            backend_install_calls: load(&self.backend_install_calls),
            sessions_installed: load(&self.sessions_installed),
            sessions_failed: load(&self.sessions_failed),
            sessions_canceled: load(&self.sessions_canceled),
            events_ignored: load(&self.events_ignored),
            unknown_statuses: load(&self.unknown_statuses),
            modules_uninstalled: load(&self.modules_uninstalled),
        }
    }
}
