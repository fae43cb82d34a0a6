// src/delivery/status.rs

//! Backend status codes and the session transition table
//!
//! The backend reports integer status codes. Known codes map onto
//! `BackendStatus`; anything else is treated as unknown by the controller
//! and never changes session state.

use crate::error::ErrorKind;
use super::{ConfirmationHandle, DeliverySession, ModuleId, SessionHandle, SessionState};
use serde::{Deserialize, Serialize};

/// Session status reported by the delivery backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    Pending,
    RequiresUserConfirmation,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Failed,
    Canceling,
    Canceled,
}

impl BackendStatus {
    /// Parse a platform status code
    ///
    /// Returns `None` for code 0 (the platform's own UNKNOWN) and for any
    /// value outside the known set.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Pending),
            2 => Some(Self::Downloading),
            3 => Some(Self::Downloaded),
            4 => Some(Self::Installing),
            5 => Some(Self::Installed),
            6 => Some(Self::Failed),
            7 => Some(Self::Canceled),
            8 => Some(Self::RequiresUserConfirmation),
            9 => Some(Self::Canceling),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Pending => 1,
            Self::Downloading => 2,
            Self::Downloaded => 3,
            Self::Installing => 4,
            Self::Installed => 5,
            Self::Failed => 6,
            Self::Canceled => 7,
            Self::RequiresUserConfirmation => 8,
            Self::Canceling => 9,
        }
    }
}

/// Status event emitted by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub module_id: ModuleId,
    /// Raw platform status code
    pub status_code: i32,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub bytes_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<SessionHandle>,
}

impl StatusUpdate {
    /// Event with a known status and no payload
    pub fn new(module_id: ModuleId, status: BackendStatus) -> Self {
        Self::with_code(module_id, status.code())
    }

    /// Event carrying a raw status code
    pub fn with_code(module_id: ModuleId, status_code: i32) -> Self {
        Self {
            module_id,
            status_code,
            bytes_downloaded: 0,
            bytes_total: 0,
            error_code: None,
            confirmation: None,
            session_handle: None,
        }
    }

    /// DOWNLOADING event with byte counts
    pub fn downloading(module_id: ModuleId, bytes_downloaded: u64, bytes_total: u64) -> Self {
        Self {
            bytes_downloaded,
            bytes_total,
            ..Self::new(module_id, BackendStatus::Downloading)
        }
    }

    /// FAILED event with a platform error code
    pub fn failed(module_id: ModuleId, error_code: i32) -> Self {
        Self {
            error_code: Some(error_code),
            ..Self::new(module_id, BackendStatus::Failed)
        }
    }

    /// REQUIRES_USER_CONFIRMATION event carrying the resolution token
    pub fn requires_confirmation(module_id: ModuleId, handle: ConfirmationHandle) -> Self {
        Self {
            confirmation: Some(handle),
            ..Self::new(module_id, BackendStatus::RequiresUserConfirmation)
        }
    }

    pub fn with_session_handle(mut self, handle: SessionHandle) -> Self {
        self.session_handle = Some(handle);
        self
    }

    pub fn status(&self) -> Option<BackendStatus> {
        BackendStatus::from_code(self.status_code)
    }
}

/// Decision for one backend event against the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move the session to this state
    Apply(SessionState),
    /// Leave the session untouched
    Ignore(&'static str),
}

/// Failure code recorded when a FAILED event carries none
pub const UNSPECIFIED_FAILURE_CODE: i32 = ErrorKind::UNSPECIFIED_BACKEND_CODE;

/// Decide how a backend event moves a session
///
/// Pipeline events only move forward along
/// Requested < Pending < Downloading < Downloaded < Installing < Installed,
/// with DOWNLOADING also allowed as a self-loop for progress updates.
/// While a confirmation gate is open, the state it interrupted is used as
/// the pipeline position. Terminal and idle sessions accept nothing.
pub fn next_state(session: &DeliverySession, status: BackendStatus, update: &StatusUpdate) -> Transition {
    let current = session.state;
    if !current.is_in_flight() {
        return Transition::Ignore("session is not in flight");
    }

    if current == SessionState::Canceling {
        return match status {
            BackendStatus::Canceling => Transition::Apply(SessionState::Canceling),
            BackendStatus::Canceled => Transition::Apply(SessionState::Canceled),
            BackendStatus::Failed => Transition::Apply(SessionState::Failed(failure_code(update))),
            _ => Transition::Ignore("session is canceling"),
        };
    }

    let rank = match current {
        SessionState::RequiresConfirmation => session
            .resume_state
            .and_then(|s| s.pipeline_rank())
            .unwrap_or(1),
        other => other.pipeline_rank().unwrap_or(1),
    };

    let forward = |target: SessionState| match target.pipeline_rank() {
        Some(r) if r > rank => Transition::Apply(target),
        _ => Transition::Ignore("backward or repeated pipeline event"),
    };

    match status {
        BackendStatus::Pending => forward(SessionState::Pending),
        BackendStatus::Downloading => {
            if rank <= 3 {
                Transition::Apply(SessionState::Downloading)
            } else {
                Transition::Ignore("download progress after download finished")
            }
        }
        BackendStatus::Downloaded => forward(SessionState::Downloaded),
        BackendStatus::Installing => forward(SessionState::Installing),
        BackendStatus::Installed => forward(SessionState::Installed),
        BackendStatus::RequiresUserConfirmation => {
            if update.confirmation.is_some() {
                Transition::Apply(SessionState::RequiresConfirmation)
            } else {
                Transition::Ignore("confirmation request without a handle")
            }
        }
        BackendStatus::Failed => Transition::Apply(SessionState::Failed(failure_code(update))),
        BackendStatus::Canceling => Transition::Apply(SessionState::Canceling),
        BackendStatus::Canceled => Transition::Apply(SessionState::Canceled),
    }
}

fn failure_code(update: &StatusUpdate) -> i32 {
    update.error_code.unwrap_or(UNSPECIFIED_FAILURE_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ModuleId {
        ModuleId::parse("m1").unwrap()
    }

    fn session_in(state: SessionState) -> DeliverySession {
        let mut session = DeliverySession::new(id());
        session.state = state;
        session
    }

    fn decide(state: SessionState, update: StatusUpdate) -> Transition {
        let status = update.status().unwrap();
        next_state(&session_in(state), status, &update)
    }

    #[test]
    fn test_status_codes_round_trip_known_set() {
        for code in 1..=9 {
            let status = BackendStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(BackendStatus::from_code(0), None);
        assert_eq!(BackendStatus::from_code(42), None);
        assert_eq!(BackendStatus::from_code(-1), None);
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        let cases = [
            (Requested, StatusUpdate::new(id(), BackendStatus::Pending), Pending),
            (Requested, StatusUpdate::downloading(id(), 1, 10), Downloading),
            (Pending, StatusUpdate::downloading(id(), 1, 10), Downloading),
            (Downloading, StatusUpdate::downloading(id(), 5, 10), Downloading),
            (Downloading, StatusUpdate::new(id(), BackendStatus::Downloaded), Downloaded),
            (Downloaded, StatusUpdate::new(id(), BackendStatus::Installing), Installing),
            (Installing, StatusUpdate::new(id(), BackendStatus::Installed), Installed),
        ];
        for (from, update, to) in cases {
            assert_eq!(decide(from, update), Transition::Apply(to), "from {}", from);
        }
    }

    #[test]
    fn test_backward_events_are_ignored() {
        use SessionState::*;
        assert!(matches!(
            decide(Installing, StatusUpdate::downloading(id(), 1, 10)),
            Transition::Ignore(_)
        ));
        assert!(matches!(
            decide(Downloading, StatusUpdate::new(id(), BackendStatus::Pending)),
            Transition::Ignore(_)
        ));
        assert!(matches!(
            decide(Downloaded, StatusUpdate::new(id(), BackendStatus::Downloaded)),
            Transition::Ignore(_)
        ));
    }

    #[test]
    fn test_forward_skip_is_accepted() {
        assert_eq!(
            decide(SessionState::Requested, StatusUpdate::new(id(), BackendStatus::Installed)),
            Transition::Apply(SessionState::Installed)
        );
    }

    #[test]
    fn test_terminal_and_idle_sessions_accept_nothing() {
        for state in [
            SessionState::None,
            SessionState::Installed,
            SessionState::Canceled,
            SessionState::Failed(-1),
        ] {
            assert!(matches!(
                decide(state, StatusUpdate::failed(id(), -2)),
                Transition::Ignore(_)
            ));
        }
    }

    #[test]
    fn test_failure_and_cancel_from_any_in_flight_state() {
        use SessionState::*;
        for state in [Requested, Pending, Downloading, Downloaded, Installing, RequiresConfirmation] {
            assert_eq!(
                decide(state, StatusUpdate::failed(id(), -6)),
                Transition::Apply(Failed(-6))
            );
            assert_eq!(
                decide(state, StatusUpdate::new(id(), BackendStatus::Canceling)),
                Transition::Apply(Canceling)
            );
        }
        assert_eq!(
            decide(Canceling, StatusUpdate::new(id(), BackendStatus::Canceled)),
            Transition::Apply(Canceled)
        );
        assert!(matches!(
            decide(Canceling, StatusUpdate::downloading(id(), 1, 2)),
            Transition::Ignore(_)
        ));
    }

    #[test]
    fn test_failed_without_code_uses_placeholder() {
        assert_eq!(
            decide(SessionState::Downloading, StatusUpdate::new(id(), BackendStatus::Failed)),
            Transition::Apply(SessionState::Failed(UNSPECIFIED_FAILURE_CODE))
        );
    }

    #[test]
    fn test_confirmation_requires_handle() {
        let with_handle =
            StatusUpdate::requires_confirmation(id(), ConfirmationHandle("h1".to_string()));
        assert_eq!(
            decide(SessionState::Pending, with_handle),
            Transition::Apply(SessionState::RequiresConfirmation)
        );

        let without = StatusUpdate::new(id(), BackendStatus::RequiresUserConfirmation);
        assert!(matches!(decide(SessionState::Pending, without), Transition::Ignore(_)));
    }

    #[test]
    fn test_gate_uses_interrupted_position() {
        let mut session = session_in(SessionState::RequiresConfirmation);
        session.resume_state = Some(SessionState::Downloading);

        let progress = StatusUpdate::downloading(id(), 3, 10);
        assert_eq!(
            next_state(&session, BackendStatus::Downloading, &progress),
            Transition::Apply(SessionState::Downloading)
        );

        let pending = StatusUpdate::new(id(), BackendStatus::Pending);
        assert!(matches!(
            next_state(&session, BackendStatus::Pending, &pending),
            Transition::Ignore(_)
        ));
    }
}
