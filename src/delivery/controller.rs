// src/delivery/controller.rs

//! Delivery controller
//!
//! Owns the session store, the snapshot broadcast and the installed-set
//! view, and drives sessions from two directions:
//!
//! - Commands from callers (`install_or_open`, `uninstall`,
//!   `resolve_confirmation`, `acknowledge`) which may call the backend.
//! - Status events from the backend, delivered through the registered
//!   listener on the backend's own execution context.
//!
//! Every mutation of a session happens under that session's store lock and
//! the resulting snapshot is published before the lock is released, so
//! subscribers see each module's transitions in the order they were applied.
//! Backend calls are never made while a session lock is held.

use super::status::{self, Transition};
use super::{
    Action, DeliveryBackend, DeliveryMetrics, DeliverySession, InstalledModules, MetricsSnapshot,
    ModuleId, SessionEvents, SessionState, SessionStore, SessionSubscription, StatusUpdate,
};
use crate::config::DeliveryConfig;
use crate::error::{Error, ErrorKind, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct ControllerInner {
    backend: Arc<dyn DeliveryBackend>,
    store: SessionStore,
    events: SessionEvents,
    installed: InstalledModules,
    metrics: DeliveryMetrics,
    max_module_id_len: usize,
}

/// Per-module delivery state machine
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct DeliveryController {
    inner: Arc<ControllerInner>,
}

impl DeliveryController {
    /// Create a controller and register it as the backend's status listener
    pub fn new(backend: Arc<dyn DeliveryBackend>, config: &DeliveryConfig) -> Self {
        let inner = Arc::new(ControllerInner {
            backend,
            store: SessionStore::new(),
            events: SessionEvents::new(config.delivery.event_buffer),
            installed: InstalledModules::new(),
            metrics: DeliveryMetrics::default(),
            max_module_id_len: config.delivery.max_module_id_len,
        });

        // Weak so the backend's listener does not keep the controller alive
        let listener_target: Weak<ControllerInner> = Arc::downgrade(&inner);
        inner.backend.on_status_event(Arc::new(move |update: StatusUpdate| {
            if let Some(inner) = listener_target.upgrade() {
                inner.handle_status(update);
            }
        }));

        info!("Delivery controller attached to {} backend", inner.backend.name());
        Self { inner }
    }

    /// Validate a raw module id against the configured limits
    pub fn module_id(&self, raw: &str) -> Result<ModuleId> {
        ModuleId::parse_with_limit(raw, self.inner.max_module_id_len)
    }

    /// Open an installed module or start installing it
    pub async fn install_or_open(&self, raw: &str) -> Result<Action> {
        let module_id = self.module_id(raw)?;
        self.request_install_or_open(&module_id).await
    }

    /// Open an installed module or start installing it
    ///
    /// At most one backend install request is outstanding per module:
    /// concurrent calls for a module with a session in flight return
    /// `AlreadyInProgress` without contacting the backend.
    pub async fn request_install_or_open(&self, module_id: &ModuleId) -> Result<Action> {
        let inner = &self.inner;
        DeliveryMetrics::bump(&inner.metrics.install_requests);

        if self.is_installed(module_id).await? {
            DeliveryMetrics::bump(&inner.metrics.opens);
            info!("Module {} is installed, opening", module_id);
            return Ok(Action::Open(module_id.clone()));
        }

        // Reserve the slot before the first await on the backend
        let reserved = inner.store.update_or_insert(module_id, |session| {
            if session.state.is_in_flight() {
                return false;
            }
            session.begin_request();
            inner.events.publish(session.clone());
            true
        });
        if !reserved {
            DeliveryMetrics::bump(&inner.metrics.duplicates_suppressed);
            debug!("Install of {} already in progress", module_id);
            return Ok(Action::AlreadyInProgress(module_id.clone()));
        }

        DeliveryMetrics::bump(&inner.metrics.backend_install_calls);
        info!(
            "Requesting install of {} from {} backend",
            module_id,
            inner.backend.name()
        );

        match inner.backend.start_install(module_id).await {
            Ok(handle) => {
                debug!("Backend accepted {} as session {}", module_id, handle.0);
                inner.store.update(module_id, |session| {
                    if session.state.is_in_flight() && session.session_handle.is_none() {
                        session.session_handle = Some(handle);
                    }
                });
                Ok(Action::InstallStarted(module_id.clone()))
            }
            Err(e) => {
                let code = match &e {
                    Error::BackendFailure { code, .. } => *code,
                    _ => ErrorKind::UNSPECIFIED_BACKEND_CODE,
                };
                warn!("Install request for {} failed: {}", module_id, e);

                let failed = inner.store.update(module_id, |session| {
                    // Events may already have moved the session on
                    if session.state != SessionState::Requested {
                        return false;
                    }
                    session.state = SessionState::Failed(code);
                    session.last_error = Some(ErrorKind::BackendFailure { code });
                    session.touch();
                    inner.events.publish(session.clone());
                    true
                });
                if failed == Some(true) {
                    DeliveryMetrics::bump(&inner.metrics.sessions_failed);
                }
                Err(e)
            }
        }
    }

    /// Request deferred uninstall of modules given as raw ids
    pub async fn uninstall<S: AsRef<str>>(&self, raw: &[S]) -> Result<()> {
        let module_ids = raw
            .iter()
            .map(|id| self.module_id(id.as_ref()))
            .collect::<Result<BTreeSet<_>>>()?;
        self.request_uninstall(module_ids).await
    }

    /// Request deferred uninstall of a set of modules
    ///
    /// Modules that are not installed are skipped. Fails with `NotInstalled`
    /// only when none of them is installed. After the backend acknowledges,
    /// each module's session is retired and a `None` snapshot is published.
    pub async fn request_uninstall(&self, module_ids: BTreeSet<ModuleId>) -> Result<()> {
        let inner = &self.inner;
        let installed = self.installed_modules().await?;

        let (targets, missing): (Vec<ModuleId>, Vec<ModuleId>) = module_ids
            .into_iter()
            .partition(|id| installed.contains(id));

        if targets.is_empty() {
            return Err(Error::NotInstalled {
                modules: missing.iter().map(ToString::to_string).collect(),
            });
        }
        if !missing.is_empty() {
            debug!("Skipping modules that are not installed: {}", join_ids(&missing));
        }

        info!("Requesting deferred uninstall of {}", join_ids(&targets));
        inner.backend.deferred_uninstall(&targets).await?;

        for module_id in &targets {
            // Reset and retire under the entry lock so a racing install
            // either sees the module installed or finds the slot free
            inner.store.update_or_insert(module_id, |session| {
                inner.installed.mark_uninstalled(module_id);
                if session.state.is_in_flight() {
                    debug!("Keeping in-flight session for {} after uninstall", module_id);
                    return;
                }
                *session = DeliverySession::new(module_id.clone());
                inner.events.publish(session.clone());
            });
            // A new install may have claimed the slot meanwhile
            inner
                .store
                .remove_if(module_id, |session| session.state == SessionState::None);
            DeliveryMetrics::bump(&inner.metrics.modules_uninstalled);
        }
        Ok(())
    }

    /// Approve or deny a pending confirmation gate, by raw id
    pub async fn resolve_confirmation(&self, raw: &str, approve: bool) -> Result<()> {
        let module_id = self.module_id(raw)?;
        self.resolve_confirmation_for(&module_id, approve).await
    }

    /// Approve or deny a pending confirmation gate
    ///
    /// Approval is forwarded to the backend first; the session resumes the
    /// state the gate interrupted once the backend accepts it. Denial cancels
    /// the session immediately and is then forwarded on a best-effort basis.
    pub async fn resolve_confirmation_for(&self, module_id: &ModuleId, approve: bool) -> Result<()> {
        let inner = &self.inner;
        let no_pending = || Error::NoConfirmationPending {
            module: module_id.to_string(),
        };

        let handle = inner
            .store
            .get(module_id)
            .filter(|session| session.state == SessionState::RequiresConfirmation)
            .and_then(|session| session.pending_confirmation)
            .ok_or_else(no_pending)?;

        if approve {
            inner.backend.resolve_user_confirmation(&handle, true).await?;

            let resumed = inner
                .store
                .update(module_id, |session| {
                    if session.state != SessionState::RequiresConfirmation
                        || session.pending_confirmation.as_ref() != Some(&handle)
                    {
                        return None;
                    }
                    let resume = session.resume_state.take().unwrap_or(SessionState::Requested);
                    session.state = resume;
                    session.pending_confirmation = None;
                    session.touch();
                    inner.events.publish(session.clone());
                    Some(resume)
                })
                .flatten();

            match resumed {
                Some(state) => info!("Confirmation approved for {}, resuming at {}", module_id, state),
                None => debug!("Confirmation gate for {} already closed by backend", module_id),
            }
            return Ok(());
        }

        let canceled = inner
            .store
            .update(module_id, |session| {
                if session.state != SessionState::RequiresConfirmation
                    || session.pending_confirmation.as_ref() != Some(&handle)
                {
                    return false;
                }
                session.state = SessionState::Canceled;
                session.pending_confirmation = None;
                session.resume_state = None;
                session.touch();
                inner.events.publish(session.clone());
                true
            })
            .unwrap_or(false);
        if !canceled {
            return Err(no_pending());
        }

        DeliveryMetrics::bump(&inner.metrics.sessions_canceled);
        info!("Confirmation denied for {}, session canceled", module_id);

        if let Err(e) = inner.backend.resolve_user_confirmation(&handle, false).await {
            warn!("Failed to forward denial for {} to backend: {}", module_id, e);
        }
        Ok(())
    }

    /// Retire a finished install once the caller has observed it
    pub async fn acknowledge(&self, raw: &str) -> Result<()> {
        let module_id = self.module_id(raw)?;

        if self
            .inner
            .store
            .remove_if(&module_id, |session| session.state == SessionState::Installed)
            .is_some()
        {
            debug!("Retired installed session for {}", module_id);
            return Ok(());
        }
        if self.installed_modules().await?.contains(&module_id) {
            return Ok(());
        }
        Err(Error::NotInstalled {
            modules: vec![module_id.to_string()],
        })
    }

    /// Current session for a raw module id
    pub fn get_session(&self, raw: &str) -> Result<Option<DeliverySession>> {
        let module_id = self.module_id(raw)?;
        Ok(self.session(&module_id))
    }

    /// Current session for a module
    pub fn session(&self, module_id: &ModuleId) -> Option<DeliverySession> {
        self.inner.store.get(module_id)
    }

    /// All sessions, ordered by module id
    pub fn sessions(&self) -> Vec<DeliverySession> {
        self.inner.store.snapshot()
    }

    /// Download progress of a module's session
    pub fn progress(&self, module_id: &ModuleId) -> Option<f64> {
        self.session(module_id).map(|session| session.progress())
    }

    /// Subscribe to snapshots published from now on
    pub fn subscribe(&self) -> SessionSubscription {
        self.inner.events.subscribe()
    }

    /// Installed modules, loading from the backend on first use
    pub async fn installed_modules(&self) -> Result<BTreeSet<ModuleId>> {
        if !self.inner.installed.is_loaded() {
            return self.refresh_installed().await;
        }
        Ok(self.inner.installed.snapshot())
    }

    /// Reload the installed set from the backend
    pub async fn refresh_installed(&self) -> Result<BTreeSet<ModuleId>> {
        let reported = self.inner.backend.installed_modules().await?;
        debug!("Backend reports {} installed modules", reported.len());
        self.inner.installed.refresh(reported);
        Ok(self.inner.installed.snapshot())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// Apply a backend status event
    ///
    /// This is what the registered listener calls. It never blocks on
    /// subscribers and never calls the backend.
    pub fn on_backend_event(&self, update: StatusUpdate) {
        self.inner.handle_status(update);
    }

    async fn is_installed(&self, module_id: &ModuleId) -> Result<bool> {
        if !self.inner.installed.is_loaded() {
            self.refresh_installed().await?;
        }
        Ok(self.inner.installed.contains(module_id))
    }
}

impl ControllerInner {
    fn handle_status(&self, update: StatusUpdate) {
        let module_id = update.module_id.clone();

        let Some(status) = update.status() else {
            DeliveryMetrics::bump(&self.metrics.unknown_statuses);
            let err = Error::UnknownBackendStatus {
                module: module_id.to_string(),
                code: update.status_code,
            };
            warn!("Ignoring backend event: {}", err);
            return;
        };

        let outcome = self.store.update(&module_id, |session| {
            match status::next_state(session, status, &update) {
                Transition::Apply(next) => {
                    self.apply(session, next, &update);
                    self.events.publish(session.clone());
                    Ok(next)
                }
                Transition::Ignore(reason) => Err((session.state, reason)),
            }
        });

        match outcome {
            None => {
                DeliveryMetrics::bump(&self.metrics.events_ignored);
                warn!("Ignoring {:?} for {}: no session", status, module_id);
            }
            Some(Err((state, reason))) => {
                DeliveryMetrics::bump(&self.metrics.events_ignored);
                if state.is_terminal() {
                    debug!("Ignoring {:?} for {} in state {}: {}", status, module_id, state, reason);
                } else {
                    warn!("Ignoring {:?} for {} in state {}: {}", status, module_id, state, reason);
                }
            }
            Some(Ok(SessionState::Installed)) => {
                DeliveryMetrics::bump(&self.metrics.sessions_installed);
                info!("Module {} installed", module_id);
            }
            Some(Ok(SessionState::Failed(code))) => {
                DeliveryMetrics::bump(&self.metrics.sessions_failed);
                warn!("Delivery of {} failed with code {}", module_id, code);
            }
            Some(Ok(SessionState::Canceled)) => {
                DeliveryMetrics::bump(&self.metrics.sessions_canceled);
                info!("Delivery of {} canceled", module_id);
            }
            Some(Ok(next)) => debug!("Module {} is now {}", module_id, next),
        }
    }

    /// Write an accepted transition into the session
    fn apply(&self, session: &mut DeliverySession, next: SessionState, update: &StatusUpdate) {
        let previous = session.state;

        match next {
            SessionState::Downloading => {
                session.bytes_total = update.bytes_total;
                session.bytes_downloaded =
                    if update.bytes_total > 0 && update.bytes_downloaded > update.bytes_total {
                        warn!(
                            "Backend reported {} of {} bytes for {}, clamping",
                            update.bytes_downloaded, update.bytes_total, session.module_id
                        );
                        update.bytes_total
                    } else {
                        update.bytes_downloaded
                    };
            }
            SessionState::RequiresConfirmation => {
                if previous != SessionState::RequiresConfirmation {
                    session.resume_state = Some(previous);
                }
                session.pending_confirmation = update.confirmation.clone();
            }
            SessionState::Installed => {
                // Visible as installed before anyone sees the snapshot
                self.installed.mark_installed(&session.module_id);
            }
            SessionState::Failed(code) => {
                session.last_error = Some(ErrorKind::BackendFailure { code });
            }
            _ => {}
        }

        if next != SessionState::RequiresConfirmation {
            session.pending_confirmation = None;
            session.resume_state = None;
        }
        if let Some(handle) = &update.session_handle {
            session.session_handle = Some(handle.clone());
        }
        session.state = next;
        session.touch();
    }
}

fn join_ids(ids: &[ModuleId]) -> String {
    ids.iter().map(ModuleId::as_str).collect::<Vec<_>>().join(", ")
}
