// src/delivery/simulated.rs

//! In-process simulated delivery backend
//!
//! Plays a scripted event sequence for each install request from a
//! background task, the way a platform delivery service reports sessions:
//!
//! ```text
//! PENDING → [REQUIRES_USER_CONFIRMATION] → DOWNLOADING × n → DOWNLOADED
//!         → INSTALLING → INSTALLED
//! ```
//!
//! Scripts can pause on a confirmation gate, fail partway through the
//! transfer, or stay silent so a test can inject events by hand. Every call
//! is recorded for assertions.

use super::backend::{DeliveryBackend, StatusListener};
use super::{BackendStatus, ConfirmationHandle, ModuleId, SessionHandle, StatusUpdate};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Event script for one install
#[derive(Debug, Clone)]
pub struct InstallScript {
    /// Module size reported while downloading
    pub total_bytes: u64,
    /// Bytes added per DOWNLOADING event
    pub chunk_bytes: u64,
    /// Pause before each event
    pub step_delay: Duration,
    /// Stop at a confirmation gate after PENDING
    pub require_confirmation: bool,
    /// Emit FAILED with this code after the first chunk
    pub fail_with: Option<i32>,
    /// Emit nothing; events are injected with `SimulatedBackend::emit`
    pub manual: bool,
}

impl Default for InstallScript {
    fn default() -> Self {
        Self {
            total_bytes: 4 * 1024 * 1024,
            chunk_bytes: 1024 * 1024,
            step_delay: Duration::from_millis(50),
            require_confirmation: false,
            fail_with: None,
            manual: false,
        }
    }
}

impl InstallScript {
    /// Script that emits nothing on its own
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    /// Fast script for tests
    pub fn quick(total_bytes: u64, chunk_bytes: u64) -> Self {
        Self {
            total_bytes,
            chunk_bytes,
            step_delay: Duration::from_millis(1),
            ..Self::default()
        }
    }

    pub fn with_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    pub fn with_failure(mut self, code: i32) -> Self {
        self.fail_with = Some(code);
        self
    }
}

/// Backend call record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    StartInstall(ModuleId),
    DeferredUninstall(Vec<ModuleId>),
    ResolveConfirmation {
        handle: ConfirmationHandle,
        approve: bool,
    },
    InstalledModules,
}

struct SimInner {
    listener: RwLock<Option<StatusListener>>,
    installed: Mutex<BTreeSet<ModuleId>>,
    default_script: Mutex<InstallScript>,
    scripts: Mutex<HashMap<ModuleId, InstallScript>>,
    /// Open confirmation gates and the module each one holds
    gates: Mutex<HashMap<ConfirmationHandle, (ModuleId, oneshot::Sender<bool>)>>,
    /// Cancel flags of running scripts
    running: Mutex<HashMap<ModuleId, Arc<AtomicBool>>>,
    calls: Mutex<Vec<BackendCall>>,
    /// Reject the next start_install with this code
    reject_next: Mutex<Option<i32>>,
}

impl SimInner {
    fn emit(&self, update: StatusUpdate) {
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener(update),
            None => debug!("Dropping status event for {}: no listener", update.module_id),
        }
    }

    /// Forget a finished script unless a newer run replaced it
    fn finish(&self, module_id: &ModuleId, cancel: &Arc<AtomicBool>) {
        let mut running = self.running.lock();
        if running.get(module_id).is_some_and(|flag| Arc::ptr_eq(flag, cancel)) {
            running.remove(module_id);
        }
    }

    async fn run_script(
        self: Arc<Self>,
        module_id: ModuleId,
        handle: SessionHandle,
        script: InstallScript,
        cancel: Arc<AtomicBool>,
    ) {
        let emit = |update: StatusUpdate| {
            if !cancel.load(Ordering::Relaxed) {
                self.emit(update.with_session_handle(handle.clone()));
            }
        };
        let step = || tokio::time::sleep(script.step_delay);

        step().await;
        emit(StatusUpdate::new(module_id.clone(), BackendStatus::Pending));

        if script.require_confirmation {
            let gate = ConfirmationHandle(format!("confirm-{}", handle.0));
            let (tx, rx) = oneshot::channel();
            self.gates
                .lock()
                .insert(gate.clone(), (module_id.clone(), tx));
            emit(StatusUpdate::requires_confirmation(module_id.clone(), gate));

            // Denied, or the gate was dropped by cancel
            if !matches!(rx.await, Ok(true)) {
                emit(StatusUpdate::new(module_id.clone(), BackendStatus::Canceled));
                self.finish(&module_id, &cancel);
                return;
            }
        }

        let total = script.total_bytes;
        let chunk = script.chunk_bytes.max(1);
        let mut done = 0u64;
        emit(StatusUpdate::downloading(module_id.clone(), 0, total));
        while done < total {
            step().await;
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            done = (done + chunk).min(total);
            emit(StatusUpdate::downloading(module_id.clone(), done, total));
            if script.fail_with.is_some() {
                break;
            }
        }
        if let Some(code) = script.fail_with {
            emit(StatusUpdate::failed(module_id.clone(), code));
            self.finish(&module_id, &cancel);
            return;
        }

        step().await;
        emit(StatusUpdate::new(module_id.clone(), BackendStatus::Downloaded));
        step().await;
        emit(StatusUpdate::new(module_id.clone(), BackendStatus::Installing));
        step().await;
        if !cancel.load(Ordering::Relaxed) {
            self.installed.lock().insert(module_id.clone());
        }
        emit(StatusUpdate::new(module_id.clone(), BackendStatus::Installed));
        self.finish(&module_id, &cancel);
    }
}

/// Scripted in-process backend
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                listener: RwLock::new(None),
                installed: Mutex::new(BTreeSet::new()),
                default_script: Mutex::new(InstallScript::default()),
                scripts: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                reject_next: Mutex::new(None),
            }),
        }
    }

    /// Start with these modules already installed
    pub fn with_installed(self, modules: impl IntoIterator<Item = ModuleId>) -> Self {
        self.inner.installed.lock().extend(modules);
        self
    }

    /// Script used for modules without their own
    pub fn with_script(self, script: InstallScript) -> Self {
        *self.inner.default_script.lock() = script;
        self
    }

    /// Script for one module
    pub fn set_script(&self, module_id: ModuleId, script: InstallScript) {
        self.inner.scripts.lock().insert(module_id, script);
    }

    /// Make the next start_install call fail with `code`
    pub fn reject_next_install(&self, code: i32) {
        *self.inner.reject_next.lock() = Some(code);
    }

    /// Deliver an event to the registered listener
    pub fn emit(&self, update: StatusUpdate) {
        self.inner.emit(update);
    }

    /// Cancel a running script
    ///
    /// Emits CANCELING then CANCELED. Returns false if nothing was running.
    pub fn cancel(&self, module_id: &ModuleId) -> bool {
        let Some(flag) = self.inner.running.lock().remove(module_id) else {
            return false;
        };
        flag.store(true, Ordering::Relaxed);
        // Release a script parked at its confirmation gate
        self.inner
            .gates
            .lock()
            .retain(|_, (gated, _)| gated != module_id);
        self.inner
            .emit(StatusUpdate::new(module_id.clone(), BackendStatus::Canceling));
        self.inner
            .emit(StatusUpdate::new(module_id.clone(), BackendStatus::Canceled));
        true
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of start_install calls received
    pub fn start_install_count(&self) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BackendCall::StartInstall(_)))
            .count()
    }

    /// Backend-side installed set
    pub fn installed(&self) -> BTreeSet<ModuleId> {
        self.inner.installed.lock().clone()
    }

    fn record(&self, call: BackendCall) {
        self.inner.calls.lock().push(call);
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryBackend for SimulatedBackend {
    async fn start_install(&self, module_id: &ModuleId) -> Result<SessionHandle> {
        self.record(BackendCall::StartInstall(module_id.clone()));

        if let Some(code) = self.inner.reject_next.lock().take() {
            return Err(Error::BackendFailure {
                code,
                message: format!("install request for {} rejected", module_id),
            });
        }

        let handle = SessionHandle::generate();
        let script = self
            .inner
            .scripts
            .lock()
            .get(module_id)
            .cloned()
            .unwrap_or_else(|| self.inner.default_script.lock().clone());

        if !script.manual {
            let cancel = Arc::new(AtomicBool::new(false));
            self.inner
                .running
                .lock()
                .insert(module_id.clone(), cancel.clone());
            tokio::spawn(SimInner::run_script(
                self.inner.clone(),
                module_id.clone(),
                handle.clone(),
                script,
                cancel,
            ));
        }

        debug!("Simulated session {} started for {}", handle.0, module_id);
        Ok(handle)
    }

    async fn deferred_uninstall(&self, module_ids: &[ModuleId]) -> Result<()> {
        self.record(BackendCall::DeferredUninstall(module_ids.to_vec()));
        let mut installed = self.inner.installed.lock();
        for id in module_ids {
            installed.remove(id);
        }
        Ok(())
    }

    async fn resolve_user_confirmation(
        &self,
        handle: &ConfirmationHandle,
        approve: bool,
    ) -> Result<()> {
        self.record(BackendCall::ResolveConfirmation {
            handle: handle.clone(),
            approve,
        });

        let gate = self.inner.gates.lock().remove(handle);
        match gate {
            Some((_, tx)) => {
                // Script may already be gone
                let _ = tx.send(approve);
                Ok(())
            }
            None => Err(Error::backend(format!(
                "unknown confirmation handle {}",
                handle.0
            ))),
        }
    }

    async fn installed_modules(&self) -> Result<BTreeSet<ModuleId>> {
        self.record(BackendCall::InstalledModules);
        Ok(self.installed())
    }

    fn on_status_event(&self, listener: StatusListener) {
        *self.inner.listener.write() = Some(listener);
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
