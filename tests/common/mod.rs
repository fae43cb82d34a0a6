// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ondemand::delivery::StatusListener;
use ondemand::{
    ConfirmationHandle, DeliveryBackend, DeliveryConfig, DeliveryController, DeliverySession,
    Error, ModuleId, SessionHandle, SessionSubscription, StatusUpdate,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn id(name: &str) -> ModuleId {
    ModuleId::parse(name).unwrap()
}

/// Backend that records calls and only emits events when told to.
#[derive(Default)]
pub struct RecordingBackend {
    listener: Mutex<Option<StatusListener>>,
    installed: Mutex<BTreeSet<ModuleId>>,
    start_calls: AtomicUsize,
    uninstalls: Mutex<Vec<Vec<ModuleId>>>,
    confirmations: Mutex<Vec<(ConfirmationHandle, bool)>>,
    fail_start: Mutex<Option<i32>>,
    fail_confirmation: Mutex<bool>,
    /// When set, start_install waits for a permit
    hold: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingBackend {
    pub fn new(installed: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        backend
            .installed
            .lock()
            .extend(installed.iter().map(|name| id(name)));
        Arc::new(backend)
    }

    /// Deliver a status event the way the platform would
    pub fn emit(&self, update: StatusUpdate) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(update);
        }
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn uninstalls(&self) -> Vec<Vec<ModuleId>> {
        self.uninstalls.lock().clone()
    }

    pub fn confirmations(&self) -> Vec<(ConfirmationHandle, bool)> {
        self.confirmations.lock().clone()
    }

    pub fn fail_next_start(&self, code: i32) {
        *self.fail_start.lock() = Some(code);
    }

    pub fn fail_confirmations(&self) {
        *self.fail_confirmation.lock() = true;
    }

    /// Make start_install block until `release` is called
    pub fn hold_starts(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.hold.lock() = Some(semaphore.clone());
        semaphore
    }

    /// Report a module as installed on the next refresh
    pub fn add_installed(&self, name: &str) {
        self.installed.lock().insert(id(name));
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }
}

#[async_trait]
impl DeliveryBackend for RecordingBackend {
    async fn start_install(&self, module_id: &ModuleId) -> ondemand::Result<SessionHandle> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        let hold = self.hold.lock().clone();
        if let Some(semaphore) = hold {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| Error::backend(e.to_string()))?;
        }

        if let Some(code) = self.fail_start.lock().take() {
            return Err(Error::BackendFailure {
                code,
                message: format!("cannot install {}", module_id),
            });
        }
        Ok(SessionHandle(format!("session-{}", module_id)))
    }

    async fn deferred_uninstall(&self, module_ids: &[ModuleId]) -> ondemand::Result<()> {
        self.uninstalls.lock().push(module_ids.to_vec());
        Ok(())
    }

    async fn resolve_user_confirmation(
        &self,
        handle: &ConfirmationHandle,
        approve: bool,
    ) -> ondemand::Result<()> {
        self.confirmations.lock().push((handle.clone(), approve));
        if *self.fail_confirmation.lock() {
            return Err(Error::backend("confirmation rejected"));
        }
        Ok(())
    }

    async fn installed_modules(&self) -> ondemand::Result<BTreeSet<ModuleId>> {
        Ok(self.installed.lock().clone())
    }

    fn on_status_event(&self, listener: StatusListener) {
        *self.listener.lock() = Some(listener);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Controller over a recording backend with default config
pub fn controller_with(backend: &Arc<RecordingBackend>) -> DeliveryController {
    DeliveryController::new(backend.clone(), &DeliveryConfig::default())
}

/// Wait for a snapshot of `module` matching `pred`, failing after 5 seconds
pub async fn wait_for(
    subscription: &mut SessionSubscription,
    module: &ModuleId,
    pred: impl Fn(&DeliverySession) -> bool,
) -> DeliverySession {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match subscription.next_snapshot().await {
                Some(session) if &session.module_id == module && pred(&session) => {
                    return session;
                }
                Some(_) => continue,
                None => panic!("session stream closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for session snapshot")
}
