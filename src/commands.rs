// src/commands.rs
//! Command implementations
//!
//! Each command builds a controller over a simulated backend, runs one
//! operation and reports the sessions it touched, either as a progress bar
//! and summary lines or as JSON lines on stdout.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use ondemand::delivery::InstallScript;
use ondemand::{
    Action, ConfirmationHandle, DeliveryConfig, DeliveryController, DeliverySession, Error,
    ModuleId, SessionEvent, SessionState, SessionSubscription, SimulatedBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::ConfirmChoice;

/// Options for `install`
pub struct InstallOptions {
    pub module: String,
    pub installed: Vec<String>,
    pub size: u64,
    pub chunk: u64,
    pub step_ms: u64,
    pub confirm: Option<ConfirmChoice>,
    pub fail: Option<i32>,
}

fn parse_ids(config: &DeliveryConfig, raw: &[String]) -> Result<Vec<ModuleId>> {
    let ids = raw
        .iter()
        .map(|id| ModuleId::parse_with_limit(id, config.delivery.max_module_id_len))
        .collect::<ondemand::Result<Vec<_>>>()?;
    Ok(ids)
}

fn simulated_controller(
    config: &DeliveryConfig,
    backend: SimulatedBackend,
) -> (DeliveryController, SimulatedBackend) {
    let controller = DeliveryController::new(Arc::new(backend.clone()), config);
    (controller, backend)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Download bar driven by session snapshots
struct SessionProgress {
    bar: ProgressBar,
}

impl SessionProgress {
    fn new(module: &ModuleId, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} {msg:<12} [{bar:40.green/dim}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        bar.set_prefix(module.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    fn update(&self, session: &DeliverySession) {
        self.bar.set_message(session.state.to_string());
        if session.bytes_total > 0 {
            self.bar.set_length(session.bytes_total);
            self.bar.set_position(session.bytes_downloaded);
        }
    }

    fn finish(&self, session: &DeliverySession) {
        self.bar.finish_with_message(session.state.to_string());
    }
}

/// Follow one module's snapshots until its session ends
///
/// A confirmation gate is resolved with `confirm`, or denied when none was
/// given. After a lag the current session is read back from the store, so a
/// gate that scrolled out of the buffer is still seen.
async fn follow_session(
    controller: &DeliveryController,
    subscription: &mut SessionSubscription,
    module: &ModuleId,
    confirm: Option<ConfirmChoice>,
    json: bool,
    progress: &SessionProgress,
) -> Result<DeliverySession> {
    let mut resolved: Option<ConfirmationHandle> = None;
    loop {
        let Some(event) = subscription.recv().await else {
            anyhow::bail!("Session stream closed before {} finished", module);
        };
        let session = match event {
            SessionEvent::Snapshot(session) if &session.module_id == module => session,
            SessionEvent::Snapshot(_) => continue,
            SessionEvent::Lagged(n) => {
                debug!("Missed {} snapshots, reading {} back", n, module);
                match controller.session(module) {
                    Some(session) => session,
                    None => continue,
                }
            }
        };

        if json {
            print_json(&session)?;
        }
        progress.update(&session);

        if session.state == SessionState::RequiresConfirmation
            && session.pending_confirmation.is_some()
            && session.pending_confirmation != resolved
        {
            let approve = confirm.is_some_and(ConfirmChoice::approves);
            info!(
                "{} confirmation for {}",
                if approve { "Approving" } else { "Denying" },
                module
            );
            resolved = session.pending_confirmation.clone();
            controller.resolve_confirmation_for(module, approve).await?;
        }

        if session.state.is_terminal() {
            return Ok(session);
        }
    }
}

/// `ondemand install`
pub async fn cmd_install(config: &DeliveryConfig, opts: InstallOptions, json: bool) -> Result<()> {
    let module = ModuleId::parse_with_limit(&opts.module, config.delivery.max_module_id_len)?;

    let mut script = InstallScript {
        total_bytes: opts.size,
        chunk_bytes: opts.chunk,
        step_delay: Duration::from_millis(opts.step_ms),
        ..InstallScript::default()
    };
    if opts.confirm.is_some() {
        script = script.with_confirmation();
    }
    if let Some(code) = opts.fail {
        script = script.with_failure(code);
    }

    let backend = SimulatedBackend::new()
        .with_installed(parse_ids(config, &opts.installed)?)
        .with_script(script);
    let (controller, _backend) = simulated_controller(config, backend);

    // Subscribe first so the Requested snapshot is not missed
    let mut subscription = controller.subscribe();

    let action = controller.request_install_or_open(&module).await?;
    if json {
        print_json(&action)?;
    }
    match &action {
        Action::Open(id) => {
            if !json {
                println!("{} is installed, opening", id);
            }
            return Ok(());
        }
        Action::AlreadyInProgress(id) => {
            if !json {
                println!("{} is already being installed", id);
            }
            return Ok(());
        }
        Action::InstallStarted(id) => info!("Install of {} started", id),
    }

    let progress = SessionProgress::new(&module, json);
    let last = follow_session(
        &controller,
        &mut subscription,
        &module,
        opts.confirm,
        json,
        &progress,
    )
    .await?;
    progress.finish(&last);

    match last.state {
        SessionState::Installed => {
            if !json {
                println!("Installed {} ({} bytes)", module, last.bytes_total);
            }
            Ok(())
        }
        SessionState::Canceled => {
            if !json {
                println!("Install of {} canceled", module);
            }
            Ok(())
        }
        SessionState::Failed(code) => Err(Error::BackendFailure {
            code,
            message: format!("delivery of {} failed", module),
        }
        .into()),
        other => anyhow::bail!("Unexpected final state {} for {}", other, module),
    }
}

/// `ondemand uninstall`
pub async fn cmd_uninstall(
    config: &DeliveryConfig,
    modules: Vec<String>,
    installed: Vec<String>,
    json: bool,
) -> Result<()> {
    let backend = SimulatedBackend::new().with_installed(parse_ids(config, &installed)?);
    let (controller, backend) = simulated_controller(config, backend);
    let mut subscription = controller.subscribe();

    controller.uninstall(&modules).await?;

    for event in subscription.drain() {
        if let SessionEvent::Snapshot(session) = event {
            if json {
                print_json(&session)?;
            } else {
                println!("Scheduled removal of {}", session.module_id);
            }
        }
    }
    debug!("Backend still reports {} installed modules", backend.installed().len());
    Ok(())
}

/// `ondemand serve`
#[cfg(feature = "server")]
pub async fn cmd_serve(
    config: &DeliveryConfig,
    bind: Option<String>,
    installed: Vec<String>,
) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let backend = SimulatedBackend::new().with_installed(parse_ids(config, &installed)?);
    let (controller, _backend) = simulated_controller(config, backend);
    let modules = controller.refresh_installed().await?;
    info!("{} modules installed at startup", modules.len());

    let app = ondemand::delivery::routes::build_router(controller);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind, e))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_state(controller: &DeliveryController, module: &ModuleId, state: SessionState) {
        for _ in 0..500 {
            if controller.session(module).is_some_and(|s| s.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never reached {}", module, state);
    }

    #[tokio::test]
    async fn test_follow_resolves_gate_missed_by_lag() {
        let config = DeliveryConfig::default().with_event_buffer(1);
        let backend =
            SimulatedBackend::new().with_script(InstallScript::quick(10, 5).with_confirmation());
        let (controller, backend) = simulated_controller(&config, backend);
        let module = ModuleId::parse("maps").unwrap();

        let mut subscription = controller.subscribe();
        controller.request_install_or_open(&module).await.unwrap();
        wait_for_state(&controller, &module, SessionState::RequiresConfirmation).await;

        // Push the gate snapshot out of the one-slot buffer
        controller.install_or_open("camera").await.unwrap();

        let progress = SessionProgress::new(&module, true);
        let last = tokio::time::timeout(
            Duration::from_secs(5),
            follow_session(
                &controller,
                &mut subscription,
                &module,
                Some(ConfirmChoice::Approve),
                false,
                &progress,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(last.state, SessionState::Installed);
        assert!(backend.installed().contains(&module));
    }

    #[tokio::test]
    async fn test_follow_denies_without_choice() {
        let config = DeliveryConfig::default();
        let backend =
            SimulatedBackend::new().with_script(InstallScript::quick(10, 5).with_confirmation());
        let (controller, _backend) = simulated_controller(&config, backend);
        let module = ModuleId::parse("maps").unwrap();

        let mut subscription = controller.subscribe();
        controller.request_install_or_open(&module).await.unwrap();

        let progress = SessionProgress::new(&module, true);
        let last = tokio::time::timeout(
            Duration::from_secs(5),
            follow_session(&controller, &mut subscription, &module, None, false, &progress),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(last.state, SessionState::Canceled);
    }
}
