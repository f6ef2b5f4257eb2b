use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::control_plane::ControlPlane;
use super::reconciler::{Action, Event, Reconciler, SelectedModel};
use crate::attestation::{QuoteFetcher, TrustState, Verifier};
use crate::config::TrustedConfig;

/// Tuning for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Identifies this client session to the control plane.
    pub session_id: String,
    /// Fixed heartbeat interval while an assignment is active (default: 30s).
    pub heartbeat_interval: Duration,
    /// Per-model cooldown after a failed enclave request (default: 60s).
    pub backoff_cooldown: Duration,
    /// Consecutive heartbeat failures before the assignment is considered
    /// lost (default: 3).
    pub heartbeat_strike_limit: u32,
}

impl ManagerOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            heartbeat_interval: Duration::from_secs(30),
            backoff_cooldown: Duration::from_secs(60),
            heartbeat_strike_limit: 3,
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn backoff_cooldown(mut self, cooldown: Duration) -> Self {
        self.backoff_cooldown = cooldown;
        self
    }

    pub fn heartbeat_strike_limit(mut self, limit: u32) -> Self {
        self.heartbeat_strike_limit = limit;
        self
    }
}

enum Command {
    SelectModel(Option<SelectedModel>),
    SetUnlocked(bool),
    Shutdown,
}

/// Handle to a running [`AssignmentManager`] task.
///
/// Dropping the handle shuts the manager down: the command channel closes,
/// and the task releases any active assignment on its way out.
pub struct ManagerHandle {
    cmd_tx: mpsc::Sender<Command>,
    trust_rx: watch::Receiver<TrustState>,
    config_rx: watch::Receiver<Option<TrustedConfig>>,
    join: JoinHandle<()>,
}

impl ManagerHandle {
    /// Signal the currently selected private model (or none).
    pub async fn select_model(&self, model: Option<SelectedModel>) {
        let _ = self.cmd_tx.send(Command::SelectModel(model)).await;
    }

    /// Signal the vault unlock state.
    pub async fn set_unlocked(&self, unlocked: bool) {
        let _ = self.cmd_tx.send(Command::SetUnlocked(unlocked)).await;
    }

    /// Subscribe to the authoritative trust state (for the UI surface).
    pub fn trust(&self) -> watch::Receiver<TrustState> {
        self.trust_rx.clone()
    }

    /// Subscribe to the active trusted config consumed by the inference
    /// client. `None` while no verified assignment is live.
    pub fn config(&self) -> watch::Receiver<Option<TrustedConfig>> {
        self.config_rx.clone()
    }

    /// Release the active assignment (if any) and stop the task.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.join.await;
    }
}

/// Owns the enclave lease lifecycle: a single task driving the
/// [`Reconciler`] and executing its actions sequentially, so a release
/// always completes before the next request is issued.
pub struct AssignmentManager;

impl AssignmentManager {
    pub fn spawn(
        control: Arc<dyn ControlPlane>,
        fetcher: Arc<dyn QuoteFetcher>,
        options: ManagerOptions,
    ) -> ManagerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (trust_tx, trust_rx) = watch::channel(TrustState::Locked);
        let (config_tx, config_rx) = watch::channel(None);

        let runtime = Runtime {
            control,
            verifier: Verifier::new(fetcher),
            reconciler: Reconciler::new(
                options.session_id.clone(),
                options.backoff_cooldown,
                options.heartbeat_strike_limit,
            ),
            trust_tx,
            config_tx,
        };

        let join = tokio::spawn(run(runtime, cmd_rx, options.heartbeat_interval));

        ManagerHandle {
            cmd_tx,
            trust_rx,
            config_rx,
            join,
        }
    }
}

struct Runtime {
    control: Arc<dyn ControlPlane>,
    verifier: Verifier,
    reconciler: Reconciler,
    trust_tx: watch::Sender<TrustState>,
    config_tx: watch::Sender<Option<TrustedConfig>>,
}

struct HeartbeatTimer {
    interval: Interval,
    armed: bool,
}

async fn run(mut rt: Runtime, mut cmd_rx: mpsc::Receiver<Command>, heartbeat_interval: Duration) {
    let mut interval = tokio::time::interval(heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut timer = HeartbeatTimer {
        interval,
        armed: false,
    };

    loop {
        let event = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => break,
                Some(Command::SelectModel(model)) => Event::ModelSelected(model),
                Some(Command::SetUnlocked(true)) => Event::Unlocked,
                Some(Command::SetUnlocked(false)) => Event::Locked,
            },
            _ = timer.interval.tick(), if timer.armed => Event::HeartbeatTick,
        };
        dispatch(&mut rt, &mut timer, event).await;
    }

    // Unmount path: every exit releases the lease and clears the timer.
    dispatch(&mut rt, &mut timer, Event::Locked).await;
    tracing::debug!("assignment manager stopped");
}

/// Execute reducer actions in order, feeding RPC outcomes back in as events.
async fn dispatch(rt: &mut Runtime, timer: &mut HeartbeatTimer, event: Event) {
    let mut queue: VecDeque<Action> = rt.reconciler.on_event(event).into();

    while let Some(action) = queue.pop_front() {
        match action {
            Action::Request { model, session_id } => {
                tracing::info!(model_id = %model.model_id, tier = %model.tier, "requesting enclave");
                let follow = match rt
                    .control
                    .request_enclave(&model.model_id, model.tier, &session_id)
                    .await
                {
                    Ok(response) => Event::RequestSucceeded {
                        model_id: model.model_id,
                        response,
                    },
                    Err(e) => Event::RequestFailed {
                        model_id: model.model_id,
                        error: e.to_string(),
                    },
                };
                queue.extend(rt.reconciler.on_event(follow));
            }
            Action::Heartbeat { assignment_id } => {
                let follow = match rt.control.heartbeat(&assignment_id).await {
                    Ok(()) => Event::HeartbeatOk,
                    Err(e) => {
                        tracing::warn!(%assignment_id, error = %e, "heartbeat failed");
                        Event::HeartbeatFailed
                    }
                };
                queue.extend(rt.reconciler.on_event(follow));
            }
            Action::Release { assignment_id } => {
                tracing::info!(%assignment_id, "releasing enclave");
                if let Err(e) = rt.control.release_enclave(&assignment_id).await {
                    // The lease expires server-side anyway; log and move on.
                    tracing::warn!(%assignment_id, error = %e, "release failed");
                }
                queue.extend(rt.reconciler.on_event(Event::Released));
            }
            Action::StartHeartbeat => {
                timer.interval.reset();
                timer.armed = true;
            }
            Action::StopHeartbeat => {
                timer.armed = false;
            }
            Action::Verify { config } => {
                // Verdicts for superseded generations are no longer reachable.
                rt.verifier.evict_before(config.generation);
                match rt.verifier.ensure_verified(&config).await {
                    Ok(attested) => {
                        rt.trust_tx.send_replace(attested.trust);
                        rt.reconciler.note_published(attested.trust);
                        rt.config_tx.send_replace(Some(TrustedConfig {
                            config,
                            trust: attested.trust,
                            enclave_key: attested.enclave_key,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(generation = config.generation, error = %e, "attestation failed");
                        rt.trust_tx.send_replace(TrustState::Error);
                        rt.reconciler.note_published(TrustState::Error);
                        rt.config_tx.send_replace(None);
                    }
                }
            }
            Action::Publish(state) => {
                rt.trust_tx.send_replace(state);
            }
            Action::ClearConfig => {
                rt.config_tx.send_replace(None);
            }
        }
    }
}
