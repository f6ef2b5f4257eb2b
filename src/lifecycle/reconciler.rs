use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

use super::control_plane::{AssignmentResponse, EnclaveAssignment};
use crate::attestation::TrustState;
use crate::config::{EnclaveConfig, Tier};

/// Lifecycle phase of the enclave lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Active,
    Backoff,
}

/// A private model the user selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedModel {
    pub model_id: String,
    pub tier: Tier,
}

impl SelectedModel {
    pub fn new(model_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            model_id: model_id.into(),
            tier,
        }
    }
}

/// External signals and completions fed into the reducer.
#[derive(Debug)]
pub enum Event {
    ModelSelected(Option<SelectedModel>),
    Unlocked,
    Locked,
    RequestSucceeded {
        model_id: String,
        response: AssignmentResponse,
    },
    RequestFailed {
        model_id: String,
        error: String,
    },
    HeartbeatTick,
    HeartbeatOk,
    HeartbeatFailed,
    Released,
}

/// Side effects the async shell must execute, in order.
#[derive(Debug)]
pub enum Action {
    Request {
        model: SelectedModel,
        session_id: String,
    },
    Heartbeat {
        assignment_id: String,
    },
    Release {
        assignment_id: String,
    },
    StartHeartbeat,
    StopHeartbeat,
    Verify {
        config: EnclaveConfig,
    },
    Publish(TrustState),
    ClearConfig,
}

/// Level-triggered reconciler over (selected model, vault unlock).
///
/// One owned struct, mutated only inside transitions: current assignment,
/// in-flight flag, per-model failure timestamps. Re-invoking with unchanged
/// inputs emits no actions, and a request is only ever issued after any
/// prior assignment's release action has been emitted.
pub struct Reconciler {
    session_id: String,
    cooldown: Duration,
    strike_limit: u32,

    phase: Phase,
    selected: Option<SelectedModel>,
    unlocked: bool,
    assignment: Option<EnclaveAssignment>,
    in_flight: bool,
    retry_after: HashMap<String, Instant>,
    strikes: u32,
    generation: u64,
    published: Option<TrustState>,
}

impl Reconciler {
    pub fn new(session_id: impl Into<String>, cooldown: Duration, strike_limit: u32) -> Self {
        Self {
            session_id: session_id.into(),
            cooldown,
            strike_limit,
            phase: Phase::Idle,
            selected: None,
            unlocked: false,
            assignment: None,
            in_flight: false,
            retry_after: HashMap::new(),
            strikes: 0,
            generation: 0,
            published: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn assignment(&self) -> Option<&EnclaveAssignment> {
        self.assignment.as_ref()
    }

    /// Record a trust state the shell published on its own (verification
    /// outcomes), so change-detection stays accurate.
    pub fn note_published(&mut self, state: TrustState) {
        self.published = Some(state);
    }

    /// Apply one event and return the actions to execute, in order.
    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            Event::ModelSelected(selection) => {
                self.selected = selection;
            }
            Event::Unlocked => {
                self.unlocked = true;
            }
            Event::Locked => {
                self.unlocked = false;
            }
            Event::RequestSucceeded { model_id, response } => {
                self.in_flight = false;
                self.strikes = 0;

                let still_wanted = self.unlocked
                    && self
                        .selected
                        .as_ref()
                        .is_some_and(|m| m.model_id == model_id);
                if still_wanted {
                    let model = self.selected.clone().expect("checked above");
                    self.retry_after.remove(&model_id);
                    self.generation += 1;
                    tracing::info!(
                        assignment_id = %response.assignment_id,
                        model_id = %model_id,
                        generation = self.generation,
                        "enclave assignment active"
                    );
                    self.assignment = Some(EnclaveAssignment {
                        assignment_id: response.assignment_id.clone(),
                        model_id,
                        tier: model.tier,
                        session_id: self.session_id.clone(),
                        created_at: SystemTime::now(),
                    });
                    self.phase = Phase::Active;
                    actions.push(Action::StartHeartbeat);
                    actions.push(Action::Verify {
                        config: EnclaveConfig {
                            ws_endpoint: response.ws_endpoint,
                            attestation_endpoint: response.attestation_endpoint,
                            public_key: response.public_key,
                            expected_measurements: response.expected_measurements,
                            allow_unverified: response.allow_unverified,
                            generation: self.generation,
                        },
                    });
                    return actions;
                }

                // The trigger went away while the request was in flight:
                // the lease must not be kept.
                tracing::info!(
                    assignment_id = %response.assignment_id,
                    "assignment arrived after trigger cleared, releasing"
                );
                actions.push(Action::Release {
                    assignment_id: response.assignment_id,
                });
            }
            Event::RequestFailed { model_id, error } => {
                self.in_flight = false;
                tracing::warn!(%model_id, %error, "enclave request failed, backing off");
                let deadline = self.cooldown_deadline();
                self.retry_after.insert(model_id, deadline);
                self.phase = Phase::Backoff;
                self.publish(&mut actions, TrustState::Error);
                return actions;
            }
            Event::HeartbeatTick => {
                if let Some(ref assignment) = self.assignment {
                    actions.push(Action::Heartbeat {
                        assignment_id: assignment.assignment_id.clone(),
                    });
                }
                return actions;
            }
            Event::HeartbeatOk => {
                self.strikes = 0;
                return actions;
            }
            Event::HeartbeatFailed => {
                self.strikes += 1;
                if self.strikes < self.strike_limit {
                    return actions;
                }
                // Sustained heartbeat failure means the lease is gone.
                tracing::warn!(
                    strikes = self.strikes,
                    "sustained heartbeat failure, treating assignment as lost"
                );
                self.strikes = 0;
                self.drop_assignment(&mut actions);
                self.phase = Phase::Idle;
            }
            Event::Released => {
                return actions;
            }
        }

        self.reconcile(&mut actions);
        actions
    }

    /// Compare desired against actual and emit the delta.
    fn reconcile(&mut self, actions: &mut Vec<Action>) {
        if self.in_flight {
            return;
        }

        if !self.unlocked {
            self.drop_assignment(actions);
            self.phase = Phase::Idle;
            self.publish(actions, TrustState::Locked);
            return;
        }

        let desired = self.selected.clone();
        let current_model = self.assignment.as_ref().map(|a| a.model_id.clone());

        match (desired, current_model) {
            (None, None) => {
                self.phase = Phase::Idle;
                self.publish(actions, TrustState::Locked);
            }
            (None, Some(_)) => {
                self.drop_assignment(actions);
                self.phase = Phase::Idle;
                self.publish(actions, TrustState::Locked);
            }
            (Some(model), Some(current)) if current == model.model_id => {
                self.phase = Phase::Active;
            }
            (Some(model), Some(_)) => {
                // Model switch: the old lease goes first, then the new request.
                self.drop_assignment(actions);
                self.request(actions, model);
            }
            (Some(model), None) => {
                self.request(actions, model);
            }
        }
    }

    /// Retry deadline with jitter, so many clients backing off from the same
    /// capacity cliff do not retry in lockstep.
    fn cooldown_deadline(&self) -> Instant {
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Instant::now() + self.cooldown.mul_f64(jitter)
    }

    fn request(&mut self, actions: &mut Vec<Action>, model: SelectedModel) {
        if let Some(&deadline) = self.retry_after.get(&model.model_id) {
            if Instant::now() < deadline {
                self.phase = Phase::Backoff;
                self.publish(actions, TrustState::Error);
                return;
            }
        }

        self.in_flight = true;
        self.phase = Phase::Requesting;
        self.publish(actions, TrustState::Connecting);
        actions.push(Action::Request {
            model,
            session_id: self.session_id.clone(),
        });
    }

    fn drop_assignment(&mut self, actions: &mut Vec<Action>) {
        if let Some(assignment) = self.assignment.take() {
            actions.push(Action::StopHeartbeat);
            actions.push(Action::Release {
                assignment_id: assignment.assignment_id,
            });
            actions.push(Action::ClearConfig);
        }
    }

    fn publish(&mut self, actions: &mut Vec<Action>, state: TrustState) {
        if self.published != Some(state) {
            self.published = Some(state);
            actions.push(Action::Publish(state));
        }
    }
}
