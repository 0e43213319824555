//! Rollout tracking state machine
//!
//! One session per triggered rollout, running as its own tokio task. A
//! session polls the Deployment at a fixed interval and moves through
//! `Pending → Deploying → ReplicasUpdated → ReplicasReady`, or jumps to
//! `Interrupted` when the workload is changed again or paused.
//!
//! Every cluster read and every sleep is raced against the session deadline
//! and the optional shutdown signal. Sessions share nothing but the event
//! queue; they never retry a failed read.

use super::events::{EventQueue, Outcome, Phase, RolloutEvent};
use super::snapshot::WorkloadSnapshot;
use crate::gateway::{deployment_gvk, GatewayError, ResourceGateway};
use crate::shutdown::{cancelled, ShutdownSignal};
use kube::core::DynamicObject;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Failed to decode workload status: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Upper bound on a whole session, polls and event delivery included
    pub rollout_timeout: Duration,
    pub check_interval: Duration,
    /// Also require `status.replicas == spec.replicas` before `ReplicasReady`,
    /// so pods of the previous ReplicaSet still terminating are not counted
    pub strict: bool,
    /// 0: terminal event only; 1: also `Deploying`; 2+: everything
    pub verbosity: u8,
    pub queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            rollout_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(2),
            strict: false,
            verbosity: 1,
            queue_capacity: 16,
        }
    }
}

/// What one snapshot means for a session in a given phase
#[derive(Debug, PartialEq, Eq)]
pub enum Evaluation {
    Interrupted,
    /// The Deployment controller has not observed the watched generation yet
    Stale,
    /// Phases entered on this cycle, in order; possibly none
    Advanced(Vec<Phase>),
}

fn successor(phase: Phase) -> Option<Phase> {
    match phase {
        Phase::Pending => Some(Phase::Deploying),
        Phase::Deploying => Some(Phase::ReplicasUpdated),
        Phase::ReplicasUpdated => Some(Phase::ReplicasReady),
        Phase::ReplicasReady | Phase::Interrupted => None,
    }
}

/// Condition for entering `next` from its predecessor
fn gate_open(next: Phase, snapshot: &WorkloadSnapshot, strict: bool) -> bool {
    match next {
        Phase::Deploying => snapshot.updated_replicas > 0,
        Phase::ReplicasUpdated => snapshot.updated_replicas >= snapshot.desired_replicas,
        Phase::ReplicasReady => {
            snapshot.ready_replicas == snapshot.desired_replicas
                && (!strict || snapshot.current_replicas == snapshot.desired_replicas)
        }
        Phase::Pending | Phase::Interrupted => false,
    }
}

/// Minimum verbosity for announcing entry into a phase
fn announce_level(phase: Phase) -> Option<u8> {
    match phase {
        Phase::Deploying => Some(1),
        Phase::ReplicasUpdated => Some(2),
        _ => None,
    }
}

/// Evaluate one snapshot against the current phase
///
/// Advances as far as the snapshot justifies in a single pass, so a
/// Deployment that is already fully rolled out goes from `Pending` straight
/// to `ReplicasReady`.
pub fn evaluate(
    phase: Phase,
    watched_generation: i64,
    snapshot: &WorkloadSnapshot,
    strict: bool,
) -> Evaluation {
    if snapshot.generation != watched_generation {
        return Evaluation::Interrupted;
    }
    if snapshot.observed_generation != watched_generation {
        return Evaluation::Stale;
    }
    if snapshot.paused {
        return Evaluation::Interrupted;
    }

    let mut entered = Vec::new();
    let mut current = phase;
    while let Some(next) = successor(current) {
        if !gate_open(next, snapshot, strict) {
            break;
        }
        entered.push(next);
        current = next;
    }
    Evaluation::Advanced(entered)
}

/// Spawns rollout tracking sessions that report into one `EventQueue`
#[derive(Clone)]
pub struct RolloutTracker {
    config: Arc<TrackerConfig>,
    events: mpsc::Sender<RolloutEvent>,
    shutdown: Option<ShutdownSignal>,
}

impl RolloutTracker {
    pub fn new(config: TrackerConfig) -> (Self, EventQueue) {
        let (events, queue) = EventQueue::channel(config.queue_capacity);
        let tracker = RolloutTracker {
            config: Arc::new(config),
            events,
            shutdown: None,
        };
        (tracker, queue)
    }

    /// Cancel every session started from this tracker when `signal` fires
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Start tracking the rollout triggered by the write that returned `object`
    ///
    /// The session watches `object`'s current generation. Aborting the
    /// returned handle stops the session without a terminal event; fire the
    /// shutdown signal instead to get one.
    pub fn track(&self, gateway: Arc<dyn ResourceGateway>, object: &DynamicObject) -> JoinHandle<()> {
        let session = Session {
            gateway,
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
            name: object.metadata.name.clone().unwrap_or_default(),
            watched_generation: object.metadata.generation.unwrap_or(0),
            phase: Phase::Pending,
            deadline: Instant::now() + self.config.rollout_timeout,
        };
        tokio::spawn(session.run())
    }
}

enum Halt {
    TimedOut,
    Cancelled,
}

impl Halt {
    fn outcome(&self) -> Outcome {
        match self {
            Halt::TimedOut => Outcome::TimedOut,
            Halt::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Run `fut` unless the deadline passes or shutdown fires first
async fn within<F: Future>(
    deadline: Instant,
    shutdown: &mut Option<ShutdownSignal>,
    fut: F,
) -> Result<F::Output, Halt> {
    tokio::select! {
        biased;
        _ = cancelled(shutdown) => Err(Halt::Cancelled),
        _ = sleep_until(deadline) => Err(Halt::TimedOut),
        output = fut => Ok(output),
    }
}

async fn fetch_snapshot(
    gateway: &dyn ResourceGateway,
    namespace: &str,
    name: &str,
) -> Result<WorkloadSnapshot, TrackError> {
    let object = gateway.get(&deployment_gvk(), namespace, name).await?;
    Ok(WorkloadSnapshot::from_object(&object)?)
}

struct Settled {
    outcome: Outcome,
    snapshot: Option<WorkloadSnapshot>,
    error: Option<TrackError>,
}

impl Settled {
    fn halted(halt: Halt) -> Self {
        Settled {
            outcome: halt.outcome(),
            snapshot: None,
            error: None,
        }
    }
}

struct Session {
    gateway: Arc<dyn ResourceGateway>,
    events: mpsc::Sender<RolloutEvent>,
    shutdown: Option<ShutdownSignal>,
    config: Arc<TrackerConfig>,
    namespace: String,
    name: String,
    watched_generation: i64,
    phase: Phase,
    deadline: Instant,
}

impl Session {
    async fn run(mut self) {
        info!(
            namespace = ?self.namespace,
            deployment = ?self.name,
            generation = self.watched_generation,
            "Tracking rollout"
        );

        if self.config.verbosity >= 2 {
            let started = RolloutEvent::progress(Phase::Pending, &self.namespace, &self.name, None);
            self.post(started).await;
        }

        let settled = self.poll_until_settled().await;

        match (&settled.outcome, &settled.error) {
            (Outcome::Completed, _) => info!(
                namespace = ?self.namespace,
                deployment = ?self.name,
                "Rollout completed"
            ),
            (_, Some(error)) => warn!(
                namespace = ?self.namespace,
                deployment = ?self.name,
                phase = %self.phase,
                error = %error,
                "Rollout tracking aborted"
            ),
            (outcome, None) => info!(
                namespace = ?self.namespace,
                deployment = ?self.name,
                phase = %self.phase,
                outcome = ?outcome,
                "Rollout tracking finished"
            ),
        }

        let terminal = RolloutEvent {
            phase: self.phase,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            snapshot: settled.snapshot,
            error: settled.error.map(|e| e.to_string()),
            outcome: Some(settled.outcome),
            done: true,
        };
        self.post(terminal).await;
    }

    async fn poll_until_settled(&mut self) -> Settled {
        loop {
            let read = fetch_snapshot(self.gateway.as_ref(), &self.namespace, &self.name);
            let snapshot = match within(self.deadline, &mut self.shutdown, read).await {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(error)) => {
                    return Settled {
                        outcome: Outcome::Failed,
                        snapshot: None,
                        error: Some(error),
                    }
                }
                Err(halt) => return Settled::halted(halt),
            };

            match evaluate(
                self.phase,
                self.watched_generation,
                &snapshot,
                self.config.strict,
            ) {
                Evaluation::Interrupted => {
                    self.phase = Phase::Interrupted;
                    return Settled {
                        outcome: Outcome::Interrupted,
                        snapshot: None,
                        error: None,
                    };
                }
                Evaluation::Stale => {
                    debug!(
                        namespace = ?self.namespace,
                        deployment = ?self.name,
                        observed = snapshot.observed_generation,
                        watched = self.watched_generation,
                        "Waiting for controller to observe generation"
                    );
                    if self.config.verbosity >= 2 {
                        let event = RolloutEvent::progress(
                            self.phase,
                            &self.namespace,
                            &self.name,
                            Some(snapshot),
                        );
                        self.post(event).await;
                    }
                }
                Evaluation::Advanced(entered) => {
                    for phase in entered {
                        self.phase = phase;
                        debug!(
                            namespace = ?self.namespace,
                            deployment = ?self.name,
                            phase = %phase,
                            updated = snapshot.updated_replicas,
                            ready = snapshot.ready_replicas,
                            desired = snapshot.desired_replicas,
                            "Rollout phase advanced"
                        );
                        let announce = announce_level(phase)
                            .map(|level| self.config.verbosity >= level)
                            .unwrap_or(false);
                        if announce {
                            let event = RolloutEvent::progress(
                                phase,
                                &self.namespace,
                                &self.name,
                                Some(snapshot),
                            );
                            self.post(event).await;
                        }
                    }
                    if self.phase.is_terminal() {
                        return Settled {
                            outcome: Outcome::Completed,
                            snapshot: Some(snapshot),
                            error: None,
                        };
                    }
                }
            }

            let pause = sleep(self.config.check_interval);
            if let Err(halt) = within(self.deadline, &mut self.shutdown, pause).await {
                return Settled::halted(halt);
            }
        }
    }

    /// Deliver an event, waiting for queue space only while the session scope
    /// is still open
    async fn post(&mut self, event: RolloutEvent) {
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                debug!(deployment = ?self.name, "Event queue closed, discarding event");
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };

        let done = event.done;
        let send = self.events.send(event);
        match within(self.deadline, &mut self.shutdown, send).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(deployment = ?self.name, "Event queue closed, discarding event");
            }
            Err(_) => warn!(
                namespace = ?self.namespace,
                deployment = ?self.name,
                done = done,
                "Event queue full, dropping event"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "tracker_test.rs"]
mod tests;
