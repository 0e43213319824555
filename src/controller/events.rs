//! Rollout events and the queue that carries them to the caller

use super::snapshot::WorkloadSnapshot;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Progress of a tracked rollout
///
/// Ordered: sessions only ever move forward through this list, except that
/// `Interrupted` can be entered from any non-terminal phase.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Triggering change written, no updated replicas yet
    #[default]
    Pending,
    /// At least one replica runs the new template
    Deploying,
    /// Every desired replica runs the new template
    ReplicasUpdated,
    /// Every desired replica is ready
    ReplicasReady,
    /// The workload was changed again or paused
    Interrupted,
}

impl Phase {
    /// Whether a session stops once it reaches this phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::ReplicasReady | Phase::Interrupted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "Pending",
            Phase::Deploying => "Deploying",
            Phase::ReplicasUpdated => "ReplicasUpdated",
            Phase::ReplicasReady => "ReplicasReady",
            Phase::Interrupted => "Interrupted",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Reached `ReplicasReady`
    Completed,
    /// The workload changed generation or was paused
    Interrupted,
    /// The rollout timeout elapsed first
    TimedOut,
    /// The shutdown signal fired
    Cancelled,
    /// A read or decode failed; see the event's `error`
    Failed,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RolloutEvent {
    pub phase: Phase,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<WorkloadSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the terminal event only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub done: bool,
}

impl RolloutEvent {
    pub(crate) fn progress(
        phase: Phase,
        namespace: &str,
        name: &str,
        snapshot: Option<WorkloadSnapshot>,
    ) -> Self {
        RolloutEvent {
            phase,
            namespace: namespace.to_string(),
            name: name.to_string(),
            snapshot,
            error: None,
            outcome: None,
            done: false,
        }
    }
}

/// Receiving end of the bounded event channel
///
/// Closes once the `RolloutTracker` and every running session are gone.
pub struct EventQueue {
    receiver: mpsc::Receiver<RolloutEvent>,
}

impl EventQueue {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<RolloutEvent>, EventQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, EventQueue { receiver })
    }

    /// Next event, or `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<RolloutEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RolloutEvent> {
        self.receiver.try_recv().ok()
    }
}
