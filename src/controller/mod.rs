pub mod clock;
pub mod deployer;
pub mod events;
pub mod snapshot;
pub mod template;
pub mod tracker;

pub use deployer::{DeployError, Deployer};
pub use events::{EventQueue, Outcome, Phase, RolloutEvent};
pub use snapshot::WorkloadSnapshot;
pub use template::{AppRef, AppTemplate, ManifestTemplate};
pub use tracker::{RolloutTracker, TrackerConfig};
