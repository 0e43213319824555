use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// Point-in-time view of a Deployment's rollout counters
///
/// Decoded from the seven fields the tracker depends on; everything else on
/// the object is ignored. Missing fields read as zero / false.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired_replicas: i64,
    pub updated_replicas: i64,
    pub ready_replicas: i64,
    pub current_replicas: i64,
    pub paused: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawWorkload {
    metadata: RawMetadata,
    spec: RawSpec,
    status: RawStatus,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMetadata {
    generation: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawSpec {
    replicas: i64,
    paused: bool,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawStatus {
    observed_generation: i64,
    replicas: i64,
    updated_replicas: i64,
    ready_replicas: i64,
}

impl WorkloadSnapshot {
    pub fn from_object(object: &DynamicObject) -> Result<Self, serde_json::Error> {
        let raw: RawWorkload = serde_json::from_value(serde_json::to_value(object)?)?;
        Ok(WorkloadSnapshot {
            generation: raw.metadata.generation,
            observed_generation: raw.status.observed_generation,
            desired_replicas: raw.spec.replicas,
            updated_replicas: raw.status.updated_replicas,
            ready_replicas: raw.status.ready_replicas,
            current_replicas: raw.status.replicas,
            paused: raw.spec.paused,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gateway::mock::{deployment, Counters};
    use serde_json::json;

    #[test]
    fn test_from_object_reads_all_counters() {
        let counters = Counters {
            generation: 7,
            observed_generation: 6,
            desired: 3,
            updated: 2,
            ready: 1,
            current: 4,
            paused: true,
        };
        let snapshot = WorkloadSnapshot::from_object(&deployment("ns", "web", counters)).unwrap();

        assert_eq!(
            snapshot,
            WorkloadSnapshot {
                generation: 7,
                observed_generation: 6,
                desired_replicas: 3,
                updated_replicas: 2,
                ready_replicas: 1,
                current_replicas: 4,
                paused: true,
            }
        );
    }

    #[test]
    fn test_missing_status_reads_as_zero() {
        let mut obj = deployment("ns", "web", Counters::observed(2, 3));
        obj.data.as_object_mut().unwrap().remove("status");

        let snapshot = WorkloadSnapshot::from_object(&obj).unwrap();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.desired_replicas, 3);
        assert_eq!(snapshot.observed_generation, 0);
        assert_eq!(snapshot.ready_replicas, 0);
    }

    #[test]
    fn test_malformed_counter_is_a_decode_error() {
        let mut obj = deployment("ns", "web", Counters::observed(2, 3));
        obj.data["status"]["readyReplicas"] = json!("three");

        assert!(WorkloadSnapshot::from_object(&obj).is_err());
    }
}
