//! Deployment orchestration
//!
//! Writes an app's desired objects and triggers fresh rollouts of its
//! Deployment. Two field managers keep the two kinds of write apart:
//! - `{prefix}-manager` owns full objects written by `deploy_app`
//! - `{prefix}-deployer` owns only the redeploy annotation on the pod
//!   template, so a redeploy never conflicts with a concurrent full apply
//!
//! Operations return as soon as their writes land. Rollout progress, when a
//! tracker is supplied, is reported through the tracker's event queue.

use super::clock::{format_timestamp, Clock, SystemClock};
use super::template::AppTemplate;
use super::tracker::RolloutTracker;
use chrono::{DateTime, Utc};
use crate::gateway::{
    deployment_gvk, object_gvk, object_key, GatewayError, ResourceGateway,
};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Deployment {namespace}/{name} is not among the app's desired objects")]
    PrimaryWorkloadMissing { namespace: String, name: String },

    #[error("Failed to generate desired objects: {0}")]
    Template(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

pub struct Deployer {
    prefix: String,
    gateway: Arc<dyn ResourceGateway>,
    clock: Arc<dyn Clock>,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl Deployer {
    pub fn new(prefix: impl Into<String>, gateway: Arc<dyn ResourceGateway>) -> Self {
        Deployer {
            prefix: prefix.into(),
            gateway,
            clock: Arc::new(SystemClock),
            last_stamp: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Field manager for redeploy annotations
    pub fn deployer_manager(&self) -> String {
        format!("{}-deployer", self.prefix)
    }

    /// Field manager for full objects
    pub fn object_manager(&self) -> String {
        format!("{}-manager", self.prefix)
    }

    /// Pod-template annotation whose value forces a new rollout
    pub fn redeploy_annotation(&self) -> String {
        format!("{}/redeployAt", self.deployer_manager())
    }

    /// Redeploy timestamp, strictly later than any this deployer used before
    ///
    /// Two redeploys must never carry the same value, or the second patch is a
    /// no-op and starts no rollout.
    fn next_stamp(&self) -> String {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let stamp = match *last {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        format_timestamp(stamp)
    }

    /// Minimal apply body that touches only the redeploy annotation
    ///
    /// Type metadata comes from the Deployment kind rather than `object`, since
    /// items of a list response carry no apiVersion/kind.
    pub fn build_redeploy_patch(&self, object: &DynamicObject) -> Result<DynamicObject, DeployError> {
        let types = ApiResource::from_gvk(&deployment_gvk());
        let (namespace, name) = object_key(object)?;

        let mut annotations = Map::new();
        annotations.insert(
            self.redeploy_annotation(),
            Value::String(self.next_stamp()),
        );

        let patch = json!({
            "apiVersion": types.api_version,
            "kind": types.kind,
            "metadata": {
                "name": name,
                "namespace": namespace,
            },
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": annotations,
                    },
                },
            },
        });
        serde_json::from_value(patch).map_err(|e| DeployError::InvalidObject(e.to_string()))
    }

    async fn redeploy_object(&self, object: &DynamicObject) -> Result<DynamicObject, DeployError> {
        let patch = self.build_redeploy_patch(object)?;
        let applied = self
            .gateway
            .apply_merge(&self.deployer_manager(), &patch)
            .await
            .map_err(|e| {
                error!(
                    namespace = ?patch.metadata.namespace,
                    deployment = ?patch.metadata.name,
                    error = %e,
                    "Failed to apply redeploy annotation"
                );
                e
            })?;

        info!(
            namespace = ?applied.metadata.namespace,
            deployment = ?applied.metadata.name,
            generation = ?applied.metadata.generation,
            "Triggered rollout"
        );
        Ok(applied)
    }

    fn start_tracking(&self, tracker: Option<&RolloutTracker>, live: &DynamicObject) {
        if let Some(tracker) = tracker {
            tracker.track(self.gateway.clone(), live);
        }
    }

    /// Trigger a fresh rollout of the app's Deployment
    pub async fn redeploy_app(
        &self,
        app: &dyn AppTemplate,
        tracker: Option<&RolloutTracker>,
    ) -> Result<(), DeployError> {
        let deployment = self
            .gateway
            .get(&deployment_gvk(), app.namespace(), app.deployment_name())
            .await?;
        let live = self.redeploy_object(&deployment).await?;
        self.start_tracking(tracker, &live);
        Ok(())
    }

    /// Redeploy every Deployment in `namespace` accepted by `should_redeploy`
    ///
    /// Runs one at a time and stops at the first failure; Deployments handled
    /// before the failure stay redeployed. Returns how many were redeployed.
    pub async fn redeploy_all<F>(
        &self,
        namespace: &str,
        should_redeploy: F,
        tracker: Option<&RolloutTracker>,
    ) -> Result<usize, DeployError>
    where
        F: Fn(&DynamicObject) -> bool,
    {
        let deployments = self
            .gateway
            .list_by_label(&deployment_gvk(), namespace, "")
            .await?;

        let mut redeployed = 0;
        for deployment in deployments.iter().filter(|d| should_redeploy(d)) {
            let live = self.redeploy_object(deployment).await?;
            self.start_tracking(tracker, &live);
            redeployed += 1;
        }

        info!(
            namespace = ?namespace,
            listed = deployments.len(),
            redeployed = redeployed,
            "Redeployed namespace"
        );
        Ok(redeployed)
    }

    /// Write the app's desired objects, then track its Deployment
    ///
    /// With `replace_existing`, each object is replaced in place and created
    /// only if it does not exist yet. Otherwise every object is created and an
    /// existing one is an error. The app's Deployment must be among the
    /// desired objects; that is checked before anything is written.
    pub async fn deploy_app(
        &self,
        app: &dyn AppTemplate,
        replace_existing: bool,
        tracker: Option<&RolloutTracker>,
    ) -> Result<(), DeployError> {
        let namespace = app.namespace();
        let deployment_name = app.deployment_name();
        let objects = app.generate_objects()?;

        let primary = objects
            .iter()
            .position(|obj| is_primary(obj, namespace, deployment_name))
            .ok_or_else(|| DeployError::PrimaryWorkloadMissing {
                namespace: namespace.to_string(),
                name: deployment_name.to_string(),
            })?;

        info!(
            namespace = ?namespace,
            deployment = ?deployment_name,
            objects = objects.len(),
            replace_existing = replace_existing,
            "Deploying app"
        );

        let manager = self.object_manager();
        let mut primary_live = None;
        for (index, object) in objects.into_iter().enumerate() {
            let live = self
                .write_object(&manager, object, replace_existing)
                .await?;
            if index == primary {
                primary_live = Some(live);
            }
        }

        if let Some(live) = primary_live {
            self.start_tracking(tracker, &live);
        }
        Ok(())
    }

    async fn write_object(
        &self,
        manager: &str,
        object: DynamicObject,
        replace_existing: bool,
    ) -> Result<DynamicObject, DeployError> {
        let gvk = object_gvk(&object)?;
        let (namespace, name) = object_key(&object)?;

        if replace_existing {
            let desired = object.clone();
            let replaced = self
                .gateway
                .replace(
                    manager,
                    &gvk,
                    &namespace,
                    &name,
                    Box::new(move |_live| Ok(desired)),
                )
                .await;
            match replaced {
                Ok(live) => return Ok(live),
                Err(e) if e.is_not_found() => {
                    debug!(
                        kind = %gvk.kind,
                        namespace = ?namespace,
                        name = ?name,
                        "Object does not exist yet, creating"
                    );
                }
                Err(e) => {
                    error!(kind = %gvk.kind, namespace = ?namespace, name = ?name, error = %e, "Failed to replace object");
                    return Err(e.into());
                }
            }
        }

        self.gateway.create(manager, &object).await.map_err(|e| {
            error!(kind = %gvk.kind, namespace = ?namespace, name = ?name, error = %e, "Failed to create object");
            e.into()
        })
    }
}

fn is_primary(object: &DynamicObject, namespace: &str, name: &str) -> bool {
    let kind_matches = object
        .types
        .as_ref()
        .map(|t| t.kind == deployment_gvk().kind)
        .unwrap_or(false);
    kind_matches
        && object.metadata.namespace.as_deref() == Some(namespace)
        && object.metadata.name.as_deref() == Some(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployer_test.rs"]
mod tests;
