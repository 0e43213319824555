//! Application descriptors: where the desired object set comes from

use super::deployer::DeployError;
use kube::core::DynamicObject;
use serde::Deserialize;
use std::path::Path;

/// An application the deployer can roll out
///
/// `generate_objects` must include the primary Deployment, identified by
/// `namespace()` and `deployment_name()`.
pub trait AppTemplate: Send + Sync {
    fn namespace(&self) -> &str;

    fn deployment_name(&self) -> &str;

    /// Desired objects, in the order they should be written
    fn generate_objects(&self) -> Result<Vec<DynamicObject>, DeployError>;
}

/// Reference to an app that already runs on the cluster
///
/// Enough for redeploys; it has no desired objects of its own.
#[derive(Clone, Debug)]
pub struct AppRef {
    pub namespace: String,
    pub deployment_name: String,
}

impl AppRef {
    pub fn new(namespace: impl Into<String>, deployment_name: impl Into<String>) -> Self {
        AppRef {
            namespace: namespace.into(),
            deployment_name: deployment_name.into(),
        }
    }
}

impl AppTemplate for AppRef {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    fn generate_objects(&self) -> Result<Vec<DynamicObject>, DeployError> {
        Err(DeployError::Template(format!(
            "{}/{} is a reference only and has no manifests",
            self.namespace, self.deployment_name
        )))
    }
}

/// App whose objects come from a multi-document YAML manifest
///
/// Objects without a namespace are placed in the app's namespace.
#[derive(Clone, Debug)]
pub struct ManifestTemplate {
    namespace: String,
    deployment_name: String,
    manifest: String,
}

impl ManifestTemplate {
    pub fn new(
        namespace: impl Into<String>,
        deployment_name: impl Into<String>,
        manifest: impl Into<String>,
    ) -> Self {
        ManifestTemplate {
            namespace: namespace.into(),
            deployment_name: deployment_name.into(),
            manifest: manifest.into(),
        }
    }

    pub fn from_file(
        namespace: impl Into<String>,
        deployment_name: impl Into<String>,
        path: &Path,
    ) -> Result<Self, DeployError> {
        let manifest = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Template(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::new(namespace, deployment_name, manifest))
    }
}

impl AppTemplate for ManifestTemplate {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    fn generate_objects(&self) -> Result<Vec<DynamicObject>, DeployError> {
        let mut objects = Vec::new();

        for (index, document) in serde_yaml::Deserializer::from_str(&self.manifest).enumerate() {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| {
                DeployError::Template(format!("document {}: invalid YAML: {}", index, e))
            })?;
            if value.is_null() {
                continue;
            }

            let json = serde_json::to_value(value).map_err(|e| {
                DeployError::Template(format!("document {}: {}", index, e))
            })?;
            let mut object: DynamicObject = serde_json::from_value(json).map_err(|e| {
                DeployError::Template(format!("document {}: not a Kubernetes object: {}", index, e))
            })?;

            if object.types.is_none() {
                return Err(DeployError::InvalidObject(format!(
                    "document {} is missing apiVersion/kind",
                    index
                )));
            }
            if object.metadata.name.is_none() {
                return Err(DeployError::InvalidObject(format!(
                    "document {} is missing metadata.name",
                    index
                )));
            }
            if object.metadata.namespace.is_none() {
                object.metadata.namespace = Some(self.namespace.clone());
            }

            objects.push(object);
        }

        Ok(objects)
    }
}
