//! Resource gateway over the cluster API
//!
//! All cluster access goes through the `ResourceGateway` trait, which works on
//! untyped `DynamicObject`s so the same code path can create Services,
//! ConfigMaps and Deployments alike:
//! - `KubeGateway` talks to a real cluster via `kube::Client`
//! - `MockGateway` (tests only) keeps objects in memory and records calls

mod client;
#[cfg(test)]
pub mod mock;

pub use client::KubeGateway;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown resource kind {kind}: {reason}")]
    UnknownKind { kind: String, reason: String },

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Object missing required field: {0}")]
    MissingField(&'static str),

    #[error("Failed to decode object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Replace transform failed: {0}")]
    Transform(String),

    #[error("Watch stream failed: {0}")]
    Watch(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

/// Concrete endpoint for a resource kind
#[derive(Clone, Debug)]
pub struct ResourceMapping {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

/// Change notification from `ResourceGateway::watch`
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

/// Transform handed to `ResourceGateway::replace`
///
/// Receives the live object and returns the object to write back. The
/// gateway stamps the live object's resourceVersion onto the result.
pub type ReplaceFn =
    Box<dyn FnOnce(DynamicObject) -> Result<DynamicObject, GatewayError> + Send + 'static>;

/// Stateless facade over the cluster API
///
/// Implementations must be safe to share between the orchestrator and any
/// number of tracker sessions.
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    /// Map a kind to its plural endpoint and scope
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, GatewayError>;

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError>;

    /// List objects of a kind; an empty selector lists everything
    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError>;

    async fn create(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError>;

    /// Read-modify-write guarded by the read's resourceVersion
    async fn replace(
        &self,
        field_manager: &str,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        transform: ReplaceFn,
    ) -> Result<DynamicObject, GatewayError>;

    /// Server-side apply owned by `field_manager`
    async fn apply_merge(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError>;

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent, GatewayError>>, GatewayError>;
}

/// Kind of the primary workload driven by rollouts
pub fn deployment_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(
        <Deployment as k8s_openapi::Resource>::GROUP,
        <Deployment as k8s_openapi::Resource>::VERSION,
        <Deployment as k8s_openapi::Resource>::KIND,
    )
}

/// Split an apiVersion into (group, version); the core group is ""
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Read the kind of an untyped object from its type metadata
pub fn object_gvk(object: &DynamicObject) -> Result<GroupVersionKind, GatewayError> {
    let types = object
        .types
        .as_ref()
        .ok_or(GatewayError::MissingField("apiVersion/kind"))?;
    let (group, version) = parse_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(&group, &version, &types.kind))
}

/// Identity of an object as (namespace, name)
pub fn object_key(object: &DynamicObject) -> Result<(String, String), GatewayError> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or(GatewayError::MissingField("metadata.name"))?;
    Ok((object.metadata.namespace.clone().unwrap_or_default(), name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "gateway_test.rs"]
mod tests;
