use super::{
    object_gvk, object_key, GatewayError, ReplaceFn, ResourceGateway, ResourceMapping, WatchEvent,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{pinned_kind, Scope};
use kube::runtime::watcher;
use kube::Client;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

type MappingKey = (String, String, String);

/// Production gateway backed by a `kube::Client`
///
/// Kind-to-endpoint mappings come from API discovery and are cached for the
/// lifetime of the gateway. A cache miss triggers a discovery round trip;
/// concurrent misses for the same kind may both query the API server, the
/// last writer wins.
pub struct KubeGateway {
    client: Client,
    mappings: RwLock<HashMap<MappingKey, ResourceMapping>>,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        KubeGateway {
            client,
            mappings: RwLock::new(HashMap::new()),
        }
    }

    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, GatewayError> {
        let mapping = self.resolve(gvk).await?;
        let api = if mapping.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &mapping.api_resource)
        } else {
            Api::all_with(self.client.clone(), &mapping.api_resource)
        };
        Ok(api)
    }
}

fn mapping_key(gvk: &GroupVersionKind) -> MappingKey {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

/// Translate API status codes into gateway errors
///
/// 404 becomes `NotFound`, 409 becomes `AlreadyExists` or `Conflict`
/// depending on the reason the API server reports.
fn classify(err: kube::Error, kind: &str, namespace: &str, name: &str) -> GatewayError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => GatewayError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            GatewayError::AlreadyExists {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => GatewayError::Conflict {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => GatewayError::Kube(other),
    }
}

#[async_trait]
impl ResourceGateway for KubeGateway {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, GatewayError> {
        let key = mapping_key(gvk);
        if let Some(mapping) = self.mappings.read().await.get(&key) {
            return Ok(mapping.clone());
        }

        let (api_resource, capabilities) =
            pinned_kind(&self.client, gvk)
                .await
                .map_err(|e| GatewayError::UnknownKind {
                    kind: format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind),
                    reason: e.to_string(),
                })?;
        let mapping = ResourceMapping {
            api_resource,
            namespaced: matches!(capabilities.scope, Scope::Namespaced),
        };

        debug!(
            kind = %gvk.kind,
            plural = %mapping.api_resource.plural,
            namespaced = mapping.namespaced,
            "Resolved resource mapping"
        );

        self.mappings.write().await.insert(key, mapping.clone());
        Ok(mapping)
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError> {
        let api = self.api_for(gvk, namespace).await?;
        api.get(name)
            .await
            .map_err(|e| classify(e, &gvk.kind, namespace, name))
    }

    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError> {
        let api = self.api_for(gvk, namespace).await?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        let gvk = object_gvk(object)?;
        let (namespace, name) = object_key(object)?;
        let api = self.api_for(&gvk, &namespace).await?;
        let params = PostParams {
            dry_run: false,
            field_manager: Some(field_manager.to_string()),
        };

        let created = api
            .create(&params, object)
            .await
            .map_err(|e| classify(e, &gvk.kind, &namespace, &name))?;

        info!(
            kind = %gvk.kind,
            namespace = ?namespace,
            name = ?name,
            field_manager = field_manager,
            "Created object"
        );
        Ok(created)
    }

    async fn replace(
        &self,
        field_manager: &str,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        transform: ReplaceFn,
    ) -> Result<DynamicObject, GatewayError> {
        let api = self.api_for(gvk, namespace).await?;
        let current = api
            .get(name)
            .await
            .map_err(|e| classify(e, &gvk.kind, namespace, name))?;
        let resource_version = current.metadata.resource_version.clone();

        let mut updated = transform(current)?;
        updated.metadata.resource_version = resource_version;

        let params = PostParams {
            dry_run: false,
            field_manager: Some(field_manager.to_string()),
        };
        let replaced = api
            .replace(name, &params, &updated)
            .await
            .map_err(|e| classify(e, &gvk.kind, namespace, name))?;

        info!(
            kind = %gvk.kind,
            namespace = ?namespace,
            name = ?name,
            field_manager = field_manager,
            "Replaced object"
        );
        Ok(replaced)
    }

    async fn apply_merge(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        let gvk = object_gvk(object)?;
        let (namespace, name) = object_key(object)?;
        let api = self.api_for(&gvk, &namespace).await?;

        let applied = api
            .patch(&name, &PatchParams::apply(field_manager), &Patch::Apply(object))
            .await
            .map_err(|e| classify(e, &gvk.kind, &namespace, &name))?;

        debug!(
            kind = %gvk.kind,
            namespace = ?namespace,
            name = ?name,
            field_manager = field_manager,
            generation = ?applied.metadata.generation,
            "Applied object"
        );
        Ok(applied)
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent, GatewayError>>, GatewayError> {
        let api = self.api_for(gvk, namespace).await?;
        let stream = watcher(api, watcher::Config::default())
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(GatewayError::Watch(e.to_string()))),
                }
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
