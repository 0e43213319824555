//! In-memory gateway for tests
//!
//! Objects live in a map keyed by (kind, namespace, name). Every call is
//! recorded so tests can assert on ordering and on what never happened.
//! `get` responses for a workload can be scripted to simulate a rollout
//! progressing over successive polls.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{
    object_gvk, object_key, GatewayError, ReplaceFn, ResourceGateway, ResourceMapping, WatchEvent,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

type ObjectRef = (String, String, String);

const KNOWN_KINDS: &[&str] = &[
    "Deployment",
    "Service",
    "ConfigMap",
    "Secret",
    "ServiceAccount",
    "Namespace",
];

/// One recorded gateway call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    pub field_manager: Option<String>,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ObjectRef, DynamicObject>,
    scripted: HashMap<ObjectRef, VecDeque<DynamicObject>>,
    calls: Vec<Call>,
    resource_version: u64,
    conflict_on_replace: bool,
    failing_applies: Vec<String>,
}

impl MockState {
    fn record(&mut self, verb: &'static str, manager: Option<&str>, r: &ObjectRef) {
        self.calls.push(Call {
            verb,
            field_manager: manager.map(str::to_string),
            kind: r.0.clone(),
            namespace: r.1.clone(),
            name: r.2.clone(),
        });
    }

    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is
    pub fn insert(&self, object: DynamicObject) {
        let key = object_ref(&object).unwrap();
        self.state.lock().unwrap().objects.insert(key, object);
    }

    /// Current stored copy of an object
    pub fn stored(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    /// Queue `get` responses for an object
    ///
    /// Each `get` consumes one response; the last one keeps being returned.
    pub fn script(&self, responses: Vec<DynamicObject>) {
        let mut state = self.state.lock().unwrap();
        for response in responses {
            let key = object_ref(&response).unwrap();
            state.scripted.entry(key).or_default().push_back(response);
        }
    }

    /// Make every `replace` fail as if the object changed between read and write
    pub fn fail_replace_with_conflict(&self) {
        self.state.lock().unwrap().conflict_on_replace = true;
    }

    /// Make `apply_merge` on any object called `name` fail
    pub fn fail_apply_for(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_applies
            .push(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_with_verb(&self, verb: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb == verb).collect()
    }
}

fn object_ref(object: &DynamicObject) -> Result<ObjectRef, GatewayError> {
    let gvk = object_gvk(object)?;
    let (namespace, name) = object_key(object)?;
    Ok((gvk.kind, namespace, name))
}

fn not_found(r: &ObjectRef) -> GatewayError {
    GatewayError::NotFound {
        kind: r.0.clone(),
        namespace: r.1.clone(),
        name: r.2.clone(),
    }
}

fn check_kind(gvk: &GroupVersionKind) -> Result<(), GatewayError> {
    if KNOWN_KINDS.contains(&gvk.kind.as_str()) {
        Ok(())
    } else {
        Err(GatewayError::UnknownKind {
            kind: gvk.kind.clone(),
            reason: "no matches for kind".to_string(),
        })
    }
}

fn labels_match(object: &DynamicObject, selector: &str) -> bool {
    let labels = object.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

/// Recursive JSON merge; objects merge key by key, everything else overwrites
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ResourceGateway for MockGateway {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, GatewayError> {
        check_kind(gvk)?;
        Ok(ResourceMapping {
            api_resource: ApiResource::from_gvk(gvk),
            namespaced: gvk.kind != "Namespace",
        })
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, GatewayError> {
        check_kind(gvk)?;
        let key = (gvk.kind.clone(), namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        state.record("get", None, &key);

        if let Some(queue) = state.scripted.get_mut(&key) {
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(response) = response {
                return Ok(response);
            }
        }
        state.objects.get(&key).cloned().ok_or_else(|| not_found(&key))
    }

    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, GatewayError> {
        check_kind(gvk)?;
        let key = (gvk.kind.clone(), namespace.to_string(), String::new());
        let mut state = self.state.lock().unwrap();
        state.record("list", None, &key);
        Ok(state
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| *kind == gvk.kind && ns == namespace)
            .filter(|(_, object)| labels_match(object, selector))
            .map(|(_, object)| {
                // List items come back from the API server without apiVersion/kind
                let mut item = object.clone();
                item.types = None;
                item
            })
            .collect())
    }

    async fn create(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        check_kind(&object_gvk(object)?)?;
        let key = object_ref(object)?;
        let mut state = self.state.lock().unwrap();
        state.record("create", Some(field_manager), &key);

        if state.objects.contains_key(&key) {
            return Err(GatewayError::AlreadyExists {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            });
        }

        let mut created = object.clone();
        created.metadata.generation = Some(1);
        created.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, created.clone());
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
        check_kind(gvk)?;
        let key = (gvk.kind.clone(), namespace.to_string(), name.to_string());
        let current = {
            let mut state = self.state.lock().unwrap();
            state.record("replace", Some(field_manager), &key);
            state.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?
        };
        let resource_version = current.metadata.resource_version.clone();
        let generation = current.metadata.generation.unwrap_or(0);

        let mut updated = transform(current)?;
        updated.metadata.resource_version = resource_version;

        let mut state = self.state.lock().unwrap();
        if state.conflict_on_replace {
            return Err(GatewayError::Conflict {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            });
        }
        updated.metadata.generation = Some(generation + 1);
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn apply_merge(
        &self,
        field_manager: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, GatewayError> {
        check_kind(&object_gvk(object)?)?;
        let key = object_ref(object)?;
        let mut state = self.state.lock().unwrap();
        state.record("apply", Some(field_manager), &key);
        if state.failing_applies.contains(&key.2) {
            return Err(GatewayError::Transform(format!("apply rejected for {}", key.2)));
        }

        let mut current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(&key))?;
        let before = current.data.clone();
        merge(&mut current.data, &object.data);
        if current.data != before {
            current.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        current.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, current.clone());
        Ok(current)
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent, GatewayError>>, GatewayError> {
        check_kind(gvk)?;
        let key = (gvk.kind.clone(), namespace.to_string(), String::new());
        let mut state = self.state.lock().unwrap();
        state.record("watch", None, &key);
        let events: Vec<_> = state
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| *kind == gvk.kind && ns == namespace)
            .map(|(_, object)| Ok(WatchEvent::Applied(object.clone())))
            .collect();
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Replica counters for building Deployment fixtures
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired: i64,
    pub updated: i64,
    pub ready: i64,
    pub current: i64,
    pub paused: bool,
}

impl Counters {
    /// Counters for a rollout at `generation` that the controller has observed
    pub fn observed(generation: i64, desired: i64) -> Self {
        Counters {
            generation,
            observed_generation: generation,
            desired,
            ..Default::default()
        }
    }

    pub fn replicas(mut self, updated: i64, ready: i64, current: i64) -> Self {
        self.updated = updated;
        self.ready = ready;
        self.current = current;
        self
    }
}

pub fn deployment(namespace: &str, name: &str, counters: Counters) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "generation": counters.generation,
            "labels": { "app": name },
        },
        "spec": {
            "replicas": counters.desired,
            "paused": counters.paused,
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": "app", "image": "nginx:1.0" }] },
            },
        },
        "status": {
            "observedGeneration": counters.observed_generation,
            "replicas": counters.current,
            "updatedReplicas": counters.updated,
            "readyReplicas": counters.ready,
        },
    }))
    .unwrap()
}

pub fn config_map(namespace: &str, name: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": { "key": "value" },
    }))
    .unwrap()
}

pub fn service(namespace: &str, name: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": namespace },
        "spec": { "ports": [{ "port": 80 }], "selector": { "app": name } },
    }))
    .unwrap()
}
