//! An in-memory cluster and webhook for tests.

use crate::{
    cluster::{ApiType, Cluster},
    core::{HookRequest, HookResponse},
    hook::{self, SyncHook},
    k8s::{
        decorator::Hook, labels::Selector, watcher, ApiResource, DecoratorController,
        DynamicObject, ErrorResponse, EventStream, ResourceExt, ResourceRule,
    },
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Sender = mpsc::UnboundedSender<watcher::Result<watcher::Event<DynamicObject>>>;
type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    types: Vec<(ResourceRule, ApiType)>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    version: u64,
    writes: Vec<Write>,
    watches: Vec<(ApiType, Option<Selector>, Sender)>,
    resolved: Vec<String>,
    conflicts: usize,
}

/// A write issued against the fake cluster: the operation and the object
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Write(pub &'static str, pub String);

pub(crate) struct FakeHook {
    respond: Box<dyn Fn(&HookRequest) -> Result<HookResponse, hook::Error> + Send + Sync>,
    calls: Mutex<Vec<HookRequest>>,
}

// === impl FakeCluster ===

impl FakeCluster {
    /// Serves `parents` and `children` in `example.com/v1` and core
    /// `configmaps`.
    pub fn new() -> Arc<Self> {
        let cluster = Self::default();
        cluster.register("example.com/v1", "parents", "Parent", true, true);
        cluster.register("example.com/v1", "children", "Child", true, false);
        cluster.register("v1", "configmaps", "ConfigMap", true, false);
        cluster.register("example.com/v1", "clusterparents", "ClusterParent", false, false);
        Arc::new(cluster)
    }

    pub fn register(
        &self,
        api_version: &str,
        plural: &str,
        kind: &str,
        namespaced: bool,
        status_subresource: bool,
    ) {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let api = ApiType {
            resource: ApiResource {
                group,
                version,
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            namespaced,
            status_subresource,
        };
        let rule = ResourceRule {
            api_version: api_version.to_string(),
            resource: plural.to_string(),
        };
        self.state.lock().types.push((rule, api));
    }

    pub fn api(&self, plural: &str) -> ApiType {
        self.state
            .lock()
            .types
            .iter()
            .find(|(r, _)| r.resource == plural)
            .map(|(_, api)| api.clone())
            .expect("unknown resource")
    }

    /// Stores an object as if a client had created it.
    pub fn insert(&self, obj: DynamicObject) -> DynamicObject {
        let api = self.type_of(&obj);
        let mut state = self.state.lock();
        let obj = state.persist(&api, obj, true);
        state.notify(&api, watcher::Event::Apply(obj.clone()));
        obj
    }

    pub fn get_object(&self, plural: &str, ns: Option<&str>, name: &str) -> Option<DynamicObject> {
        let api = self.api(plural);
        self.state.lock().objects.get(&key(&api, ns, name)).cloned()
    }

    pub fn objects(&self, plural: &str) -> Vec<DynamicObject> {
        let api = self.api(plural);
        self.state
            .lock()
            .objects
            .iter()
            .filter(|((p, _, _), _)| *p == api.to_string())
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Marks an object as deleted. It is removed once it has no finalizers.
    pub fn mark_deleted(&self, plural: &str, ns: Option<&str>, name: &str) {
        let api = self.api(plural);
        let mut state = self.state.lock();
        let k = key(&api, ns, name);
        let Some(obj) = state.objects.get_mut(&k) else {
            return;
        };
        obj.metadata.deletion_timestamp = Some(crate::k8s::Time(
            "2024-01-01T00:00:00Z".parse().expect("valid timestamp"),
        ));
        let obj = obj.clone();
        state.version += 1;
        state.settle(&api, k, obj);
    }

    /// Replaces an object's labels without recording a write.
    pub fn relabel(&self, plural: &str, ns: Option<&str>, name: &str, labels: &[(&str, &str)]) {
        let api = self.api(plural);
        let mut state = self.state.lock();
        let k = key(&api, ns, name);
        let Some(mut obj) = state.objects.get(&k).cloned() else {
            return;
        };
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let obj = state.persist(&api, obj, false);
        state.notify(&api, watcher::Event::Apply(obj));
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// The resources resolved so far, by plural name.
    pub fn resolved(&self) -> Vec<String> {
        self.state.lock().resolved.clone()
    }

    /// The resources with open watches, by plural name.
    pub fn watched(&self) -> Vec<String> {
        self.state
            .lock()
            .watches
            .iter()
            .filter(|(_, _, tx)| !tx.is_closed())
            .map(|(api, _, _)| api.resource.plural.clone())
            .collect()
    }

    /// Fails the next `n` replaces and patches with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().conflicts = n;
    }

    fn type_of(&self, obj: &DynamicObject) -> ApiType {
        let types = obj.types.as_ref().expect("object must have types");
        self.state
            .lock()
            .types
            .iter()
            .find(|(_, api)| api.is(&types.api_version, &types.kind))
            .map(|(_, api)| api.clone())
            .expect("unknown type")
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn resolve(&self, rule: &ResourceRule) -> anyhow::Result<ApiType> {
        let mut state = self.state.lock();
        state.resolved.push(rule.resource.clone());
        state
            .types
            .iter()
            .find(|(r, _)| r == rule)
            .map(|(_, api)| api.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown resource {}", rule.resource))
    }

    fn watch(&self, api: &ApiType, labels: Option<String>) -> EventStream<DynamicObject> {
        let selector = labels.map(|l| l.parse::<Selector>().expect("valid selector"));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        let _ = tx.send(Ok(watcher::Event::Init));
        for obj in state.objects.values() {
            if api.is_type_of(obj) && matches(&selector, obj) {
                let _ = tx.send(Ok(watcher::Event::InitApply(obj.clone())));
            }
        }
        let _ = tx.send(Ok(watcher::Event::InitDone));

        state.watches.push((api.clone(), selector, tx));
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn get(
        &self,
        api: &ApiType,
        ns: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>> {
        Ok(self.state.lock().objects.get(&key(api, ns, name)).cloned())
    }

    async fn list(
        &self,
        api: &ApiType,
        ns: Option<&str>,
        labels: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        let selector = Some(labels.parse::<Selector>().expect("valid selector"));
        Ok(self
            .state
            .lock()
            .objects
            .values()
            .filter(|o| api.is_type_of(o))
            .filter(|o| ns.is_none() || o.metadata.namespace.as_deref() == ns)
            .filter(|o| matches(&selector, o))
            .cloned()
            .collect())
    }

    async fn create(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let mut state = self.state.lock();
        let k = key(api, obj.metadata.namespace.as_deref(), &obj.name_any());
        if state.objects.contains_key(&k) {
            return Err(error(409, "AlreadyExists"));
        }
        state.writes.push(Write("create", obj.name_any()));
        let obj = state.persist(api, obj.clone(), true);
        state.notify(api, watcher::Event::Apply(obj.clone()));
        Ok(obj)
    }

    async fn replace(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let mut state = self.state.lock();
        let k = key(api, obj.metadata.namespace.as_deref(), &obj.name_any());
        let Some(current) = state.objects.get(&k) else {
            return Err(error(404, "NotFound"));
        };
        if current.metadata.resource_version != obj.metadata.resource_version {
            return Err(error(409, "Conflict"));
        }
        state.take_conflict()?;
        state.writes.push(Write("replace", obj.name_any()));
        let obj = state.persist(api, obj.clone(), false);
        state.notify(api, watcher::Event::Apply(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<()> {
        let mut state = self.state.lock();
        let k = key(api, obj.metadata.namespace.as_deref(), &obj.name_any());
        let Some(current) = state.objects.get(&k) else {
            return Ok(());
        };
        if obj.metadata.uid.is_some() && current.metadata.uid != obj.metadata.uid {
            return Err(error(409, "Conflict"));
        }
        state.writes.push(Write("delete", obj.name_any()));
        if let Some(obj) = state.objects.remove(&k) {
            state.notify(api, watcher::Event::Delete(obj));
        }
        Ok(())
    }

    async fn patch(
        &self,
        api: &ApiType,
        ns: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        self.state.lock().patch(api, ns, name, patch, "patch")
    }

    async fn patch_status(
        &self,
        api: &ApiType,
        ns: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        let status = json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) });
        self.state
            .lock()
            .patch(api, ns, name, &status, "patch_status")
    }
}

// === impl State ===

impl State {
    fn persist(&mut self, api: &ApiType, mut obj: DynamicObject, created: bool) -> DynamicObject {
        self.version += 1;
        obj.types = Some(kube::core::TypeMeta {
            api_version: api.resource.api_version.clone(),
            kind: api.resource.kind.clone(),
        });
        if created {
            obj.metadata.uid = Some(format!("uid-{}-{}", obj.name_any(), self.version));
        }
        obj.metadata.resource_version = Some(self.version.to_string());
        let k = key(api, obj.metadata.namespace.as_deref(), &obj.name_any());
        self.objects.insert(k, obj.clone());
        obj
    }

    fn patch(
        &mut self,
        api: &ApiType,
        ns: Option<&str>,
        name: &str,
        patch: &Value,
        op: &'static str,
    ) -> kube::Result<DynamicObject> {
        let k = key(api, ns, name);
        let Some(current) = self.objects.get(&k).cloned() else {
            return Err(error(404, "NotFound"));
        };
        if let Some(rv) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(error(409, "Conflict"));
            }
            self.take_conflict()?;
        }

        let mut value = serde_json::to_value(&current).expect("object must serialize");
        merge_patch(&mut value, patch);
        let mut obj: DynamicObject =
            serde_json::from_value(value).expect("patched object must parse");

        self.writes.push(Write(op, name.to_string()));
        self.version += 1;
        obj.metadata.resource_version = Some(self.version.to_string());
        Ok(self.settle(api, k, obj))
    }

    /// Stores an updated object, removing it if it is deleted and has no
    /// finalizers left.
    fn settle(&mut self, api: &ApiType, k: ObjectKey, obj: DynamicObject) -> DynamicObject {
        if obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            self.objects.remove(&k);
            self.notify(api, watcher::Event::Delete(obj.clone()));
        } else {
            self.objects.insert(k, obj.clone());
            self.notify(api, watcher::Event::Apply(obj.clone()));
        }
        obj
    }

    fn take_conflict(&mut self) -> kube::Result<()> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(error(409, "Conflict"));
        }
        Ok(())
    }

    fn notify(&mut self, api: &ApiType, event: watcher::Event<DynamicObject>) {
        self.watches.retain(|(_, _, tx)| !tx.is_closed());
        for (watched, selector, tx) in &self.watches {
            if watched != api {
                continue;
            }
            let obj = match &event {
                watcher::Event::Apply(o) | watcher::Event::Delete(o) => o,
                _ => continue,
            };
            if matches(selector, obj) {
                let _ = tx.send(Ok(match &event {
                    watcher::Event::Delete(o) => watcher::Event::Delete(o.clone()),
                    _ => watcher::Event::Apply(obj.clone()),
                }));
            }
        }
    }
}

fn key(api: &ApiType, ns: Option<&str>, name: &str) -> ObjectKey {
    let ns = ns.filter(|_| api.namespaced).map(str::to_string);
    (api.to_string(), ns, name.to_string())
}

fn matches(selector: &Option<Selector>, obj: &DynamicObject) -> bool {
    selector.as_ref().map_or(true, |s| s.matches_map(obj.labels()))
}

fn error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}

/// Applies a JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge_patch(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

// === impl FakeHook ===

impl FakeHook {
    pub fn new(
        respond: impl Fn(&HookRequest) -> Result<HookResponse, hook::Error> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Default::default(),
        })
    }

    /// Responds with one `Child` named after the parent, carrying the
    /// parent's spec.
    pub fn child_per_parent() -> Arc<Self> {
        Self::new(|req| {
            Ok(HookResponse {
                attachments: vec![child(&req.object.name_any(), req.object.data["spec"].clone())],
                finalized: req.finalizing,
                ..Default::default()
            })
        })
    }

    pub fn calls(&self) -> Vec<HookRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl SyncHook for FakeHook {
    async fn call(&self, _: &Hook, request: &HookRequest) -> Result<HookResponse, hook::Error> {
        self.calls.lock().push(request.clone());
        (self.respond)(request)
    }
}

// === fixtures ===

pub(crate) fn decorator(name: &str, labels: &[(&str, &str)], spec: Value) -> DecoratorController {
    let labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect::<serde_json::Map<_, _>>();
    serde_json::from_value(json!({
        "apiVersion": "metacontroller.k8s.io/v1alpha1",
        "kind": "DecoratorController",
        "metadata": {"name": name, "labels": labels},
        "spec": spec,
    }))
    .expect("valid decorator")
}

/// Decorates `parents` with `children`.
pub(crate) fn spec() -> Value {
    json!({
        "resources": [{"apiVersion": "example.com/v1", "resource": "parents"}],
        "attachments": [{"apiVersion": "example.com/v1", "resource": "children"}],
        "hooks": {"sync": {"webhook": {"url": "http://hook.test/sync"}}},
    })
}

pub(crate) fn parent(name: &str, labels: &[(&str, &str)], spec: Value) -> DynamicObject {
    let labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect::<serde_json::Map<_, _>>();
    serde_json::from_value(json!({
        "apiVersion": "example.com/v1",
        "kind": "Parent",
        "metadata": {"name": name, "namespace": "ns", "labels": labels},
        "spec": spec,
    }))
    .expect("valid parent")
}

pub(crate) fn child(name: &str, spec: Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "example.com/v1",
        "kind": "Child",
        "metadata": {"name": name},
        "spec": spec,
    }))
    .expect("valid child")
}

/// Polls `f` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(what: &str, f: impl Fn() -> bool) {
    let poll = async {
        while !f() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), poll)
        .await
        .is_err()
    {
        panic!("timed out waiting for {what}");
    }
}
