//! Access to arbitrary resource types in the cluster.
//!
//! Decorators name their parent and attachment types at runtime, so all
//! reads and writes go through [`DynamicObject`]s and an [`ApiType`]
//! resolved by discovery.

use crate::k8s::{
    watcher, Api, ApiResource, Client, DeleteParams, DynamicObject, EventStream, ListParams,
    Patch, PatchParams, PostParams, ResourceRule, Scope,
};
use anyhow::{anyhow, Context as _, Result};
use futures::prelude::*;
use kube::{
    api::{Preconditions, PropagationPolicy},
    core::{GroupVersion, TypeMeta},
    discovery,
};

const FIELD_MANAGER: &str = "decorator-controller";

/// A resource type resolved against the API server.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiType {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub status_subresource: bool,
}

/// Reads and writes the objects decorators act on.
///
/// Implementations return objects with `apiVersion` and `kind` set.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn resolve(&self, rule: &ResourceRule) -> Result<ApiType>;

    /// Watches all objects of the type across namespaces, optionally
    /// restricted by a label selector.
    fn watch(&self, api: &ApiType, labels: Option<String>) -> EventStream<DynamicObject>;

    async fn get(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>>;

    async fn list(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        labels: &str,
    ) -> kube::Result<Vec<DynamicObject>>;

    async fn create(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject>;

    /// Replaces the object. Fails with a conflict if its resourceVersion is
    /// stale.
    async fn replace(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject>;

    /// Deletes the object if it still has the same uid. Deleting an object
    /// that no longer exists succeeds.
    async fn delete(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<()>;

    /// Applies a JSON merge patch.
    async fn patch(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<DynamicObject>;

    /// Applies a JSON merge patch to the status subresource.
    async fn patch_status(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<DynamicObject>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 409)
}

// === impl ApiType ===

impl ApiType {
    /// Tests whether an object or owner reference with this apiVersion and
    /// kind is of this type.
    pub fn is(&self, api_version: &str, kind: &str) -> bool {
        self.resource.api_version == api_version && self.resource.kind == kind
    }

    pub fn is_type_of(&self, obj: &DynamicObject) -> bool {
        obj.types
            .as_ref()
            .is_some_and(|t| self.is(&t.api_version, &t.kind))
    }

    fn types(&self) -> TypeMeta {
        TypeMeta {
            api_version: self.resource.api_version.clone(),
            kind: self.resource.kind.clone(),
        }
    }

    /// Sets `apiVersion` and `kind` on objects the server returned without
    /// them.
    pub fn typed(&self, mut obj: DynamicObject) -> DynamicObject {
        if obj.types.is_none() {
            obj.types = Some(self.types());
        }
        obj
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.resource.group.is_empty() {
            write!(f, "{}", self.resource.plural)
        } else {
            write!(f, "{}.{}", self.resource.plural, self.resource.group)
        }
    }
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, api: &ApiType, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if api.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &api.resource)
            }
            _ => Api::all_with(self.client.clone(), &api.resource),
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn resolve(&self, rule: &ResourceRule) -> Result<ApiType> {
        let gv = rule
            .api_version
            .parse::<GroupVersion>()
            .with_context(|| format!("invalid apiVersion {:?}", rule.api_version))?;
        let group = discovery::oneshot::pinned_group(&self.client, &gv)
            .await
            .with_context(|| format!("failed to discover {}", rule.api_version))?;

        let (resource, caps) = group
            .versioned_resources(&gv.version)
            .into_iter()
            .find(|(ar, _)| ar.plural == rule.resource)
            .ok_or_else(|| {
                anyhow!(
                    "resource {} not served by {}",
                    rule.resource,
                    rule.api_version
                )
            })?;

        let status_subresource = caps
            .subresources
            .iter()
            .any(|(sub, _)| sub.plural.ends_with("status"));
        Ok(ApiType {
            resource,
            namespaced: matches!(caps.scope, Scope::Namespaced),
            status_subresource,
        })
    }

    fn watch(&self, api: &ApiType, labels: Option<String>) -> EventStream<DynamicObject> {
        let mut config = watcher::Config::default();
        if let Some(labels) = labels.as_deref() {
            config = config.labels(labels);
        }
        let api = api.clone();
        watcher::watcher(self.api(&api, None), config)
            .map_ok(move |ev| match ev {
                watcher::Event::Apply(obj) => watcher::Event::Apply(api.typed(obj)),
                watcher::Event::InitApply(obj) => watcher::Event::InitApply(api.typed(obj)),
                watcher::Event::Delete(obj) => watcher::Event::Delete(api.typed(obj)),
                ev => ev,
            })
            .boxed()
    }

    async fn get(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>> {
        let obj = self.api(api, namespace).get_opt(name).await?;
        Ok(obj.map(|o| api.typed(o)))
    }

    async fn list(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        labels: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        let list = self
            .api(api, namespace)
            .list(&ListParams::default().labels(labels))
            .await?;
        Ok(list.items.into_iter().map(|o| api.typed(o)).collect())
    }

    async fn create(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self
            .api(api, obj.metadata.namespace.as_deref())
            .create(&params, obj)
            .await?;
        Ok(api.typed(created))
    }

    async fn replace(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        let replaced = self
            .api(api, obj.metadata.namespace.as_deref())
            .replace(name, &params, obj)
            .await?;
        Ok(api.typed(replaced))
    }

    async fn delete(&self, api: &ApiType, obj: &DynamicObject) -> kube::Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: Some(Preconditions {
                uid: obj.metadata.uid.clone(),
                resource_version: None,
            }),
            ..Default::default()
        };
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        match self
            .api(api, obj.metadata.namespace.as_deref())
            .delete(name, &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn patch(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<DynamicObject> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patched = self
            .api(api, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?;
        Ok(api.typed(patched))
    }

    async fn patch_status(
        &self,
        api: &ApiType,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<DynamicObject> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patched = self
            .api(api, namespace)
            .patch_status(name, &params, &Patch::Merge(patch))
            .await?;
        Ok(api.typed(patched))
    }
}
