use crate::{
    cluster::{self, ApiType, Cluster},
    core::{
        plan::{self, AttachmentId},
        HookRequest, HookResponse, Owner, Plan, ReconcileKey,
    },
    hook::{self, SyncHook},
    k8s::{
        labels::Selector, DecoratorController, DynamicObject, Labels, ParentResourceRule,
        ResourceExt, CONTROLLER_LABEL,
    },
    metrics::Metrics,
    status::{self, Condition},
};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info};

/// A decorator definition with its resource rules resolved against the
/// cluster.
#[derive(Clone, Debug)]
pub struct Decorator {
    pub name: String,
    pub definition: DecoratorController,
    pub labels: Labels,
    pub parents: Vec<Parent>,
    pub attachments: Vec<ApiType>,
}

#[derive(Clone, Debug)]
pub struct Parent {
    pub rule: ParentResourceRule,
    pub api: ApiType,
}

/// Reconciles the parents of one decorator.
pub struct Reconciler {
    decorator: Arc<Decorator>,
    cluster: Arc<dyn Cluster>,
    hook: Arc<dyn SyncHook>,
    metrics: Metrics,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The parent was reconciled. The hook may have asked to be called
    /// again after a delay.
    Synced { resync_after: Option<Duration> },

    /// The parent no longer exists or is not decorated.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is not a parent type of this decorator")]
    UnknownParent(String),

    #[error(transparent)]
    Hook(#[from] hook::Error),

    #[error("invalid hook response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Plan(#[from] plan::Error),

    #[error("conflicting write to {0}")]
    Conflict(String),

    #[error("failed to {op} {target}: {source}")]
    Api {
        op: &'static str,
        target: String,
        #[source]
        source: kube::Error,
    },
}

// === impl Decorator ===

impl Decorator {
    pub async fn resolve(
        definition: DecoratorController,
        cluster: &dyn Cluster,
    ) -> anyhow::Result<Self> {
        let mut parents = Vec::with_capacity(definition.spec.resources.len());
        for rule in &definition.spec.resources {
            let api = cluster.resolve(&rule.rule).await?;
            parents.push(Parent {
                rule: rule.clone(),
                api,
            });
        }

        let mut attachments = Vec::with_capacity(definition.spec.attachments.len());
        for rule in &definition.spec.attachments {
            attachments.push(cluster.resolve(rule).await?);
        }

        Ok(Self {
            name: definition.name_any(),
            labels: definition.metadata.labels.clone().into(),
            definition,
            parents,
            attachments,
        })
    }

    pub fn finalizer(&self) -> String {
        self.definition.finalizer_name()
    }

    /// The label selector that matches every attachment of this decorator.
    pub fn attachment_selector(&self) -> String {
        format!("{CONTROLLER_LABEL}={}", self.name)
    }

    /// The key of a parent object observed through `parent`'s watch.
    pub fn parent_key(&self, parent: &Parent, obj: &DynamicObject) -> Option<ReconcileKey> {
        let namespace = if parent.api.namespaced {
            Some(obj.metadata.namespace.clone()?)
        } else {
            None
        };
        Some(ReconcileKey::new(
            &self.name,
            &parent.api.resource.group,
            &parent.api.resource.kind,
            namespace,
            obj.metadata.name.clone()?,
        ))
    }

    /// The key of the parent that controls an attachment.
    pub fn owner_key(&self, attachment: &DynamicObject) -> Option<ReconcileKey> {
        let owner = attachment
            .owner_references()
            .iter()
            .find(|r| r.controller == Some(true))?;
        let parent = self
            .parents
            .iter()
            .find(|p| p.api.is(&owner.api_version, &owner.kind))?;
        let namespace = if parent.api.namespaced {
            Some(attachment.metadata.namespace.clone()?)
        } else {
            None
        };
        Some(ReconcileKey::new(
            &self.name,
            &parent.api.resource.group,
            &parent.api.resource.kind,
            namespace,
            owner.name.clone(),
        ))
    }

    fn parent(&self, key: &ReconcileKey) -> Option<&Parent> {
        self.parents
            .iter()
            .find(|p| p.api.resource.group == key.group && p.api.resource.kind == key.kind)
    }

    fn attachment_type(&self, obj: &DynamicObject) -> Option<&ApiType> {
        self.attachments.iter().find(|a| a.is_type_of(obj))
    }

    /// Tests whether any rule for the parent's type selects it.
    fn claims(&self, parent: &Parent, obj: &DynamicObject) -> bool {
        self.parents
            .iter()
            .filter(|p| p.api == parent.api)
            .any(|p| self.rule_claims(&p.rule, obj))
    }

    fn rule_claims(&self, rule: &ParentResourceRule, obj: &DynamicObject) -> bool {
        if let Some(selector) = &rule.label_selector {
            if !selector.matches_map(obj.labels()) {
                return false;
            }
        }
        if !rule.matches_annotations(obj.annotations()) {
            return false;
        }

        if rule.claim_by_selector {
            if let Some(selector) = obj.data.pointer("/spec/selector") {
                return match serde_json::from_value::<Selector>(selector.clone()) {
                    Ok(selector) => {
                        self.labels.as_ref().is_empty() || selector.matches(&self.labels)
                    }
                    Err(error) => {
                        debug!(%error, "Ignoring parent with an invalid selector");
                        false
                    }
                };
            }
        }

        true
    }
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        decorator: Arc<Decorator>,
        cluster: Arc<dyn Cluster>,
        hook: Arc<dyn SyncHook>,
        metrics: Metrics,
    ) -> Self {
        Self {
            decorator,
            cluster,
            hook,
            metrics,
        }
    }

    pub fn decorator(&self) -> &Arc<Decorator> {
        &self.decorator
    }

    /// Runs one reconciliation pass for a parent.
    ///
    /// The parent and its attachments are read fresh. If the hook fails or
    /// returns an invalid response, nothing is written.
    pub async fn sync(&self, key: &ReconcileKey) -> Result<Outcome, Error> {
        let result = self.sync_parent(key).await;
        let label = match &result {
            Ok(Outcome::Synced { .. }) => "synced",
            Ok(Outcome::Skipped) => "skipped",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        self.metrics.reconciled(&self.decorator.name, label);
        result
    }

    async fn sync_parent(&self, key: &ReconcileKey) -> Result<Outcome, Error> {
        let parent_type = self
            .decorator
            .parent(key)
            .ok_or_else(|| Error::UnknownParent(key.to_string()))?;
        let api = &parent_type.api;

        let Some(mut parent) = self
            .cluster
            .get(api, key.namespace.as_deref(), &key.name)
            .await
            .map_err(api_error("get", key))?
        else {
            debug!("Parent not found");
            return Ok(Outcome::Skipped);
        };
        if !self.decorator.claims(parent_type, &parent) {
            debug!("Parent is not selected");
            return Ok(Outcome::Skipped);
        }

        let hooks = &self.decorator.definition.spec.hooks;
        let finalizer = self.decorator.finalizer();
        let has_finalizer = parent.finalizers().iter().any(|f| *f == finalizer);
        let deleting = parent.metadata.deletion_timestamp.is_some();

        let hook = match (deleting, &hooks.finalize) {
            (false, finalize) => {
                if finalize.is_some() != has_finalizer {
                    parent = self
                        .set_finalizer(api, &parent, finalize.is_some())
                        .await?;
                }
                &hooks.sync
            }
            (true, Some(finalize)) if has_finalizer => finalize,
            (true, _) => {
                if has_finalizer {
                    self.set_finalizer(api, &parent, false).await?;
                }
                debug!("Parent is being deleted");
                return Ok(Outcome::Skipped);
            }
        };

        let owner = Owner::of(&self.decorator.name, &parent)?;
        let observed = self.observed(api, &parent, &owner).await?;

        let request = HookRequest {
            controller: self.decorator.definition.clone(),
            object: parent.clone(),
            attachments: observed.clone(),
            finalizing: deleting,
        };
        let response = self.hook.call(hook, &request).await;
        self.metrics
            .hook_called(&self.decorator.name, response.is_ok());
        let response = response?;

        let desired = self.desired(api, &parent, &owner, response.attachments.clone())?;
        let plan = Plan::new(desired, observed)?;
        self.apply(&plan).await?;

        let finalized = deleting && response.finalized;
        self.update_parent(api, &parent, &response, finalized)
            .await?;
        if finalized {
            info!("Finalized");
        }

        Ok(Outcome::Synced {
            resync_after: response.resync_after(),
        })
    }

    /// Records a failed pass on the parent's status. Errors are logged and
    /// otherwise ignored.
    pub async fn report_failure(&self, key: &ReconcileKey, error: &Error) {
        let Some(parent_type) = self.decorator.parent(key) else {
            return;
        };
        let parent = match self
            .cluster
            .get(&parent_type.api, key.namespace.as_deref(), &key.name)
            .await
        {
            Ok(Some(parent)) => parent,
            Ok(None) => return,
            Err(error) => {
                debug!(%error, "Failed to read parent");
                return;
            }
        };
        if !self.decorator.claims(parent_type, &parent) {
            return;
        }

        let condition = Condition::failed(&self.decorator.name, error.reason(), error.to_string());
        if let Some(status) = status::desired(
            parent.data.get("status"),
            None,
            &condition,
            &status::now(),
        ) {
            if let Err(error) = self.write_status(&parent_type.api, &parent, status).await {
                debug!(%error, "Failed to record failure on parent status");
            }
        }
    }

    /// The attachments of the parent owned by this decorator.
    async fn observed(
        &self,
        parent_api: &ApiType,
        parent: &DynamicObject,
        owner: &Owner,
    ) -> Result<Vec<DynamicObject>, Error> {
        let selector = self.decorator.attachment_selector();
        let mut observed = Vec::new();
        for api in &self.decorator.attachments {
            let namespace = if api.namespaced && parent_api.namespaced {
                parent.metadata.namespace.as_deref()
            } else {
                None
            };
            let objs = self
                .cluster
                .list(api, namespace, &selector)
                .await
                .map_err(api_error("list", api))?;
            observed.extend(objs.into_iter().filter(|o| owner.owns(o)));
        }
        Ok(observed)
    }

    /// Validates and stamps the hook's attachments.
    fn desired(
        &self,
        parent_api: &ApiType,
        parent: &DynamicObject,
        owner: &Owner,
        attachments: Vec<DynamicObject>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let parent_ns = parent
            .metadata
            .namespace
            .as_deref()
            .filter(|_| parent_api.namespaced);

        attachments
            .into_iter()
            .map(|obj| {
                let id = AttachmentId::of(&obj).ok_or(plan::Error::Unidentified("attachment"))?;
                let api = self.decorator.attachment_type(&obj).ok_or_else(|| {
                    Error::InvalidResponse(format!("{id} is not a declared attachment type"))
                })?;

                let mut obj = owner.stamp(parent_ns.filter(|_| api.namespaced), obj)?;
                if !api.namespaced {
                    obj.metadata.namespace = None;
                } else if obj.metadata.namespace.is_none() {
                    return Err(plan::Error::MissingNamespace(id).into());
                }
                Ok(obj)
            })
            .collect()
    }

    async fn apply(&self, plan: &Plan) -> Result<(), Error> {
        for obj in &plan.create {
            let api = self.type_of(obj)?;
            self.cluster
                .create(api, obj)
                .await
                .map_err(api_error("create", describe(obj)))?;
            info!(attachment = %describe(obj), "Created");
        }

        for obj in &plan.update {
            let api = self.type_of(obj)?;
            self.cluster
                .replace(api, obj)
                .await
                .map_err(api_error("update", describe(obj)))?;
            info!(attachment = %describe(obj), "Updated");
        }

        for obj in &plan.delete {
            let api = self.type_of(obj)?;
            self.cluster
                .delete(api, obj)
                .await
                .map_err(api_error("delete", describe(obj)))?;
            info!(attachment = %describe(obj), "Deleted");
        }

        Ok(())
    }

    fn type_of(&self, obj: &DynamicObject) -> Result<&ApiType, Error> {
        self.decorator
            .attachment_type(obj)
            .ok_or_else(|| Error::InvalidResponse(format!("{} has an unknown type", describe(obj))))
    }

    /// Writes the hook's status, labels and annotations to the parent and
    /// releases it once finalized.
    async fn update_parent(
        &self,
        api: &ApiType,
        parent: &DynamicObject,
        response: &HookResponse,
        finalized: bool,
    ) -> Result<(), Error> {
        let condition = Condition::synced(&self.decorator.name);
        let mut resource_version = parent.resource_version();
        if let Some(status) = status::desired(
            parent.data.get("status"),
            response.status.as_ref(),
            &condition,
            &status::now(),
        ) {
            if let Some(updated) = self.write_status(api, parent, status).await? {
                resource_version = updated.resource_version();
            }
        }

        let mut metadata = Map::new();
        if let Some(labels) = map_patch(parent.labels(), response.labels.as_ref()) {
            metadata.insert("labels".to_string(), labels);
        }
        if let Some(annotations) = map_patch(parent.annotations(), response.annotations.as_ref()) {
            metadata.insert("annotations".to_string(), annotations);
        }
        if finalized {
            let finalizer = self.decorator.finalizer();
            let finalizers = parent
                .finalizers()
                .iter()
                .filter(|f| **f != finalizer)
                .cloned()
                .collect::<Vec<_>>();
            metadata.insert("finalizers".to_string(), json!(finalizers));
            metadata.insert("resourceVersion".to_string(), json!(resource_version));
        }
        if metadata.is_empty() {
            return Ok(());
        }

        match self
            .cluster
            .patch(
                api,
                parent.metadata.namespace.as_deref(),
                &parent.name_any(),
                &json!({ "metadata": metadata }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if cluster::is_not_found(&error) => Ok(()),
            Err(error) => Err(api_error("update", describe(parent))(error)),
        }
    }

    /// Returns the updated parent, or `None` if it no longer exists.
    async fn write_status(
        &self,
        api: &ApiType,
        parent: &DynamicObject,
        status: Value,
    ) -> Result<Option<DynamicObject>, Error> {
        let namespace = parent.metadata.namespace.as_deref();
        let name = parent.name_any();
        let patch = json!({ "status": status });
        let res = if api.status_subresource {
            self.cluster.patch_status(api, namespace, &name, &patch).await
        } else {
            self.cluster.patch(api, namespace, &name, &patch).await
        };
        match res {
            Ok(updated) => Ok(Some(updated)),
            Err(error) if cluster::is_not_found(&error) => Ok(None),
            Err(error) => Err(api_error("update status of", describe(parent))(error)),
        }
    }

    async fn set_finalizer(
        &self,
        api: &ApiType,
        parent: &DynamicObject,
        present: bool,
    ) -> Result<DynamicObject, Error> {
        let finalizer = self.decorator.finalizer();
        let mut finalizers = parent
            .finalizers()
            .iter()
            .filter(|f| **f != finalizer)
            .cloned()
            .collect::<Vec<_>>();
        if present {
            finalizers.push(finalizer);
        }

        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": parent.resource_version(),
            }
        });
        self.cluster
            .patch(
                api,
                parent.metadata.namespace.as_deref(),
                &parent.name_any(),
                &patch,
            )
            .await
            .map_err(api_error("update finalizers of", describe(parent)))
    }
}

// === impl Error ===

impl Error {
    /// A conflict means another writer got there first; the pass should be
    /// retried right away against fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// The reason recorded on the parent's failure condition.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Hook(_) => "HookFailed",
            Self::InvalidResponse(_) | Self::Plan(_) => "InvalidResponse",
            Self::UnknownParent(_) | Self::Conflict(_) | Self::Api { .. } => "ReconcileFailed",
        }
    }
}

/// Maps API errors for `op` on `target`. Conflicts on anything but a create
/// mean a stale read.
fn api_error(op: &'static str, target: impl ToString) -> impl FnOnce(kube::Error) -> Error {
    let target = target.to_string();
    move |source| {
        if op != "create" && cluster::is_conflict(&source) {
            Error::Conflict(target)
        } else {
            Error::Api { op, target, source }
        }
    }
}

fn describe(obj: &DynamicObject) -> String {
    AttachmentId::of(obj)
        .map(|id| id.to_string())
        .unwrap_or_else(|| obj.name_any())
}

/// The merge patch that applies `desired` entries to `current`, or `None`
/// if nothing changes. `None` values delete the entry.
fn map_patch(
    current: &BTreeMap<String, String>,
    desired: Option<&BTreeMap<String, Option<String>>>,
) -> Option<Value> {
    let patch = desired?
        .iter()
        .filter(|(k, v)| current.get(*k) != v.as_ref())
        .map(|(k, v)| (k.clone(), v.clone().map_or(Value::Null, Value::String)))
        .collect::<Map<_, _>>();
    (!patch.is_empty()).then_some(Value::Object(patch))
}
