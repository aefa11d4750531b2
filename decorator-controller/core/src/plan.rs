//! Computes the writes that bring a parent's attachments to the state its
//! sync hook asked for.

use decorator_controller_k8s_api::{
    DynamicObject, OwnerReference, ResourceExt, CONTROLLER_LABEL, LAST_APPLIED_ANNOTATION,
};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Metadata fields owned by the API server. They never take part in
/// comparisons.
const MANAGED_METADATA: &[&str] = &[
    "creationTimestamp",
    "deletionGracePeriodSeconds",
    "deletionTimestamp",
    "generation",
    "managedFields",
    "resourceVersion",
    "selfLink",
    "uid",
];

/// The identity of an attachment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// The parent an attachment belongs to, as recorded on the attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub controller: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is missing apiVersion, kind or metadata.name")]
    Unidentified(&'static str),

    #[error("parent {0} has no uid")]
    MissingUid(String),

    #[error("attachment {0} is namespaced but neither it nor its parent has a namespace")]
    MissingNamespace(AttachmentId),

    #[error("attachment {0} must be in its parent's namespace {1}")]
    ForeignNamespace(AttachmentId, String),

    #[error("attachment {0} appears more than once in the desired set")]
    Duplicate(AttachmentId),

    #[error("failed to convert attachment {0}: {1}")]
    Json(AttachmentId, #[source] serde_json::Error),
}

/// The partition of desired and observed attachments into writes.
///
/// Every identity in either input appears in exactly one of the four sets.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub create: Vec<DynamicObject>,
    pub update: Vec<DynamicObject>,
    pub delete: Vec<DynamicObject>,
    pub unchanged: Vec<AttachmentId>,
}

// === impl AttachmentId ===

impl AttachmentId {
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.api_version, self.kind)?;
        match &self.namespace {
            Some(ns) => write!(f, " {}/{}", ns, self.name),
            None => write!(f, " {}", self.name),
        }
    }
}

// === impl Owner ===

impl Owner {
    pub fn of(controller: impl Into<String>, parent: &DynamicObject) -> Result<Self, Error> {
        let types = parent.types.as_ref().ok_or(Error::Unidentified("parent"))?;
        let name = parent.metadata.name.clone().ok_or(Error::Unidentified("parent"))?;
        let uid = parent
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::MissingUid(name.clone()))?;
        Ok(Self {
            controller: controller.into(),
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name,
            uid,
        })
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Tests whether the object is an attachment of this parent managed by
    /// this decorator.
    pub fn owns(&self, obj: &DynamicObject) -> bool {
        obj.labels().get(CONTROLLER_LABEL) == Some(&self.controller)
            && obj.owner_references().iter().any(|r| r.uid == self.uid)
    }

    /// Tags a desired attachment with the ownership label and an owner
    /// reference to the parent, defaulting its namespace to the parent's.
    ///
    /// Owner references cannot cross namespaces, so an attachment of a
    /// namespaced parent must live in the parent's namespace.
    pub fn stamp(
        &self,
        parent_namespace: Option<&str>,
        mut obj: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        if let Some(parent) = parent_namespace {
            let ns = obj
                .metadata
                .namespace
                .get_or_insert_with(|| parent.to_string());
            if ns.as_str() != parent {
                let id = AttachmentId::of(&obj).ok_or(Error::Unidentified("attachment"))?;
                return Err(Error::ForeignNamespace(id, parent.to_string()));
            }
        }

        obj.labels_mut()
            .insert(CONTROLLER_LABEL.to_string(), self.controller.clone());

        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.uid != self.uid);
        refs.push(self.owner_reference());

        Ok(obj)
    }
}

// === impl Plan ===

impl Plan {
    /// Partitions stamped `desired` attachments and currently `observed`
    /// attachments by identity.
    ///
    /// Observed attachments with no counterpart in `desired` are deleted; the
    /// desired set replaces the observed one completely.
    pub fn new(desired: Vec<DynamicObject>, observed: Vec<DynamicObject>) -> Result<Self, Error> {
        let mut observed = observed
            .into_iter()
            .filter_map(|obj| AttachmentId::of(&obj).map(|id| (id, obj)))
            .collect::<BTreeMap<_, _>>();

        let mut plan = Plan::default();
        let mut seen = BTreeSet::new();
        for obj in desired {
            let id = AttachmentId::of(&obj).ok_or(Error::Unidentified("attachment"))?;
            if !seen.insert(id.clone()) {
                return Err(Error::Duplicate(id));
            }

            match observed.remove(&id) {
                None => plan.create.push(with_last_applied(&id, obj)?),
                Some(current) => match updated(&id, &current, obj)? {
                    Some(obj) => plan.update.push(obj),
                    None => plan.unchanged.push(id),
                },
            }
        }
        plan.delete = observed.into_values().collect();

        Ok(plan)
    }

    /// True if applying the plan issues no writes.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Records the desired configuration on the object itself so that a later
/// pass can tell which fields it previously set.
fn with_last_applied(id: &AttachmentId, obj: DynamicObject) -> Result<DynamicObject, Error> {
    let mut value = desired_value(id, obj)?;
    let applied = value.to_string();
    annotations_mut(&mut value).insert(LAST_APPLIED_ANNOTATION.to_string(), applied.into());
    serde_json::from_value(value).map_err(|e| Error::Json(id.clone(), e))
}

/// Returns the object to write if `current` must change to reflect
/// `desired`.
fn updated(
    id: &AttachmentId,
    current: &DynamicObject,
    desired: DynamicObject,
) -> Result<Option<DynamicObject>, Error> {
    let desired = desired_value(id, desired)?;
    let current = serde_json::to_value(current).map_err(|e| Error::Json(id.clone(), e))?;
    let last_applied = current
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str::<Value>(s).ok());

    let mut merged = merge(&current, last_applied.as_ref(), &desired);
    annotations_mut(&mut merged).insert(
        LAST_APPLIED_ANNOTATION.to_string(),
        desired.to_string().into(),
    );

    if normalized(&merged) == normalized(&current) {
        return Ok(None);
    }
    serde_json::from_value(merged)
        .map(Some)
        .map_err(|e| Error::Json(id.clone(), e))
}

/// The hook's desired object as JSON, without fields it may not set.
fn desired_value(id: &AttachmentId, obj: DynamicObject) -> Result<Value, Error> {
    let mut value = serde_json::to_value(obj).map_err(|e| Error::Json(id.clone(), e))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in MANAGED_METADATA {
                meta.remove(*field);
            }
            if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
                annotations.remove(LAST_APPLIED_ANNOTATION);
            }
        }
    }
    Ok(value)
}

/// Three-way merge of `desired` onto `observed`.
///
/// Keys set in `desired` win; objects are merged key by key, any other value
/// is replaced. Keys present in `last_applied` but dropped from `desired`
/// are removed. Everything else in `observed` is kept.
pub fn merge(observed: &Value, last_applied: Option<&Value>, desired: &Value) -> Value {
    let (Value::Object(observed), Value::Object(desired)) = (observed, desired) else {
        return desired.clone();
    };
    let last_applied = last_applied.and_then(Value::as_object);

    let mut merged = observed.clone();
    for key in last_applied.into_iter().flat_map(Map::keys) {
        if !desired.contains_key(key) {
            merged.remove(key);
        }
    }
    for (key, value) in desired {
        let value = match observed.get(key) {
            Some(current) => merge(
                current,
                last_applied.and_then(|l| l.get(key)),
                value,
            ),
            None => value.clone(),
        };
        merged.insert(key.clone(), value);
    }

    Value::Object(merged)
}

/// The object without server-managed fields.
fn normalized(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in MANAGED_METADATA {
                meta.remove(*field);
            }
        }
    }
    value
}

fn annotations_mut(value: &mut Value) -> &mut Map<String, Value> {
    let root = ensure_object(value);
    let meta = ensure_object(root.entry("metadata").or_insert_with(|| Value::Object(Map::new())));
    ensure_object(
        meta.entry("annotations")
            .or_insert_with(|| Value::Object(Map::new())),
    )
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().expect("value must be an object")
}
