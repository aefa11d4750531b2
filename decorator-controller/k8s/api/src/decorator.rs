use super::{
    duration::{K8sDuration, ParseError},
    labels,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

pub const API_GROUP: &str = "metacontroller.k8s.io";

/// Declares a decorator: for every parent matching one of `resources`, the
/// sync hook is called and the attachments it returns are reconciled.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "metacontroller.k8s.io",
    version = "v1alpha1",
    kind = "DecoratorController",
    shortname = "dec"
)]
#[serde(rename_all = "camelCase")]
pub struct DecoratorControllerSpec {
    pub resources: Vec<ParentResourceRule>,

    #[serde(default)]
    pub attachments: Vec<ResourceRule>,

    pub hooks: Hooks,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period_seconds: Option<u32>,
}

/// Identifies a resource type by API version and plural resource name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub api_version: String,
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParentResourceRule {
    #[serde(flatten)]
    pub rule: ResourceRule,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<labels::Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<AnnotationSelector>,

    /// When set, a parent that declares `spec.selector` is only decorated if
    /// the decorator's own labels satisfy that selector.
    #[serde(default)]
    pub claim_by_selector: bool,
}

/// Selects parents by annotation, with the same semantics as a label
/// selector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_annotations: Option<labels::Map>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<labels::Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    pub sync: Hook,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<Hook>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub webhook: Webhook,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub url: String,

    /// A Go duration such as `10s` or `1.5s`. Parsed when the hook is
    /// called so a malformed value fails only this decorator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

// === impl DecoratorController ===

impl DecoratorController {
    pub fn finalizer_name(&self) -> String {
        format!(
            "{API_GROUP}/decoratorcontroller-{}",
            kube::ResourceExt::name_any(self)
        )
    }
}

// === impl ParentResourceRule ===

impl ParentResourceRule {
    pub fn matches_annotations(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.annotation_selector
            .as_ref()
            .map_or(true, |sel| sel.matches(annotations))
    }
}

// === impl AnnotationSelector ===

impl AnnotationSelector {
    pub fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        let as_labels = labels::Selector::from_iter(
            self.match_annotations
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let exprs = labels::Selector::from_expressions(
            self.match_expressions.clone().unwrap_or_default(),
        );
        as_labels.matches_map(annotations) && exprs.matches_map(annotations)
    }
}

// === impl Webhook ===

impl Webhook {
    /// Parses the configured timeout, if any.
    pub fn timeout(&self) -> Result<Option<Duration>, InvalidDuration> {
        let Some(timeout) = self.timeout.as_deref() else {
            return Ok(None);
        };
        let parsed = timeout
            .parse::<K8sDuration>()
            .map_err(|error| InvalidDuration::Parse(timeout.to_string(), error))?;
        if parsed.is_negative() {
            return Err(InvalidDuration::Negative(timeout.to_string()));
        }
        Ok(Some(parsed.into()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDuration {
    #[error("invalid duration {0:?}: {1}")]
    Parse(String, #[source] ParseError),

    #[error("negative duration {0:?}")]
    Negative(String),
}
