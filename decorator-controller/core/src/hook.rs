use decorator_controller_k8s_api::{DecoratorController, DynamicObject};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// The body POSTed to a decorator's sync or finalize webhook.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub controller: DecoratorController,
    pub object: DynamicObject,
    pub attachments: Vec<DynamicObject>,
    pub finalizing: bool,
}

/// The webhook's answer: the complete desired attachment set for the
/// parent, plus optional changes to the parent itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(default)]
    pub attachments: Vec<DynamicObject>,

    /// Labels to set on the parent. A `null` value removes the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, Option<String>>>,

    /// Annotations to set on the parent. A `null` value removes the
    /// annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_after_seconds: Option<f64>,

    #[serde(default)]
    pub finalized: bool,
}

impl HookResponse {
    /// The requested resync delay, if the hook asked for a positive one.
    pub fn resync_after(&self) -> Option<Duration> {
        self.resync_after_seconds
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}
