//! The status a decorator records on its parents.

use serde_json::{json, Map, Value};

/// The `<decorator>/Synced` condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: &'static str,
    pub reason: &'static str,
    pub message: String,
}

// === impl Condition ===

impl Condition {
    pub fn type_for(controller: &str) -> String {
        format!("{controller}/Synced")
    }

    pub fn synced(controller: &str) -> Self {
        Self {
            type_: Self::type_for(controller),
            status: "True",
            reason: "Synced",
            message: "Attachments are in sync".to_string(),
        }
    }

    pub fn failed(controller: &str, reason: &'static str, message: String) -> Self {
        Self {
            type_: Self::type_for(controller),
            status: "False",
            reason,
            message,
        }
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Computes the parent status after a pass: the hook's fields are merged
/// over `current` key by key and `condition` replaces any condition of the
/// same type.
///
/// Returns `None` if the result equals `current`. The transition time of a
/// condition whose status did not change is preserved, so repeating a pass
/// yields no write.
pub fn desired(
    current: Option<&Value>,
    hook: Option<&Map<String, Value>>,
    condition: &Condition,
    now: &str,
) -> Option<Value> {
    let mut status = current
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (k, v) in hook.into_iter().flatten() {
        status.insert(k.clone(), v.clone());
    }

    let previous = current
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .and_then(|cs| cs.iter().find(|c| is_type(c, &condition.type_)));
    let transitioned = match previous {
        Some(prev) if prev.get("status").and_then(Value::as_str) == Some(condition.status) => prev
            .get("lastTransitionTime")
            .cloned()
            .unwrap_or_else(|| now.into()),
        _ => now.into(),
    };
    let entry = json!({
        "type": condition.type_,
        "status": condition.status,
        "reason": condition.reason,
        "message": condition.message,
        "lastTransitionTime": transitioned,
    });

    let conditions = status
        .entry("conditions")
        .or_insert_with(|| Value::Array(vec![]));
    if !conditions.is_array() {
        *conditions = Value::Array(vec![]);
    }
    if let Value::Array(list) = conditions {
        match list.iter_mut().find(|c| is_type(c, &condition.type_)) {
            Some(c) => *c = entry,
            None => list.push(entry),
        }
    }

    let status = Value::Object(status);
    (Some(&status) != current).then_some(status)
}

fn is_type(condition: &Value, type_: &str) -> bool {
    condition.get("type").and_then(Value::as_str) == Some(type_)
}
