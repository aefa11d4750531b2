use std::fmt;

/// Identifies one unit of reconciliation: a parent object as seen by one
/// decorator.
///
/// Keys are plain identities. They never hold the objects themselves, so
/// the queue can deduplicate them and workers always re-read current state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    pub controller: String,
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(
        controller: impl Into<String>,
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            controller: controller.into(),
            group: group.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.kind)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        match &self.namespace {
            Some(ns) => write!(f, "/{}/{}", ns, self.name),
            None => write!(f, "/{}", self.name),
        }
    }
}
