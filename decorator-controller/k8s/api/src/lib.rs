#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod decorator;
pub mod duration;
pub mod labels;
mod watch;

pub use self::{
    decorator::{DecoratorController, DecoratorControllerSpec, ParentResourceRule, ResourceRule},
    duration::K8sDuration,
    labels::Labels,
    watch::{Event, EventStream, Watch},
};
pub use k8s_openapi::{
    api::{self, core::v1::Namespace},
    apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextensions,
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{ApiCapabilities, Scope},
    runtime::watcher,
    Client, Error, Resource,
};

/// Labels every attachment with the name of the decorator that owns it.
pub const CONTROLLER_LABEL: &str = "metacontroller.k8s.io/decorator-controller";

/// Records the desired state last applied to an attachment.
pub const LAST_APPLIED_ANNOTATION: &str = "metacontroller.k8s.io/last-applied-configuration";
