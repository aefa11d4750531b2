#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use decorator_controller_core as core;
pub use decorator_controller_k8s_api as k8s;

mod args;
pub mod cluster;
pub mod controller;
pub mod hook;
mod metrics;
pub mod reconcile;
pub mod registry;
mod status;

#[cfg(test)]
mod test_util;

pub use self::{
    args::Args,
    cluster::{Cluster, KubeCluster},
    controller::{Config, Context},
    hook::{HttpTransport, Invoker, SyncHook},
    metrics::Metrics,
    registry::Registry,
};
