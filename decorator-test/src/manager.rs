//! Runs a decorator manager in the test process.

use crate::k8s::DecoratorController;
use decorator_controller_runtime::{
    core::Backoff, Config, Context, HttpTransport, Invoker, KubeCluster, Metrics, Registry,
};
use futures::prelude::*;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

pub struct Manager {
    registry: Arc<Registry>,
    task: JoinHandle<()>,
}

/// Starts a manager with the given target label selector.
///
/// Only DecoratorControllers matching `scope` are observed, so that
/// concurrently running tests do not see each other's definitions.
pub fn spawn(client: kube::Client, target: &str, scope: &str) -> Manager {
    let ctx = Context {
        cluster: Arc::new(KubeCluster::new(client.clone())),
        hook: Arc::new(Invoker::new(
            HttpTransport::new(),
            Duration::from_secs(10),
            3,
            Backoff::default(),
        )),
        config: Config::default(),
        metrics: Metrics::default(),
    };
    let registry = Arc::new(Registry::new(
        ctx,
        target.parse().expect("target selector must be valid"),
    ));

    let definitions = watcher(
        Api::<DecoratorController>::all(client),
        watcher::Config::default().labels(scope),
    )
    .default_backoff()
    .filter_map(|ev| {
        future::ready(
            ev.map_err(|error| tracing::warn!(%error, "DecoratorController watch failed"))
                .ok(),
        )
    });
    let task = tokio::spawn({
        let registry = registry.clone();
        async move { registry.run(definitions).await }
    });

    Manager { registry, task }
}

// === impl Manager ===

impl Manager {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn stop(self) {
        self.task.abort();
        self.registry.shutdown().await;
    }
}
