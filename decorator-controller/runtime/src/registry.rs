//! Tracks decorator definitions and runs the ones this process is
//! responsible for.
//!
//! A definition is only run if its labels match the process's target
//! selector. Its labels are re-evaluated on every update, so relabeling a
//! definition moves it into or out of this process's shard.

use crate::{
    controller::{self, Context, Handle},
    k8s::{labels::Selector, watcher::Event, DecoratorController, Labels, ResourceExt},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info};

pub struct Registry {
    ctx: Context,
    selector: Selector,
    controllers: Mutex<HashMap<String, Handle>>,
}

// === impl Registry ===

impl Registry {
    pub fn new(ctx: Context, selector: Selector) -> Self {
        Self {
            ctx,
            selector,
            controllers: Mutex::default(),
        }
    }

    /// Tests whether this process is responsible for the definition.
    pub fn selects(&self, definition: &DecoratorController) -> bool {
        self.selector
            .matches(&Labels::from(definition.metadata.labels.clone()))
    }

    /// Processes definition events until the stream ends.
    pub async fn run(&self, events: impl Stream<Item = Event<DecoratorController>>) {
        tokio::pin!(events);

        // Names observed since the current relist started.
        let mut listed = None::<HashSet<String>>;
        while let Some(ev) = events.next().await {
            match ev {
                Event::Init => listed = Some(HashSet::new()),
                Event::InitApply(definition) => {
                    if let Some(listed) = listed.as_mut() {
                        listed.insert(definition.name_any());
                    }
                    self.apply(definition).await;
                }
                Event::InitDone => {
                    let listed = listed.take().unwrap_or_default();
                    let stale = self
                        .controllers
                        .lock()
                        .keys()
                        .filter(|name| !listed.contains(*name))
                        .cloned()
                        .collect::<Vec<_>>();
                    for name in stale {
                        self.delete(&name).await;
                    }
                }
                Event::Apply(definition) => self.apply(definition).await,
                Event::Delete(definition) => self.delete(&definition.name_any()).await,
            }
        }
    }

    /// Starts, restarts or stops the definition's controller so that it runs
    /// the current spec if and only if the definition is selected.
    pub async fn apply(&self, definition: DecoratorController) {
        let name = definition.name_any();
        let selected = self.selects(&definition);

        let stale = {
            let mut controllers = self.controllers.lock();
            match controllers.get(&name) {
                Some(running) if selected && unchanged(running.definition(), &definition) => {
                    return;
                }
                Some(_) => controllers.remove(&name),
                None => None,
            }
        };

        if let Some(handle) = stale {
            info!(%name, "Stopping decorator");
            handle.stop().await;
        }

        if selected {
            info!(%name, "Starting decorator");
            let handle = controller::spawn(definition, self.ctx.clone());
            self.controllers.lock().insert(name, handle);
        } else {
            debug!(%name, "Ignoring decorator outside of target selector");
        }
        self.update_metrics();
    }

    pub async fn delete(&self, name: &str) {
        let stale = self.controllers.lock().remove(name);
        if let Some(handle) = stale {
            info!(%name, "Stopping decorator");
            handle.stop().await;
        }
        self.update_metrics();
    }

    /// Stops every running decorator.
    pub async fn shutdown(&self) {
        let handles = self
            .controllers
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        future::join_all(handles.into_iter().map(Handle::stop)).await;
        self.update_metrics();
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.controllers.lock().contains_key(name)
    }

    /// The names of running decorators, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names = self
            .controllers
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn update_metrics(&self) {
        let n = self.controllers.lock().len();
        self.ctx.metrics.set_active(n);
    }
}

/// Definitions that differ only in bookkeeping metadata need no restart.
fn unchanged(running: &DecoratorController, update: &DecoratorController) -> bool {
    running.spec == update.spec && running.metadata.labels == update.metadata.labels
}

#[cfg(test)]
mod tests;
