//! Runs one decorator: watches its parents and attachments and reconciles
//! parents on a pool of workers.

use crate::{
    cluster::{ApiType, Cluster},
    core::{Backoff, ReconcileKey, WorkQueue},
    hook::SyncHook,
    k8s::{watcher::Event, DecoratorController, ResourceExt, Watch},
    metrics::Metrics,
    reconcile::{Decorator, Outcome, Reconciler},
};
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything a controller needs from the process.
#[derive(Clone)]
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub hook: Arc<dyn SyncHook>,
    pub config: Config,
    pub metrics: Metrics,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Workers per decorator.
    pub workers: usize,

    /// Applies to decorators that do not set `resyncPeriodSeconds`.
    pub default_resync: Duration,

    /// Delays retries of failed passes.
    pub backoff: Backoff,
}

/// A running decorator. Dropping the handle does not stop it; call
/// [`Handle::stop`].
pub struct Handle {
    definition: DecoratorController,
    queue: WorkQueue<ReconcileKey>,
    signal: drain::Signal,
}

const MIN_RESYNC_PERIOD: Duration = Duration::from_secs(1);
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Parents observed through this decorator's watches.
type Known = Arc<Mutex<HashSet<ReconcileKey>>>;

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 5,
            default_resync: Duration::from_secs(600),
            backoff: Backoff::default(),
        }
    }
}

/// Starts reconciling a decorator in the background.
///
/// Resource types are resolved before watches start. Until they resolve,
/// for instance because a CRD is not yet installed, resolution is retried
/// with backoff.
pub fn spawn(definition: DecoratorController, ctx: Context) -> Handle {
    let (signal, drain) = drain::channel();
    let queue = WorkQueue::new(ctx.config.backoff);
    let name = definition.name_any();

    tokio::spawn(
        run(definition.clone(), ctx, queue.clone(), drain)
            .instrument(info_span!("decorator", %name)),
    );

    Handle {
        definition,
        queue,
        signal,
    }
}

// === impl Handle ===

impl Handle {
    pub fn definition(&self) -> &DecoratorController {
        &self.definition
    }

    /// Stops all watches and workers. Completes once in-flight passes have
    /// finished.
    pub async fn stop(self) {
        self.queue.shut_down();
        self.signal.drain().await;
    }
}

async fn run(
    definition: DecoratorController,
    ctx: Context,
    queue: WorkQueue<ReconcileKey>,
    drain: drain::Watch,
) {
    let decorator = tokio::select! {
        biased;
        _ = drain.clone().signaled() => return,
        decorator = resolve(definition, &*ctx.cluster, ctx.config.backoff) => Arc::new(decorator),
    };
    info!(
        parents = decorator.parents.len(),
        attachments = decorator.attachments.len(),
        "Started"
    );

    let known = Known::default();
    for (i, parent) in decorator.parents.iter().enumerate() {
        tokio::spawn(
            watch_parents(
                decorator.clone(),
                i,
                ctx.cluster.clone(),
                queue.clone(),
                known.clone(),
                drain.clone(),
            )
            .instrument(info_span!("parents", resource = %parent.api)),
        );
    }
    for api in &decorator.attachments {
        tokio::spawn(
            watch_attachments(
                decorator.clone(),
                api.clone(),
                ctx.cluster.clone(),
                queue.clone(),
                drain.clone(),
            )
            .instrument(info_span!("attachments", resource = %api)),
        );
    }

    let period = decorator
        .definition
        .spec
        .resync_period_seconds
        .map(|s| Duration::from_secs(s.into()))
        .unwrap_or(ctx.config.default_resync)
        .max(MIN_RESYNC_PERIOD);
    tokio::spawn(resync(period, queue.clone(), known, drain.clone()).in_current_span());

    let reconciler = Arc::new(Reconciler::new(
        decorator,
        ctx.cluster.clone(),
        ctx.hook.clone(),
        ctx.metrics.clone(),
    ));
    for id in 0..ctx.config.workers.max(1) {
        tokio::spawn(
            work(reconciler.clone(), queue.clone(), drain.clone())
                .instrument(info_span!("worker", id)),
        );
    }
}

async fn resolve(
    definition: DecoratorController,
    cluster: &dyn Cluster,
    backoff: Backoff,
) -> Decorator {
    let mut failures = 0;
    loop {
        match Decorator::resolve(definition.clone(), cluster).await {
            Ok(decorator) => return decorator,
            Err(error) => {
                failures += 1;
                let delay = backoff.delay(failures);
                warn!(%error, ?delay, "Failed to resolve resources");
                time::sleep(delay).await;
            }
        }
    }
}

async fn watch_parents(
    decorator: Arc<Decorator>,
    index: usize,
    cluster: Arc<dyn Cluster>,
    queue: WorkQueue<ReconcileKey>,
    known: Known,
    drain: drain::Watch,
) {
    let parent = &decorator.parents[index];
    let selector = parent
        .rule
        .label_selector
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    // Keys seen since the last relist started.
    let mut listed = HashSet::new();
    loop {
        let mut watch = Watch::new(cluster.watch(&parent.api, selector.clone()));
        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                ev = watch.recv() => ev,
            };
            match ev {
                Some(Event::Init) => listed.clear(),
                Some(Event::InitApply(obj)) => {
                    if let Some(key) = decorator.parent_key(parent, &obj) {
                        listed.insert(key.clone());
                        known.lock().insert(key.clone());
                        queue.add(key);
                    }
                }
                Some(Event::InitDone) => {
                    // Parents that disappeared while the watch was down.
                    let mut known = known.lock();
                    let stale = known
                        .iter()
                        .filter(|k| {
                            k.group == parent.api.resource.group
                                && k.kind == parent.api.resource.kind
                                && !listed.contains(*k)
                        })
                        .cloned()
                        .collect::<Vec<_>>();
                    for key in stale {
                        known.remove(&key);
                        queue.add(key);
                    }
                }
                Some(Event::Apply(obj)) => {
                    if let Some(key) = decorator.parent_key(parent, &obj) {
                        known.lock().insert(key.clone());
                        queue.add(key);
                    }
                }
                Some(Event::Delete(obj)) => {
                    if let Some(key) = decorator.parent_key(parent, &obj) {
                        known.lock().remove(&key);
                        queue.add(key);
                    }
                }
                None => {
                    debug!("Watch ended");
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = time::sleep(WATCH_RESTART_DELAY) => {}
        }
    }
}

async fn watch_attachments(
    decorator: Arc<Decorator>,
    api: ApiType,
    cluster: Arc<dyn Cluster>,
    queue: WorkQueue<ReconcileKey>,
    drain: drain::Watch,
) {
    let selector = decorator.attachment_selector();
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        let mut watch = Watch::new(cluster.watch(&api, Some(selector.clone())));
        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                ev = watch.recv() => ev,
            };
            match ev {
                Some(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj)) => {
                    if let Some(key) = decorator.owner_key(&obj) {
                        queue.add(key);
                    }
                }
                Some(Event::Init | Event::InitDone) => {}
                None => {
                    debug!("Watch ended");
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = time::sleep(WATCH_RESTART_DELAY) => {}
        }
    }
}

/// Periodically requeues every known parent.
async fn resync(
    period: Duration,
    queue: WorkQueue<ReconcileKey>,
    known: Known,
    drain: drain::Watch,
) {
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = interval.tick() => {}
        }
        let keys = known.lock().iter().cloned().collect::<Vec<_>>();
        debug!(parents = keys.len(), "Resyncing");
        for key in keys {
            queue.add(key);
        }
    }
}

async fn work(reconciler: Arc<Reconciler>, queue: WorkQueue<ReconcileKey>, drain: drain::Watch) {
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        let key = tokio::select! {
            biased;
            _ = &mut shutdown => return,
            key = queue.next() => match key {
                Some(key) => key,
                None => return,
            },
        };

        let span = info_span!("sync", parent = %key);
        match reconciler.sync(&key).instrument(span.clone()).await {
            Ok(Outcome::Synced { resync_after }) => {
                queue.forget(&key);
                if let Some(delay) = resync_after {
                    queue.add_after(key.clone(), delay);
                }
            }
            Ok(Outcome::Skipped) => queue.forget(&key),
            Err(error) if error.is_conflict() => {
                debug!(parent: &span, %error, "Retrying");
                queue.add(key.clone());
            }
            Err(error) => {
                reconciler
                    .report_failure(&key, &error)
                    .instrument(span.clone())
                    .await;
                let delay = queue.add_rate_limited(key.clone());
                warn!(parent: &span, %error, ?delay, "Failed to reconcile");
            }
        }
        queue.done(&key);
    }
}
