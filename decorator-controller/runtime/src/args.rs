use crate::{
    controller::{Config, Context},
    core::Backoff,
    hook::{HttpTransport, Invoker},
    k8s::{labels::Selector, DecoratorController},
    metrics::Metrics,
    registry::Registry,
    KubeCluster,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry as Prometheus;
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "decorator-controller",
    about = "Attaches webhook-computed resources to Kubernetes objects"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "decorator=info,warn",
        env = "DECORATOR_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Only DecoratorControllers whose labels match this selector are
    /// reconciled by this process.
    ///
    /// The default matches every DecoratorController.
    #[clap(long, default_value = "")]
    target_label_selector: Selector,

    /// Workers per DecoratorController.
    #[clap(long, default_value = "5")]
    workers: usize,

    /// Applies to DecoratorControllers that do not set
    /// `resyncPeriodSeconds`.
    #[clap(long, default_value = "600")]
    default_resync_period_secs: u64,

    /// Applies to webhooks that do not set their own timeout.
    #[clap(long, default_value = "10000")]
    hook_timeout_ms: u64,

    /// Additional attempts after a webhook call fails transiently.
    #[clap(long, default_value = "3")]
    hook_retries: u32,

    #[clap(long, default_value = "500")]
    backoff_base_ms: u64,

    #[clap(long, default_value = "300000")]
    backoff_max_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            target_label_selector,
            workers,
            default_resync_period_secs,
            hook_timeout_ms,
            hook_retries,
            backoff_base_ms,
            backoff_max_ms,
        } = self;

        if backoff_base_ms == 0 || backoff_max_ms < backoff_base_ms {
            bail!("--backoff-max-ms must be at least --backoff-base-ms, which must be positive");
        }
        let backoff = Backoff::new(
            Duration::from_millis(backoff_base_ms),
            Duration::from_millis(backoff_max_ms),
        );

        let mut prom = <Prometheus>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("decorator"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hook = Invoker::new(
            HttpTransport::new(),
            Duration::from_millis(hook_timeout_ms),
            hook_retries,
            backoff,
        );
        let ctx = Context {
            cluster: Arc::new(KubeCluster::new(runtime.client())),
            hook: Arc::new(hook),
            config: Config {
                workers,
                default_resync: Duration::from_secs(default_resync_period_secs),
                backoff,
            },
            metrics,
        };

        info!(selector = %target_label_selector, "Watching DecoratorControllers");
        let registry = Arc::new(Registry::new(ctx, target_label_selector));
        let definitions = runtime.watch_all::<DecoratorController>(watcher::Config::default());
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = registry.run(definitions) => {}
                    handle = shutdown.signaled() => {
                        handle.release_after(registry.shutdown()).await;
                    }
                }
            }
            .instrument(info_span!("decoratorcontrollers")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the decorators to stop before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
