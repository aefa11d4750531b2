use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::{
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    reconciles: Family<Labels, Counter>,
    hook_requests: Family<Labels, Counter>,
    active: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    controller: String,
    result: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<Labels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of reconciliation passes by decorator and result",
            reconciles.clone(),
        );

        let hook_requests = Family::<Labels, Counter>::default();
        reg.register(
            "hook_requests",
            "Total number of sync and finalize webhook calls by decorator and result",
            hook_requests.clone(),
        );

        let active = Gauge::default();
        reg.register(
            "active_controllers",
            "Number of decorator definitions currently reconciled by this process",
            active.clone(),
        );

        Self {
            reconciles,
            hook_requests,
            active,
        }
    }

    pub(crate) fn reconciled(&self, controller: &str, result: &'static str) {
        self.reconciles
            .get_or_create(&Labels {
                controller: controller.to_string(),
                result,
            })
            .inc();
    }

    pub(crate) fn hook_called(&self, controller: &str, ok: bool) {
        self.hook_requests
            .get_or_create(&Labels {
                controller: controller.to_string(),
                result: if ok { "success" } else { "error" },
            })
            .inc();
    }

    pub(crate) fn set_active(&self, n: usize) {
        self.active.set(n as i64);
    }

    #[cfg(test)]
    pub(crate) fn reconciles(&self, controller: &str, result: &'static str) -> u64 {
        self.reconciles
            .get_or_create(&Labels {
                controller: controller.to_string(),
                result,
            })
            .get()
    }
}
