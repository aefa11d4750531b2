#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod crd;
pub mod manager;
pub mod webhook;

pub use decorator_controller_runtime::k8s;
use maplit::{btreemap, convert_args};
use tracing::Instrument;

/// Bounds every wait for the controller to act.
pub const WAIT: std::time::Duration = std::time::Duration::from_secs(20);

/// Runs a test with a random namespace that is deleted on test completion
pub async fn with_temp_ns<F, Fut>(test: F)
where
    F: FnOnce(kube::Client, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    let namespace = format!("decorator-test-{}", random_suffix(6));

    tracing::debug!("initializing client");
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");
    let api = kube::Api::<k8s::Namespace>::all(client.clone());

    tracing::debug!(%namespace, "creating");
    let ns = k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(convert_args!(btreemap!(
                "decorator-test" => std::thread::current().name().unwrap_or(""),
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(
        &kube::api::PostParams {
            dry_run: false,
            field_manager: Some("decorator-test".to_string()),
        },
        &ns,
    )
    .await
    .expect("failed to create Namespace");

    tracing::trace!("spawning");
    let test = test(client.clone(), namespace.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;
    if res.is_err() {
        // Keep cleanup noise out of a failed test's log.
        drop(_tracing);
    }

    tracing::debug!(%namespace, "deleting");
    api.delete(&namespace, &kube::api::DeleteParams::background())
        .await
        .expect("failed to delete Namespace");
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

/// Builds a DecoratorController that decorates `parent` objects with
/// `child` objects computed by the webhook at `url`.
pub fn decorator(
    name: &str,
    labels: &[(&str, &str)],
    parent: &crd::TestCrd,
    child: &crd::TestCrd,
    url: &str,
) -> k8s::DecoratorController {
    let labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
        .collect::<serde_json::Map<_, _>>();
    serde_json::from_value(serde_json::json!({
        "apiVersion": "metacontroller.k8s.io/v1alpha1",
        "kind": "DecoratorController",
        "metadata": {"name": name, "labels": labels},
        "spec": {
            "resources": [parent.rule()],
            "attachments": [child.rule()],
            "hooks": {"sync": {"webhook": {"url": url}}},
        },
    }))
    .expect("DecoratorController must be valid")
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .map(|c| (c as char).to_ascii_lowercase())
        .take(len)
        .collect()
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "decorator=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}
