//! Throwaway CustomResourceDefinitions for parents and attachments.

use crate::k8s::{self, apiextensions::CustomResourceDefinition, ApiResource, DynamicObject};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    runtime::wait::{await_condition, conditions},
    CustomResourceExt,
};
use serde_json::json;

pub const GROUP: &str = "test.decorator.example.com";

/// A namespaced resource type whose objects accept arbitrary fields.
#[derive(Clone, Debug)]
pub struct TestCrd {
    pub name: String,
    pub resource: ApiResource,
}

/// Installs or updates the DecoratorController CRD.
pub async fn install_decorator_controllers(client: &kube::Client) {
    let api = Api::<CustomResourceDefinition>::all(client.clone());
    let crd = k8s::DecoratorController::crd();
    let name = crd.metadata.name.clone().expect("CRD must be named");
    api.patch(
        &name,
        &PatchParams::apply("decorator-test").force(),
        &Patch::Apply(crd),
    )
    .await
    .expect("failed to apply DecoratorController CRD");
    established(&api, &name).await;
}

/// Creates a CRD of the given kind in [`GROUP`].
pub async fn create(client: &kube::Client, kind: &str) -> TestCrd {
    let plural = format!("{}s", kind.to_ascii_lowercase());
    let name = format!("{plural}.{GROUP}");
    let crd: CustomResourceDefinition = serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": name},
        "spec": {
            "group": GROUP,
            "scope": "Namespaced",
            "names": {
                "kind": kind,
                "plural": plural,
                "singular": kind.to_ascii_lowercase(),
            },
            "versions": [{
                "name": "v1",
                "served": true,
                "storage": true,
                "schema": {"openAPIV3Schema": {
                    "type": "object",
                    "x-kubernetes-preserve-unknown-fields": true,
                }},
                "subresources": {"status": {}},
            }],
        },
    }))
    .expect("CRD must be valid");

    let api = Api::<CustomResourceDefinition>::all(client.clone());
    api.create(&PostParams::default(), &crd)
        .await
        .expect("failed to create CRD");
    established(&api, &name).await;

    TestCrd {
        name,
        resource: ApiResource {
            group: GROUP.to_string(),
            version: "v1".to_string(),
            api_version: format!("{GROUP}/v1"),
            kind: kind.to_string(),
            plural,
        },
    }
}

async fn established(api: &Api<CustomResourceDefinition>, name: &str) {
    tokio::time::timeout(
        crate::WAIT,
        await_condition(api.clone(), name, conditions::is_crd_established()),
    )
    .await
    .expect("CRD must be established")
    .expect("failed to watch CRD");
}

// === impl TestCrd ===

impl TestCrd {
    pub fn rule(&self) -> k8s::ResourceRule {
        k8s::ResourceRule {
            api_version: self.resource.api_version.clone(),
            resource: self.resource.plural.clone(),
        }
    }

    pub fn api(&self, client: &kube::Client, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(client.clone(), ns, &self.resource)
    }

    pub fn object(&self, name: &str) -> DynamicObject {
        DynamicObject::new(name, &self.resource)
    }

    pub async fn delete(self, client: &kube::Client) {
        Api::<CustomResourceDefinition>::all(client.clone())
            .delete(&self.name, &DeleteParams::background())
            .await
            .expect("failed to delete CRD");
    }
}
