use vertiop_operator::controller::VdbResource;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use kube::ResourceExt;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of one diagnostic collection run.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `VerticaScrutinize` custom resource definition (CRD) schedules a one-shot pod
    that runs the scrutinize diagnostic collection against a `VerticaDB`. The operator
    creates the pod, follows its phase, and reflects the outcome into the status
    conditions PodCreated and CollectionFinished.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "VerticaScrutinize",
    plural = "verticascrutinizers",
    singular = "verticascrutinize",
    shortname = "vscr",
    namespaced,
    status = "VerticaScrutinizeStatus",
    printcolumn = r#"{"name":"VerticaDB","type":"string","jsonPath":".spec.verticaDBName"}"#,
    printcolumn = r#"{"name":"PodCreated","type":"string","jsonPath":".status.conditions[?(@.type == 'PodCreated')].status"}"#,
    printcolumn = r#"{"name":"Finished","type":"string","jsonPath":".status.conditions[?(@.type == 'CollectionFinished')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaScrutinizeSpec {
    /// The database the diagnostics are collected from.
    pub vertica_db_name: String,

    /// Defines the resources requests and limits of the collection pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Defines the pod's affinity scheduling rules if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Defines the pod's tolerations if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

/// Most recent observed state of the collection. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaScrutinizeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// The pod running the collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Path of the produced tarball inside the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tarball_path: Option<String>,
}

impl VdbResource for VerticaScrutinize {
    fn vdb_name(&self) -> String {
        self.spec.vertica_db_name.clone()
    }

    fn vdb_namespace(&self) -> String {
        // safe unwrap: VerticaScrutinize is namespaced scoped
        self.namespace().unwrap()
    }
}
