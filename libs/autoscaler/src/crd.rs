use vertiop_operator::controller::VdbResource;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use kube::ResourceExt;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of the desired behavior of the autoscaler.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `VerticaAutoscaler` custom resource definition (CRD) maps an external metric
    onto the desired size of one subcluster of a `VerticaDB`. On each reconcile the
    operator reads the metric, computes a target size within the configured bounds, and
    patches the subcluster's size. The size field is the only VerticaDB field the
    autoscaler owns.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "VerticaAutoscaler",
    plural = "verticaautoscalers",
    singular = "verticaautoscaler",
    shortname = "vas",
    namespaced,
    status = "VerticaAutoscalerStatus",
    printcolumn = r#"{"name":"Target","type":"string","description":"The VerticaDB being autoscaled","jsonPath":".spec.verticaDBName"}"#,
    printcolumn = r#"{"name":"Subcluster","type":"string","jsonPath":".spec.subcluster"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentSize"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredSize"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaAutoscalerSpec {
    /// The VerticaDB whose subcluster is scaled.
    pub vertica_db_name: String,

    /// The subcluster whose size follows the metric.
    pub subcluster: String,

    /// Lower bound of the subcluster size.
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,

    /// Upper bound of the subcluster size.
    pub max_replicas: i32,

    /// The metric that drives the size.
    pub metric: MetricSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// Where the metric value comes from.
    #[serde(default)]
    pub provider: MetricProviderKind,

    /// HTTP endpoint of the metric provider; required for the http
    /// provider. The response is a JSON object with a numeric `value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Provider-specific query string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Fixed value used by the static provider, mainly for tests and
    /// manual scaling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_value: Option<f64>,

    /// The metric value one node is expected to handle; the desired size
    /// is the total divided by this, rounded up.
    pub target_average_value: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum MetricProviderKind {
    #[default]
    Http,
    Static,
}

fn default_min_replicas() -> i32 {
    1
}

/// Most recent observed state of the autoscaler. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaAutoscalerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Size of the target subcluster at the last observation.
    pub current_size: i32,

    /// Size the metric asked for at the last observation.
    pub desired_size: i32,

    /// When the operator last changed the subcluster size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<Time>,
}

impl VdbResource for VerticaAutoscaler {
    fn vdb_name(&self) -> String {
        self.spec.vertica_db_name.clone()
    }

    fn vdb_namespace(&self) -> String {
        // safe unwrap: VerticaAutoscaler is namespaced scoped
        self.namespace().unwrap()
    }
}
