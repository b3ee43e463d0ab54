use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta as JobMeta, Time};
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of one condition-triggered job.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `EventTrigger` custom resource definition (CRD) observes a named condition on
    a referenced `VerticaDB` and creates one Kubernetes Job from the embedded template
    when the condition reaches the configured value. The job is created exactly once per
    trigger; the status records which job ran and when.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "EventTrigger",
    plural = "eventtriggers",
    singular = "eventtrigger",
    shortname = "et",
    namespaced,
    status = "EventTriggerStatus",
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerSpec {
    /// The objects whose conditions are observed. Only VerticaDB
    /// references are supported.
    pub references: Vec<ETReference>,

    /// The condition transitions that fire the trigger; all must match.
    pub matches: Vec<ETMatch>,

    /// The job created when the trigger fires.
    pub template: ETJobTemplate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETReference {
    pub object: ETReferenceObject,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETReferenceObject {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETMatch {
    pub condition: ETMatchCondition,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETMatchCondition {
    /// The condition type to watch, e.g. DBInitialized.
    #[serde(rename = "type")]
    pub type_: String,

    /// The value that fires the trigger, True or False.
    pub status: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETJobTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMeta>,

    pub spec: JobSpec,
}

fn default_api_version() -> String {
    "vertica.com/v1".to_string()
}

fn default_kind() -> String {
    "VerticaDB".to_string()
}

/// Most recent observed state of the trigger. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerStatus {
    /// The job created by the trigger, once fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// When the job was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_created_at: Option<Time>,

    /// Observed state per reference.
    #[serde(default)]
    pub references: Vec<ETRefStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ETRefStatus {
    pub name: String,

    /// Whether the reference currently exists.
    pub resolved: bool,

    /// Whether every configured match holds on the reference.
    pub matched: bool,
}
