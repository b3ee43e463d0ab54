use vertiop_operator::controller::VdbResource;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use kube::ResourceExt;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of one replication run between two databases.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `VerticaReplicator` custom resource definition (CRD) declares one replication
    of committed data from a source database (or one of its sandboxes) into a target
    database. The operator drives it through the conditions ReplicationReady, Replicating
    and finally Succeeded or Failed; the CR is a one-shot request and is not re-run after
    it finishes.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "VerticaReplicator",
    plural = "verticareplicators",
    singular = "verticareplicator",
    shortname = "vrep",
    namespaced,
    status = "VerticaReplicatorStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source.verticaDBName"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.verticaDBName"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type == 'Succeeded')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaReplicatorSpec {
    /// The database replicated from.
    pub source: ReplicationSource,

    /// The database replicated into.
    pub target: ReplicationTarget,

    /// Transaction start for incremental replication; everything committed
    /// from this point is shipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_tsa: Option<String>,

    /// Only schemas matching this pattern are replicated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_pattern: Option<String>,

    /// Schemas matching this pattern are skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSource {
    pub vertica_db_name: String,

    /// Replicate from this sandbox of the source instead of its main
    /// cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReplicationTarget {
    pub vertica_db_name: String,
}

/// Most recent observed state of the replication. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaReplicatorStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Human readable summary of where the replication stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl VdbResource for VerticaReplicator {
    fn vdb_name(&self) -> String {
        self.spec.source.vertica_db_name.clone()
    }

    fn vdb_namespace(&self) -> String {
        // safe unwrap: VerticaReplicator is namespaced scoped
        self.namespace().unwrap()
    }
}
