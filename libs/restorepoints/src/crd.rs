use vertiop_operator::controller::VdbResource;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use kube::ResourceExt;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of one restore-point listing.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `VerticaRestorePointsQuery` custom resource definition (CRD) asks the operator
    to list the restore points available in a database's communal storage, optionally
    filtered by archive and time window. The result lands in the status; the query is
    read-only and never mutates the database.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "VerticaRestorePointsQuery",
    plural = "verticarestorepointsqueries",
    singular = "verticarestorepointsquery",
    shortname = "vrpq",
    namespaced,
    status = "VerticaRestorePointsQueryStatus",
    printcolumn = r#"{"name":"VerticaDB","type":"string","jsonPath":".spec.verticaDBName"}"#,
    printcolumn = r#"{"name":"Complete","type":"string","jsonPath":".status.conditions[?(@.type == 'QueryComplete')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaRestorePointsQuerySpec {
    /// The database whose restore points are listed.
    pub vertica_db_name: String,

    /// Narrows the listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<RestorePointsFilter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RestorePointsFilter {
    /// Only restore points of this archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,

    /// Only restore points taken at or after this timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// Only restore points taken at or before this timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,
}

/// Most recent result of the query. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaRestorePointsQueryStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// The restore points found in communal storage.
    #[serde(default)]
    pub restore_points: Vec<RestorePointInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RestorePointInfo {
    pub archive: String,
    pub id: String,
    pub index: i64,
    pub timestamp: String,
}

impl VdbResource for VerticaRestorePointsQuery {
    fn vdb_name(&self) -> String {
        self.spec.vertica_db_name.clone()
    }

    fn vdb_namespace(&self) -> String {
        // safe unwrap: VerticaRestorePointsQuery is namespaced scoped
        self.namespace().unwrap()
    }
}
