use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of the desired behavior of the Vertica cluster. More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
// workaround: '`' character is not allowed in the kube `doc` attribute during doctests
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `VerticaDB` custom resource definition (CRD) defines a desired Eon-mode
    Vertica database to run in a Kubernetes cluster: its subclusters, sandboxes, communal
    storage, local storage, transport security and upgrade policy.

    For each `VerticaDB` resource, the operator deploys one StatefulSet per subcluster in the
    same namespace, plus the services, config maps and optional client-proxy deployments the
    database needs.
    "#
    )
)]
#[kube(
    group = "vertica.com",
    version = "v1",
    kind = "VerticaDB",
    plural = "verticadbs",
    singular = "verticadb",
    shortname = "vdb",
    namespaced,
    status = "VerticaDBStatus",
    printcolumn = r#"{"name":"Subclusters","type":"integer","description":"The number of subclusters","jsonPath":".status.subclusterCount"}"#,
    printcolumn = r#"{"name":"Added","type":"integer","description":"Nodes added to the database","jsonPath":".status.addedToDBCount"}"#,
    printcolumn = r#"{"name":"Up","type":"integer","description":"Nodes that are up","jsonPath":".status.upNodeCount"}"#,
    printcolumn = r#"{"name":"Initialized","type":"string","jsonPath":".status.conditions[?(@.type == 'DBInitialized')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    /// The name of the database. This cannot be changed after creation.
    #[serde(default = "default_db_name")]
    #[cfg_attr(feature = "schemars", schemars(regex(pattern = r"^[a-zA-Z][a-zA-Z0-9_]*$")))]
    pub db_name: String,

    /// Container image name for the Vertica server.
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy. One of Always, Never, IfNotPresent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Name of a secret with credentials for the image registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// How the operator initializes the database:
    /// Create a fresh one, Create without package installation, Revive an
    /// existing one from communal storage, or ScheduleOnly to just run pods
    /// against a database managed elsewhere.
    #[serde(default)]
    pub init_policy: InitPolicy,

    /// The communal storage backing the database's shared state. The path is
    /// fixed after the database is created.
    pub communal: CommunalStorage,

    /// Per-pod persistent storage sizing and path layout.
    #[serde(default)]
    pub local: LocalStorage,

    /// Different groups of nodes with a shared role, size and service
    /// configuration. Each subcluster is deployed as a separate StatefulSet.
    #[cfg_attr(feature = "schemars", validate(length(min = 1, max = 100)))]
    pub subclusters: Vec<Subcluster>,

    /// Detached read-only replicas of subclusters, sharing the same communal
    /// storage and optionally running a different image.
    #[serde(default)]
    #[cfg_attr(feature = "schemars", validate(length(max = 100)))]
    pub sandboxes: Vec<Sandbox>,

    /// How the operator replaces the server image.
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,

    /// Seconds between reconcile attempts while an upgrade is in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_requeue_time: Option<i64>,

    /// Restart vertica processes that the operator finds down. Defaults to
    /// true.
    #[serde(default = "default_true")]
    pub auto_restart_vertica: bool,

    /// Name of the secret holding the database superuser password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// Name of the secret with the TLS material for the node management
    /// agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nma_tls_secret: Option<String>,

    /// Name of the secret with the TLS material for the HTTPS endpoints of
    /// the node management agent. Falls back to nmaTLSSecret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_nma_tls_secret: Option<String>,

    /// Name of the secret with the TLS material for client-server
    /// connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_server_tls_secret: Option<String>,

    /// TLS mode of the HTTPS endpoints.
    #[serde(default)]
    pub https_tls_mode: TlsMode,

    /// TLS mode of client-server connections.
    #[serde(default)]
    pub client_server_tls_mode: TlsMode,

    /// Name of the secret staged into each pod as the license file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum InitPolicy {
    #[default]
    Create,
    CreateSkipPackageInstall,
    Revive,
    ScheduleOnly,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum UpgradePolicy {
    #[default]
    Offline,
    ReadOnlyOnline,
    Online,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    #[default]
    TryVerify,
    Disable,
    Enable,
    VerifyCa,
    VerifyFull,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CommunalStorage {
    /// The base location of the database's shared state, e.g.
    /// `s3://bucket/prefix`, `gs://bucket/prefix`, `azb://account/container`
    /// or a POSIX path. The database name is appended to form the communal
    /// path; the result never changes after create.
    pub path: String,

    /// Endpoint of the object store, e.g. `https://s3.amazonaws.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the secret with the object-store credentials. Recognized
    /// keys: `accesskey`/`secretkey` for S3 and GCS, `accountkey` or
    /// `sharedaccesssignature` for Azure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,

    /// Region of the object store bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Name of a secret with a CA bundle to trust when talking to the
    /// object store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    /// Mount path for the database's data files.
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Mount path for the depot, the local cache of communal storage.
    #[serde(default = "default_depot_path")]
    pub depot_path: String,

    /// Mount path for the catalog.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Whether the depot lives on the persistent volume or an emptyDir.
    #[serde(default)]
    pub depot_volume: DepotVolumeType,

    /// Requested size of the persistent volume claim per pod.
    #[serde(default = "default_request_size")]
    pub request_size: String,

    /// StorageClass of the persistent volume claim. Cluster default when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl Default for LocalStorage {
    fn default() -> Self {
        LocalStorage {
            data_path: default_data_path(),
            depot_path: default_depot_path(),
            catalog_path: default_catalog_path(),
            depot_volume: DepotVolumeType::default(),
            request_size: default_request_size(),
            storage_class: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum DepotVolumeType {
    #[default]
    PersistentVolume,
    EmptyDir,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    /// The name of the subcluster. Lowered to a DNS-1035 label for the
    /// StatefulSet name.
    pub name: String,

    /// Number of pods in the subcluster.
    pub size: i32,

    /// The role of the subcluster's nodes.
    #[serde(default, rename = "type")]
    pub type_: SubclusterType,

    /// Stop the subcluster's nodes and keep its StatefulSet at zero
    /// replicas without removing the nodes from the database.
    #[serde(default)]
    pub shutdown: bool,

    /// Service type of the subcluster's client service. Defaults to
    /// ClusterIP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Client proxy sidecar deployment for the subcluster; built when
    /// replicas > 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,

    /// Defines the resources requests and limits of the server container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Defines on which Nodes the Pods are scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Defines the Pods' affinity scheduling rules if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Defines the Pods' tolerations if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum SubclusterType {
    #[default]
    Primary,
    Secondary,
    Sandboxprimary,
    Sandboxsecondary,
}

impl SubclusterType {
    pub fn is_primary(&self) -> bool {
        matches!(self, SubclusterType::Primary | SubclusterType::Sandboxprimary)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    /// Number of proxy replicas.
    pub replicas: i32,

    /// Proxy container image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    /// The name of the sandbox.
    pub name: String,

    /// Image override for the sandbox; the main cluster image when unset.
    /// Changing it triggers a sandbox-scoped offline upgrade handled by the
    /// sandbox controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Subclusters that belong to the sandbox, referenced by name. A
    /// subcluster is a member of at most one sandbox.
    pub subclusters: Vec<SandboxSubcluster>,

    /// Stop the sandbox's nodes without removing them from the database.
    #[serde(default)]
    pub shutdown: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SandboxSubcluster {
    pub name: String,
}

fn default_db_name() -> String {
    "vertdb".to_string()
}

fn default_image() -> String {
    "opentext/vertica-k8s:latest".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_path() -> String {
    "/data".to_string()
}

fn default_depot_path() -> String {
    "/depot".to_string()
}

fn default_catalog_path() -> String {
    "/data".to_string()
}

fn default_request_size() -> String {
    "500Gi".to_string()
}

/// Most recent observed status of the Vertica cluster. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Total number of nodes added to the database.
    pub added_to_db_count: i32,

    /// Total number of nodes that are up.
    pub up_node_count: i32,

    /// Number of subclusters in the database.
    pub subcluster_count: i32,

    /// Status per subcluster.
    #[serde(default)]
    pub subclusters: Vec<SubclusterStatus>,

    /// Status per sandbox.
    #[serde(default)]
    pub sandboxes: Vec<SandboxStatus>,

    /// Identifier of the last restore point taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_point: Option<String>,

    /// Progress of an ongoing upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    /// The subcluster name as given in the spec.
    pub name: String,

    /// The StatefulSet backing the subcluster.
    pub statefulset_name: String,

    /// Number of this subcluster's nodes added to the database.
    pub added_to_db_count: i32,

    /// Number of this subcluster's nodes that are up.
    pub up_node_count: i32,

    #[serde(rename = "type")]
    pub type_: SubclusterType,

    pub shutdown: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,

    /// Subclusters that are members of the sandbox.
    pub subclusters: Vec<String>,

    /// Image the sandbox pods currently run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Progress of an upgrade, persisted so a restarted operator resumes from
/// the correct point.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    pub policy: UpgradePolicy,

    pub phase: UpgradePhase,

    /// Markers already reached, in order.
    #[serde(default)]
    pub markers: Vec<UpgradeMarker>,

    /// When the upgrade started, for the online rollback/commit decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// The image the upgrade is moving to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum UpgradePhase {
    #[default]
    Idle,
    Preparing,
    Sandboxing,
    ShiftingTraffic,
    Replicating,
    Promoting,
    Cleaning,
    Failed,
}

serde_plain::derive_display_from_serialize!(UpgradePhase);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum UpgradeMarker {
    UpgradeStarted,
    SandboxCreated,
    ClientTrafficShifted,
    Replicated,
    Promoted,
    Cleaned,
}

impl UpgradeMarker {
    /// Canonical order of the online upgrade markers.
    pub const ORDER: [UpgradeMarker; 6] = [
        UpgradeMarker::UpgradeStarted,
        UpgradeMarker::SandboxCreated,
        UpgradeMarker::ClientTrafficShifted,
        UpgradeMarker::Replicated,
        UpgradeMarker::Promoted,
        UpgradeMarker::Cleaned,
    ];
}

/// Whether the recorded markers form a prefix of the canonical order. Two
/// markers that violate the partial order never coexist.
pub fn markers_consistent(markers: &[UpgradeMarker]) -> bool {
    markers
        .iter()
        .zip(UpgradeMarker::ORDER.iter())
        .all(|(a, b)| a == b)
        && markers.len() <= UpgradeMarker::ORDER.len()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_subcluster_type_roles() {
        assert!(SubclusterType::Primary.is_primary());
        assert!(SubclusterType::Sandboxprimary.is_primary());
        assert!(!SubclusterType::Secondary.is_primary());
        assert!(!SubclusterType::Sandboxsecondary.is_primary());
    }

    #[test]
    fn test_subcluster_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&SubclusterType::Sandboxprimary).unwrap(),
            "\"sandboxprimary\""
        );
        let parsed: SubclusterType = serde_json::from_str("\"secondary\"").unwrap();
        assert_eq!(parsed, SubclusterType::Secondary);
    }

    #[test]
    fn test_markers_consistent() {
        use UpgradeMarker::*;
        assert!(markers_consistent(&[]));
        assert!(markers_consistent(&[UpgradeStarted]));
        assert!(markers_consistent(&[UpgradeStarted, SandboxCreated]));
        assert!(markers_consistent(&UpgradeMarker::ORDER));
        // Replicated before ClientTrafficShifted violates the order
        assert!(!markers_consistent(&[UpgradeStarted, Replicated]));
        assert!(!markers_consistent(&[SandboxCreated]));
    }

    #[test]
    fn test_spec_defaults_from_minimal_yaml() {
        let spec: VerticaDBSpec = serde_json::from_value(serde_json::json!({
            "communal": {"path": "s3://b/p"},
            "subclusters": [{"name": "main", "size": 3}],
        }))
        .unwrap();
        assert_eq!(spec.db_name, "vertdb");
        assert_eq!(spec.init_policy, InitPolicy::Create);
        assert_eq!(spec.upgrade_policy, UpgradePolicy::Offline);
        assert!(spec.auto_restart_vertica);
        assert_eq!(spec.local.data_path, "/data");
        assert_eq!(spec.local.depot_volume, DepotVolumeType::PersistentVolume);
        assert_eq!(spec.subclusters[0].type_, SubclusterType::Primary);
    }
}
