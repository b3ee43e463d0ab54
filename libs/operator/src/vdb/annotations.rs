//! Annotations the operator recognizes on a VerticaDB.

use crate::vdb::crd::VerticaDB;

use kube::ResourceExt;
use tokio::time::Duration;

/// Append the CR UID to the communal path.
pub const INCLUDE_UID_IN_PATH_ANNOTATION: &str = "vertica.com/include-uid-in-path";

/// Select the direct back-end for admin commands.
pub const VCLUSTER_OPS_ANNOTATION: &str = "vertica.com/vcluster-ops";

/// Insert a restore-point step before upgrade.
pub const SAVE_RESTORE_POINT_ON_UPGRADE_ANNOTATION: &str =
    "vertica.com/save-restore-point-on-upgrade";

/// Name for the replica-group-b sandbox during an online upgrade.
pub const ONLINE_UPGRADE_PREFERRED_SANDBOX_ANNOTATION: &str =
    "vertica.com/online-upgrade-preferred-sandbox";

/// Seconds until the online upgrade rollback/commit decision.
pub const ONLINE_UPGRADE_TIMEOUT_ANNOTATION: &str = "vertica.com/online-upgrade-timeout";

/// Seconds for the create_db admin action.
pub const CREATEDB_TIMEOUT_ANNOTATION: &str = "vertica.com/createdb-timeout";

/// Seconds between metrics scrapes.
pub const PROMETHEUS_SCRAPE_INTERVAL_ANNOTATION: &str = "vertica.com/prometheus-scrape-interval";

/// Literal StatefulSet name for a subcluster; the subcluster name is appended
/// to the key.
pub const STATEFULSET_NAME_OVERRIDE_ANNOTATION_PREFIX: &str =
    "vertica.com/statefulset-name-override-";

/// Pod-label value a subcluster's client service selects instead of the
/// subcluster's own name; written by the promotion step of an online
/// upgrade. The subcluster name is appended to the key.
pub const SUBCLUSTER_SELECTOR_OVERRIDE_ANNOTATION_PREFIX: &str =
    "vertica.com/subcluster-selector-override-";

/// Cap in seconds on the error backoff for this CR.
pub const MAX_BACKOFF_SECONDS_ANNOTATION: &str = "vertica.com/max-backoff-seconds";

/// Seconds to wait for client sessions to close before a scale-in removes a
/// node.
pub const DRAIN_GRACE_SECONDS_ANNOTATION: &str = "vertica.com/drain-grace-seconds";

/// Wall-clock start of an ongoing drain; the pod name is appended to the key.
pub const DRAIN_START_ANNOTATION_PREFIX: &str = "vertica.com/drain-start-";

pub const DEFAULT_CREATEDB_TIMEOUT: Duration = Duration::from_secs(1200);
pub const DEFAULT_ONLINE_UPGRADE_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(600);
pub const DEFAULT_ONLINE_UPGRADE_SANDBOX: &str = "replica-group-b";

fn bool_annotation(vdb: &VerticaDB, key: &str) -> bool {
    vdb.annotations().get(key).map(String::as_str) == Some("true")
}

fn seconds_annotation(vdb: &VerticaDB, key: &str, default: Duration) -> Duration {
    vdb.annotations()
        .get(key)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub fn include_uid_in_path(vdb: &VerticaDB) -> bool {
    bool_annotation(vdb, INCLUDE_UID_IN_PATH_ANNOTATION)
}

pub fn vcluster_ops_enabled(vdb: &VerticaDB) -> bool {
    bool_annotation(vdb, VCLUSTER_OPS_ANNOTATION)
}

pub fn save_restore_point_on_upgrade(vdb: &VerticaDB) -> bool {
    bool_annotation(vdb, SAVE_RESTORE_POINT_ON_UPGRADE_ANNOTATION)
}

pub fn online_upgrade_sandbox_name(vdb: &VerticaDB) -> String {
    vdb.annotations()
        .get(ONLINE_UPGRADE_PREFERRED_SANDBOX_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| DEFAULT_ONLINE_UPGRADE_SANDBOX.to_string())
}

pub fn online_upgrade_timeout(vdb: &VerticaDB) -> Duration {
    seconds_annotation(
        vdb,
        ONLINE_UPGRADE_TIMEOUT_ANNOTATION,
        DEFAULT_ONLINE_UPGRADE_TIMEOUT,
    )
}

pub fn createdb_timeout(vdb: &VerticaDB) -> Duration {
    seconds_annotation(vdb, CREATEDB_TIMEOUT_ANNOTATION, DEFAULT_CREATEDB_TIMEOUT)
}

pub fn drain_grace(vdb: &VerticaDB) -> Duration {
    seconds_annotation(vdb, DRAIN_GRACE_SECONDS_ANNOTATION, DEFAULT_DRAIN_GRACE)
}

pub fn subcluster_selector_override(vdb: &VerticaDB, subcluster: &str) -> Option<String> {
    vdb.annotations()
        .get(&format!(
            "{SUBCLUSTER_SELECTOR_OVERRIDE_ANNOTATION_PREFIX}{subcluster}"
        ))
        .cloned()
}

pub fn statefulset_name_override(vdb: &VerticaDB, subcluster: &str) -> Option<String> {
    vdb.annotations()
        .get(&format!(
            "{STATEFULSET_NAME_OVERRIDE_ANNOTATION_PREFIX}{subcluster}"
        ))
        .cloned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::VerticaDB;

    fn vdb_with_annotations(pairs: &[(&str, &str)]) -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.annotations = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        vdb
    }

    #[test]
    fn test_defaults_without_annotations() {
        let vdb = VerticaDB::default();
        assert!(!include_uid_in_path(&vdb));
        assert!(!vcluster_ops_enabled(&vdb));
        assert_eq!(createdb_timeout(&vdb), DEFAULT_CREATEDB_TIMEOUT);
        assert_eq!(
            online_upgrade_sandbox_name(&vdb),
            DEFAULT_ONLINE_UPGRADE_SANDBOX
        );
        assert_eq!(statefulset_name_override(&vdb, "sc1"), None);
    }

    #[test]
    fn test_annotation_overrides() {
        let vdb = vdb_with_annotations(&[
            (VCLUSTER_OPS_ANNOTATION, "true"),
            (CREATEDB_TIMEOUT_ANNOTATION, "300"),
            (ONLINE_UPGRADE_PREFERRED_SANDBOX_ANNOTATION, "sand1"),
            (
                "vertica.com/statefulset-name-override-sc1",
                "legacy-sts-name",
            ),
        ]);
        assert!(vcluster_ops_enabled(&vdb));
        assert_eq!(createdb_timeout(&vdb), Duration::from_secs(300));
        assert_eq!(online_upgrade_sandbox_name(&vdb), "sand1");
        assert_eq!(
            statefulset_name_override(&vdb, "sc1"),
            Some("legacy-sts-name".to_string())
        );
        assert_eq!(statefulset_name_override(&vdb, "sc2"), None);
    }

    #[test]
    fn test_non_numeric_timeout_falls_back() {
        let vdb = vdb_with_annotations(&[(ONLINE_UPGRADE_TIMEOUT_ANNOTATION, "soon")]);
        assert_eq!(
            online_upgrade_timeout(&vdb),
            DEFAULT_ONLINE_UPGRADE_TIMEOUT
        );
    }
}
