//! Naming scheme for operator-owned objects.
//!
//! Subcluster names are user input; every object name derived from them is
//! lowered to a valid DNS-1035 label. The lowering is encoded in labels on
//! the built objects so status can round-trip a StatefulSet back to its
//! subcluster.

use crate::vdb::annotations;
use crate::vdb::crd::VerticaDB;

use kube::ResourceExt;

/// Suffix of the replica-group-b subclusters created by an online upgrade.
pub const SANDBOX_SUBCLUSTER_SUFFIX: &str = "-sb";

const DNS1035_MAX: usize = 63;

/// Lower an arbitrary subcluster name to a DNS-1035 label: lowercase
/// alphanumerics and dashes, starting with a letter, at most 63 characters.
pub fn dns1035_label(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    // must start with a letter
    let trimmed = out.trim_start_matches(|c: char| !c.is_ascii_lowercase());
    let mut label = if trimmed.is_empty() {
        "sc".to_string()
    } else {
        trimmed.to_string()
    };
    label.truncate(DNS1035_MAX);
    label.trim_end_matches('-').to_string()
}

/// The StatefulSet name for a subcluster, honoring the per-subcluster
/// override annotation.
pub fn statefulset_name(vdb: &VerticaDB, subcluster: &str) -> String {
    if let Some(override_name) = annotations::statefulset_name_override(vdb, subcluster) {
        return override_name;
    }
    format!("{}-{}", vdb.name_any(), dns1035_label(subcluster))
}

pub fn pod_name(statefulset_name: &str, ordinal: i32) -> String {
    format!("{statefulset_name}-{ordinal}")
}

/// The headless service governing all of the database's pods.
pub fn headless_service_name(vdb: &VerticaDB) -> String {
    vdb.name_any()
}

/// The client service of a subcluster.
pub fn subcluster_service_name(vdb: &VerticaDB, subcluster: &str) -> String {
    format!("{}-{}", vdb.name_any(), dns1035_label(subcluster))
}

pub fn proxy_deployment_name(vdb: &VerticaDB, subcluster: &str) -> String {
    format!("{}-{}-proxy", vdb.name_any(), dns1035_label(subcluster))
}

pub fn sandbox_configmap_name(vdb: &VerticaDB, sandbox: &str) -> String {
    format!("{}-{}", vdb.name_any(), dns1035_label(sandbox))
}

/// The name of the replica-group-b twin of a subcluster during an online
/// upgrade.
pub fn sandbox_subcluster_name(subcluster: &str) -> String {
    format!("{subcluster}{SANDBOX_SUBCLUSTER_SUFFIX}")
}

/// The fixed communal path of the database:
/// `${protocol}${bucket}${prefix}/${dbName}[/${uid}]`.
pub fn communal_path(vdb: &VerticaDB) -> String {
    let base = vdb.spec.communal.path.trim_end_matches('/');
    let mut path = format!("{}/{}", base, vdb.spec.db_name);
    if annotations::include_uid_in_path(vdb) {
        if let Some(uid) = &vdb.metadata.uid {
            path.push('/');
            path.push_str(uid);
        }
    }
    path
}

/// The scheme of the communal path, if it is one the database supports.
pub fn communal_scheme(path: &str) -> Option<&'static str> {
    if path.starts_with("s3://") {
        Some("s3://")
    } else if path.starts_with("gs://") {
        Some("gs://")
    } else if path.starts_with("azb://") {
        Some("azb://")
    } else if path.starts_with('/') {
        Some("/")
    } else {
        None
    }
}

/// The in-database node name of a pod: `v_<dbname>_node<index+1, 4 digits>`.
pub fn node_name(db_name: &str, index: usize) -> String {
    format!("v_{}_node{:04}", db_name.to_lowercase(), index + 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::VerticaDB;

    fn vdb_named(name: &str) -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some(name.to_string());
        vdb
    }

    #[test]
    fn test_dns1035_label() {
        assert_eq!(dns1035_label("Analytics_Pool"), "analytics-pool");
        assert_eq!(dns1035_label("sc1"), "sc1");
        assert_eq!(dns1035_label("9lives"), "lives");
        assert_eq!(dns1035_label("___"), "sc");
        assert_eq!(dns1035_label("trailing_"), "trailing");
        let long = "a".repeat(100);
        assert_eq!(dns1035_label(&long).len(), 63);
    }

    #[test]
    fn test_statefulset_name() {
        let vdb = vdb_named("mydb");
        assert_eq!(statefulset_name(&vdb, "Analytics_Pool"), "mydb-analytics-pool");
        assert_eq!(pod_name(&statefulset_name(&vdb, "sc1"), 2), "mydb-sc1-2");
    }

    #[test]
    fn test_statefulset_name_override() {
        let mut vdb = vdb_named("mydb");
        vdb.metadata.annotations = Some(
            [(
                "vertica.com/statefulset-name-override-sc1".to_string(),
                "legacy".to_string(),
            )]
            .into(),
        );
        assert_eq!(statefulset_name(&vdb, "sc1"), "legacy");
        assert_eq!(statefulset_name(&vdb, "sc2"), "mydb-sc2");
    }

    #[test]
    fn test_communal_path() {
        let mut vdb = vdb_named("mydb");
        vdb.spec.communal.path = "s3://bucket/prefix/".to_string();
        vdb.spec.db_name = "vertdb".to_string();
        assert_eq!(communal_path(&vdb), "s3://bucket/prefix/vertdb");

        vdb.metadata.uid = Some("1234-uid".to_string());
        vdb.metadata.annotations = Some(
            [(
                "vertica.com/include-uid-in-path".to_string(),
                "true".to_string(),
            )]
            .into(),
        );
        assert_eq!(communal_path(&vdb), "s3://bucket/prefix/vertdb/1234-uid");
    }

    #[test]
    fn test_communal_scheme() {
        assert_eq!(communal_scheme("s3://b/p"), Some("s3://"));
        assert_eq!(communal_scheme("gs://b/p"), Some("gs://"));
        assert_eq!(communal_scheme("azb://a/c"), Some("azb://"));
        assert_eq!(communal_scheme("/mnt/shared"), Some("/"));
        assert_eq!(communal_scheme("ftp://nope"), None);
    }

    #[test]
    fn test_node_name() {
        assert_eq!(node_name("VertDB", 0), "v_vertdb_node0001");
        assert_eq!(node_name("vertdb", 11), "v_vertdb_node0012");
    }

    #[test]
    fn test_sandbox_names() {
        let vdb = vdb_named("mydb");
        assert_eq!(sandbox_configmap_name(&vdb, "sb1"), "mydb-sb1");
        assert_eq!(sandbox_subcluster_name("sc1"), "sc1-sb");
    }
}
