//! Labeling scheme for operator-owned objects.

use crate::vdb::crd::VerticaDB;

use std::collections::BTreeMap;

use kube::ResourceExt;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const DATABASE_LABEL: &str = "vertica.com/database";
pub const SUBCLUSTER_LABEL: &str = "vertica.com/subcluster";
pub const SANDBOX_LABEL: &str = "vertica.com/sandbox";

/// Set on sandbox ConfigMaps so the sandbox controller's watch selects them.
pub const SANDBOX_CONFIGMAP_LABEL: &str = "vertica.com/watched-by-sandbox-controller";

pub const NAME_VALUE: &str = "vertica";
pub const MANAGED_BY_VALUE: &str = "vertiop";

/// Labels carried by every object the operator owns for this database.
pub fn common_labels(vdb: &VerticaDB) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), NAME_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), vdb.name_any()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (DATABASE_LABEL.to_string(), vdb.spec.db_name.clone()),
    ])
}

/// Labels selecting the pods of one subcluster. `sandbox` tags sandbox
/// members so facts and the sandbox controller can filter on membership.
pub fn pod_labels(
    vdb: &VerticaDB,
    subcluster: &str,
    sandbox: Option<&str>,
) -> BTreeMap<String, String> {
    common_labels(vdb)
        .into_iter()
        .chain([(SUBCLUSTER_LABEL.to_string(), subcluster.to_string())])
        .chain(
            sandbox
                .into_iter()
                .map(|sb| (SANDBOX_LABEL.to_string(), sb.to_string())),
        )
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb
    }

    #[test]
    fn test_common_labels() {
        let labels = common_labels(&vdb());
        assert_eq!(labels[NAME_LABEL], "vertica");
        assert_eq!(labels[INSTANCE_LABEL], "mydb");
        assert_eq!(labels[MANAGED_BY_LABEL], "vertiop");
        assert_eq!(labels[DATABASE_LABEL], "vertdb");
    }

    #[test]
    fn test_pod_labels_sandbox_tag() {
        let labels = pod_labels(&vdb(), "sc1", None);
        assert_eq!(labels[SUBCLUSTER_LABEL], "sc1");
        assert!(!labels.contains_key(SANDBOX_LABEL));

        let labels = pod_labels(&vdb(), "sc1", Some("sb1"));
        assert_eq!(labels[SANDBOX_LABEL], "sb1");
    }
}
