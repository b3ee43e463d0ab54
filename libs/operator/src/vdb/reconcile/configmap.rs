use crate::vdb::crd::{Sandbox, VerticaDB};
use crate::vdb::names;
use crate::vdb::reconcile::labels::{common_labels, SANDBOX_CONFIGMAP_LABEL, SANDBOX_LABEL};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, Resource};
use kube::ResourceExt;

pub const DATA_VDB_NAME: &str = "verticaDBName";
pub const DATA_SANDBOX_NAME: &str = "sandboxName";
pub const DATA_IMAGE: &str = "image";

/// The per-sandbox ConfigMap written by the VerticaDB controller and watched
/// by the sandbox controller. Immutable once created except for the image
/// override, which the sandbox controller acts on without racing the main
/// controller.
pub fn build_sandbox_configmap(vdb: &VerticaDB, sandbox: &Sandbox) -> ConfigMap {
    let labels: BTreeMap<String, String> = common_labels(vdb)
        .into_iter()
        .chain([
            (SANDBOX_LABEL.to_string(), sandbox.name.clone()),
            (SANDBOX_CONFIGMAP_LABEL.to_string(), "true".to_string()),
        ])
        .collect();
    let image = sandbox
        .image
        .clone()
        .unwrap_or_else(|| vdb.spec.image.clone());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(names::sandbox_configmap_name(vdb, &sandbox.name)),
            namespace: vdb.namespace(),
            labels: Some(labels),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            (DATA_VDB_NAME.to_string(), vdb.name_any()),
            (DATA_SANDBOX_NAME.to_string(), sandbox.name.clone()),
            (DATA_IMAGE.to_string(), image),
        ])),
        ..ConfigMap::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::{Sandbox, SandboxSubcluster};

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.spec.image = "opentext/vertica-k8s:24.3.0-0".to_string();
        vdb
    }

    #[test]
    fn test_build_sandbox_configmap() {
        let sandbox = Sandbox {
            name: "sb1".to_string(),
            image: None,
            subclusters: vec![SandboxSubcluster {
                name: "sec1".to_string(),
            }],
            shutdown: false,
        };
        let cm = build_sandbox_configmap(&vdb(), &sandbox);
        assert_eq!(cm.name_any(), "mydb-sb1");
        let data = cm.data.unwrap();
        assert_eq!(data[DATA_VDB_NAME], "mydb");
        assert_eq!(data[DATA_SANDBOX_NAME], "sb1");
        // falls back to the main cluster image
        assert_eq!(data[DATA_IMAGE], "opentext/vertica-k8s:24.3.0-0");
        let labels = cm.metadata.labels.unwrap();
        assert_eq!(labels[SANDBOX_CONFIGMAP_LABEL], "true");
        assert_eq!(labels[SANDBOX_LABEL], "sb1");
    }

    #[test]
    fn test_image_override_wins() {
        let sandbox = Sandbox {
            name: "sb1".to_string(),
            image: Some("opentext/vertica-k8s:24.4.0-0".to_string()),
            subclusters: vec![],
            shutdown: false,
        };
        let cm = build_sandbox_configmap(&vdb(), &sandbox);
        assert_eq!(
            cm.data.unwrap()[DATA_IMAGE],
            "opentext/vertica-k8s:24.4.0-0"
        );
    }
}
