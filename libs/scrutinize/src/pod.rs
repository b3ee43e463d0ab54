use crate::crd::VerticaScrutinize;

use vertiop_operator::vdb::crd::VerticaDB;
use vertiop_operator::vdb::names;
use vertiop_operator::vdb::reconcile::labels::common_labels;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::{ObjectMeta, Resource};
use kube::ResourceExt;

const SCRUTINIZE_CONTAINER: &str = "scrutinize";
pub const TARBALL_PATH: &str = "/tmp/scrutinize/scrutinize.tar";

pub fn pod_name(vscr: &VerticaScrutinize) -> String {
    format!("{}-scrutinize", vscr.name_any())
}

/// The one-shot pod that runs the diagnostic collection. It uses the
/// server image so the scrutinize tooling matches the database version,
/// and never restarts: the phase is the outcome.
pub fn build_scrutinize_pod(vscr: &VerticaScrutinize, vdb: &VerticaDB) -> Pod {
    let labels: BTreeMap<String, String> = common_labels(vdb)
        .into_iter()
        .chain([(
            "vertica.com/scrutinize".to_string(),
            vscr.name_any(),
        )])
        .collect();
    let host_list = vdb
        .spec
        .subclusters
        .iter()
        .flat_map(|sc| {
            let sts = names::statefulset_name(vdb, &sc.name);
            (0..sc.size).map(move |i| {
                format!(
                    "{}.{}",
                    names::pod_name(&sts, i),
                    names::headless_service_name(vdb)
                )
            })
        })
        .collect::<Vec<_>>()
        .join(",");

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(vscr)),
            namespace: vscr.namespace(),
            labels: Some(labels),
            owner_references: vscr.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: SCRUTINIZE_CONTAINER.to_string(),
                image: Some(vdb.spec.image.clone()),
                command: Some(vec![
                    "/opt/vertica/bin/scrutinize".to_string(),
                    "--output-file".to_string(),
                    TARBALL_PATH.to_string(),
                    "--hosts".to_string(),
                    host_list,
                ]),
                resources: vscr.spec.resources.clone(),
                ..Container::default()
            }],
            affinity: vscr.spec.affinity.clone(),
            tolerations: vscr.spec.tolerations.clone(),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::VerticaScrutinizeSpec;
    use vertiop_operator::vdb::crd::Subcluster;

    fn fixtures() -> (VerticaScrutinize, VerticaDB) {
        let mut vscr = VerticaScrutinize::new(
            "diag1",
            VerticaScrutinizeSpec {
                vertica_db_name: "mydb".to_string(),
                ..Default::default()
            },
        );
        vscr.metadata.namespace = Some("default".to_string());

        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.spec.image = "opentext/vertica-k8s:24.3.0-0".to_string();
        vdb.spec.subclusters = vec![Subcluster {
            name: "main".to_string(),
            size: 2,
            ..Default::default()
        }];
        (vscr, vdb)
    }

    #[test]
    fn test_build_scrutinize_pod() {
        let (vscr, vdb) = fixtures();
        let pod = build_scrutinize_pod(&vscr, &vdb);
        assert_eq!(pod.name_any(), "diag1-scrutinize");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("opentext/vertica-k8s:24.3.0-0"));
        let command = container.command.as_ref().unwrap().join(" ");
        assert!(command.contains("mydb-main-0.mydb"));
        assert!(command.contains("mydb-main-1.mydb"));
    }
}
