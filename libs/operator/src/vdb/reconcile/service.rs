use crate::vdb::crd::{Subcluster, VerticaDB};
use crate::vdb::names;
use crate::vdb::reconcile::labels::{common_labels, pod_labels, SUBCLUSTER_LABEL};
use crate::vdb::reconcile::statefulset::{CLIENT_PORT, HTTPS_PORT, INTERNODE_PORT};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ObjectMeta, Resource};
use kube::ResourceExt;

/// The headless service governing every pod of the database; gives pods
/// their stable DNS names.
pub fn build_headless_service(vdb: &VerticaDB) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(names::headless_service_name(vdb)),
            namespace: vdb.namespace(),
            labels: Some(common_labels(vdb)),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(common_labels(vdb)),
            ports: Some(vec![ServicePort {
                name: Some("internode".to_string()),
                port: INTERNODE_PORT,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// The client service of one subcluster. `selector_subcluster` is normally
/// the subcluster itself; during the traffic-shift step of an online
/// upgrade it points at the replica-group-b twin instead, so new sessions
/// land there while old connections drain.
pub fn build_subcluster_service(
    vdb: &VerticaDB,
    sc: &Subcluster,
    selector_subcluster: &str,
) -> Service {
    let mut selector = pod_labels(vdb, &sc.name, None);
    selector.insert(
        SUBCLUSTER_LABEL.to_string(),
        selector_subcluster.to_string(),
    );
    Service {
        metadata: ObjectMeta {
            name: Some(names::subcluster_service_name(vdb, &sc.name)),
            namespace: vdb.namespace(),
            labels: Some(pod_labels(vdb, &sc.name, None)),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: sc.service_type.clone().or(Some("ClusterIP".to_string())),
            selector: Some(selector),
            ports: Some(vec![
                ServicePort {
                    name: Some("client".to_string()),
                    port: CLIENT_PORT,
                    target_port: Some(IntOrString::Int(CLIENT_PORT)),
                    ..ServicePort::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    port: HTTPS_PORT,
                    target_port: Some(IntOrString::Int(HTTPS_PORT)),
                    ..ServicePort::default()
                },
            ]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::Subcluster;

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb
    }

    #[test]
    fn test_headless_service() {
        let svc = build_headless_service(&vdb());
        assert_eq!(svc.name_any(), "mydb");
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert!(spec.selector.unwrap().contains_key("vertica.com/database"));
    }

    #[test]
    fn test_subcluster_service_selector() {
        let sc = Subcluster {
            name: "main".to_string(),
            size: 3,
            service_type: Some("NodePort".to_string()),
            ..Default::default()
        };
        let svc = build_subcluster_service(&vdb(), &sc, "main");
        assert_eq!(svc.name_any(), "mydb-main");
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.selector.unwrap()[SUBCLUSTER_LABEL], "main");
    }

    #[test]
    fn test_subcluster_service_traffic_shift() {
        let sc = Subcluster {
            name: "main".to_string(),
            size: 3,
            ..Default::default()
        };
        let svc = build_subcluster_service(&vdb(), &sc, "main-sb");
        // the service keeps its canonical name but selects the twin
        assert_eq!(svc.name_any(), "mydb-main");
        assert_eq!(
            svc.spec.unwrap().selector.unwrap()[SUBCLUSTER_LABEL],
            "main-sb"
        );
    }
}
