use crate::vdb::crd::{Subcluster, VerticaDB};
use crate::vdb::names;
use crate::vdb::reconcile::labels::pod_labels;
use crate::vdb::reconcile::statefulset::CLIENT_PORT;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ObjectMeta, Resource};
use kube::ResourceExt;

const PROXY_CONTAINER: &str = "proxy";
const PROXY_CONFIG_PATH: &str = "/etc/vproxy";
const DEFAULT_PROXY_IMAGE: &str = "opentext/client-proxy:latest";

fn proxy_labels(vdb: &VerticaDB, sc: &Subcluster) -> BTreeMap<String, String> {
    pod_labels(vdb, &sc.name, None)
        .into_iter()
        .chain([(
            "vertica.com/proxy".to_string(),
            "true".to_string(),
        )])
        .collect()
}

/// The client-proxy deployment of a subcluster, built iff
/// `proxy.replicas > 0`. Session routing follows the subcluster service,
/// so flipping that service's selector shifts where new sessions land.
pub fn build_proxy_deployment(vdb: &VerticaDB, sc: &Subcluster) -> Option<Deployment> {
    let proxy = sc.proxy.as_ref().filter(|p| p.replicas > 0)?;
    let labels = proxy_labels(vdb, sc);

    Some(Deployment {
        metadata: ObjectMeta {
            name: Some(names::proxy_deployment_name(vdb, &sc.name)),
            namespace: vdb.namespace(),
            labels: Some(labels.clone()),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(proxy.replicas),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(labels.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: PROXY_CONTAINER.to_string(),
                        image: Some(
                            proxy
                                .image
                                .clone()
                                .unwrap_or_else(|| DEFAULT_PROXY_IMAGE.to_string()),
                        ),
                        ports: Some(vec![ContainerPort {
                            name: Some("client".to_string()),
                            container_port: CLIENT_PORT,
                            ..ContainerPort::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "config".to_string(),
                            mount_path: PROXY_CONFIG_PATH.to_string(),
                            read_only: Some(true),
                            ..VolumeMount::default()
                        }]),
                        ..Container::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(names::proxy_deployment_name(vdb, &sc.name)),
                            ..ConfigMapVolumeSource::default()
                        }),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}

/// Routing config of the client proxy: it forwards to the subcluster
/// service, which owns the authoritative selector.
pub fn build_proxy_configmap(vdb: &VerticaDB, sc: &Subcluster) -> Option<ConfigMap> {
    sc.proxy.as_ref().filter(|p| p.replicas > 0)?;
    let backend = format!(
        "{}.{}.svc:{}",
        names::subcluster_service_name(vdb, &sc.name),
        // safe unwrap: VerticaDB is namespaced scoped
        vdb.namespace().unwrap(),
        CLIENT_PORT
    );
    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(names::proxy_deployment_name(vdb, &sc.name)),
            namespace: vdb.namespace(),
            labels: Some(proxy_labels(vdb, sc)),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "config.yaml".to_string(),
            format!("listener:\n  port: {CLIENT_PORT}\nbackend: {backend}\n"),
        )])),
        ..ConfigMap::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::{Proxy, Subcluster};

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb
    }

    #[test]
    fn test_no_proxy_without_replicas() {
        let sc = Subcluster {
            name: "main".to_string(),
            size: 3,
            ..Default::default()
        };
        assert!(build_proxy_deployment(&vdb(), &sc).is_none());

        let sc = Subcluster {
            proxy: Some(Proxy {
                replicas: 0,
                image: None,
            }),
            ..sc
        };
        assert!(build_proxy_deployment(&vdb(), &sc).is_none());
        assert!(build_proxy_configmap(&vdb(), &sc).is_none());
    }

    #[test]
    fn test_proxy_deployment() {
        let sc = Subcluster {
            name: "main".to_string(),
            size: 3,
            proxy: Some(Proxy {
                replicas: 2,
                image: None,
            }),
            ..Default::default()
        };
        let deploy = build_proxy_deployment(&vdb(), &sc).unwrap();
        assert_eq!(deploy.name_any(), "mydb-main-proxy");
        let spec = deploy.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let image = spec.template.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some(DEFAULT_PROXY_IMAGE));

        let cm = build_proxy_configmap(&vdb(), &sc).unwrap();
        assert!(cm.data.unwrap()["config.yaml"].contains("mydb-main.default.svc:5433"));
    }
}
