use crate::vadmin::{DeploymentMethod, NMA_CONTAINER, SERVER_CONTAINER};
use crate::vdb::crd::{DepotVolumeType, Subcluster, VerticaDB};
use crate::vdb::names;
use crate::vdb::reconcile::labels::pod_labels;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource,
    TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ObjectMeta, Resource};
use kube::ResourceExt;

pub const CLIENT_PORT: i32 = 5433;
pub const INTERNODE_PORT: i32 = 5434;
pub const HTTPS_PORT: i32 = 8443;

const VOLUME_LOCAL_NAME: &str = "local-data";
const VOLUME_DEPOT_NAME: &str = "depot";
const VOLUME_LICENSE_NAME: &str = "license";
const VOLUME_NMA_TLS_NAME: &str = "nma-certs";
const LICENSE_PATH: &str = "/home/dbadmin/licensing/mnt";
const NMA_TLS_PATH: &str = "/opt/vertica/config/https_certs";

/// Inputs that vary per built StatefulSet beyond the subcluster itself:
/// sandbox members carry the sandbox label, the replica-group-b twin of an
/// online upgrade runs under its own subcluster name with a different
/// image, and the pod template carries rolling annotations such as the TLS
/// material hash.
#[derive(Default, Clone)]
pub struct BuildContext {
    pub replicas: i32,
    pub sandbox: Option<String>,
    /// Deploy under this subcluster name instead of the spec one (the
    /// "-sb" twin of an online upgrade).
    pub subcluster_name: Option<String>,
    pub image_override: Option<String>,
    pub template_annotations: BTreeMap<String, String>,
}

/// The desired StatefulSet of one subcluster. Deterministic for a given
/// input snapshot.
pub fn build_statefulset(vdb: &VerticaDB, sc: &Subcluster, build: &BuildContext) -> StatefulSet {
    let subcluster_name = build
        .subcluster_name
        .clone()
        .unwrap_or_else(|| sc.name.clone());
    let sts_name = names::statefulset_name(vdb, &subcluster_name);
    let image = build
        .image_override
        .clone()
        .unwrap_or_else(|| vdb.spec.image.clone());

    let pod_labels = pod_labels(vdb, &subcluster_name, build.sandbox.as_deref());
    let labels: BTreeMap<String, String> = vdb
        .labels()
        .clone()
        .into_iter()
        .chain(pod_labels.clone())
        .collect();

    let (volumes, volume_claim_templates) = storage(vdb);
    let containers = containers(vdb, sc, &image);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(sts_name),
            namespace: vdb.namespace(),
            labels: Some(labels),
            owner_references: vdb.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(build.replicas),
            // the operator decides restart order; never let the controller
            // roll pods on template changes
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            pod_management_policy: Some("Parallel".to_string()),
            service_name: Some(names::headless_service_name(vdb)),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(pod_labels.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: if build.template_annotations.is_empty() {
                        None
                    } else {
                        Some(build.template_annotations.clone())
                    },
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    node_selector: sc.node_selector.clone(),
                    affinity: sc.affinity.clone(),
                    tolerations: sc.tolerations.clone(),
                    image_pull_secrets: vdb.spec.image_pull_secret.as_ref().map(|name| {
                        vec![k8s_openapi::api::core::v1::LocalObjectReference {
                            name: name.clone(),
                        }]
                    }),
                    ..PodSpec::default()
                }),
            },
            volume_claim_templates,
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    }
}

fn containers(vdb: &VerticaDB, sc: &Subcluster, image: &str) -> Vec<Container> {
    let env = vec![
        EnvVar {
            name: "VERTICA_DB_NAME".to_string(),
            value: Some(vdb.spec.db_name.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "DATA_PATH".to_string(),
            value: Some(vdb.spec.local.data_path.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "CATALOG_PATH".to_string(),
            value: Some(vdb.spec.local.catalog_path.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "DEPOT_PATH".to_string(),
            value: Some(vdb.spec.local.depot_path.clone()),
            ..EnvVar::default()
        },
    ];

    let readiness = Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(CLIENT_PORT),
            ..TCPSocketAction::default()
        }),
        ..Probe::default()
    };

    let server = Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: vdb.spec.image_pull_policy.clone(),
        env: Some(env),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: CLIENT_PORT,
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some("internode".to_string()),
                container_port: INTERNODE_PORT,
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some("https".to_string()),
                container_port: HTTPS_PORT,
                ..ContainerPort::default()
            },
        ]),
        volume_mounts: Some(server_volume_mounts(vdb)),
        resources: sc.resources.clone(),
        readiness_probe: Some(readiness),
        ..Container::default()
    };

    match crate::vadmin::DeploymentMethod::from_vdb(vdb) {
        DeploymentMethod::VclusterOps => vec![server, nma_container(vdb, image)],
        DeploymentMethod::Admintools => vec![server],
    }
}

fn nma_container(vdb: &VerticaDB, image: &str) -> Container {
    let mut mounts = vec![];
    if nma_tls_secret_name(vdb).is_some() {
        mounts.push(VolumeMount {
            name: VOLUME_NMA_TLS_NAME.to_string(),
            mount_path: NMA_TLS_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }
    Container {
        name: NMA_CONTAINER.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "/opt/vertica/bin/node_management_agent".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("nma".to_string()),
            container_port: crate::vadmin::vclusterops::NMA_PORT as i32,
            ..ContainerPort::default()
        }]),
        volume_mounts: if mounts.is_empty() {
            None
        } else {
            Some(mounts)
        },
        ..Container::default()
    }
}

fn server_volume_mounts(vdb: &VerticaDB) -> Vec<VolumeMount> {
    let local = &vdb.spec.local;
    let mut mounts = vec![VolumeMount {
        name: VOLUME_LOCAL_NAME.to_string(),
        mount_path: local.data_path.clone(),
        sub_path: Some("data".to_string()),
        ..VolumeMount::default()
    }];
    if local.catalog_path != local.data_path {
        mounts.push(VolumeMount {
            name: VOLUME_LOCAL_NAME.to_string(),
            mount_path: local.catalog_path.clone(),
            sub_path: Some("catalog".to_string()),
            ..VolumeMount::default()
        });
    }
    match local.depot_volume {
        DepotVolumeType::PersistentVolume => mounts.push(VolumeMount {
            name: VOLUME_LOCAL_NAME.to_string(),
            mount_path: local.depot_path.clone(),
            sub_path: Some("depot".to_string()),
            ..VolumeMount::default()
        }),
        DepotVolumeType::EmptyDir => mounts.push(VolumeMount {
            name: VOLUME_DEPOT_NAME.to_string(),
            mount_path: local.depot_path.clone(),
            ..VolumeMount::default()
        }),
    }
    if vdb.spec.license_secret.is_some() {
        mounts.push(VolumeMount {
            name: VOLUME_LICENSE_NAME.to_string(),
            mount_path: LICENSE_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }
    mounts
}

fn storage(vdb: &VerticaDB) -> (Vec<Volume>, Option<Vec<PersistentVolumeClaim>>) {
    let mut volumes = vec![];
    if vdb.spec.local.depot_volume == DepotVolumeType::EmptyDir {
        volumes.push(Volume {
            name: VOLUME_DEPOT_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
    }
    if let Some(license) = &vdb.spec.license_secret {
        volumes.push(Volume {
            name: VOLUME_LICENSE_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(license.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
    }
    if let Some(tls) = nma_tls_secret_name(vdb) {
        volumes.push(Volume {
            name: VOLUME_NMA_TLS_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
    }

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(VOLUME_LOCAL_NAME.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: vdb.spec.local.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(vdb.spec.local.request_size.clone()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    };

    (volumes, Some(vec![claim]))
}

/// The secret mounted for the node management agent: the https secret wins
/// over the plain NMA one.
pub fn nma_tls_secret_name(vdb: &VerticaDB) -> Option<String> {
    vdb.spec
        .https_nma_tls_secret
        .clone()
        .or_else(|| vdb.spec.nma_tls_secret.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdb::crd::{DepotVolumeType, Subcluster, VerticaDB};

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.spec.image = "opentext/vertica-k8s:24.3.0-0".to_string();
        vdb
    }

    fn subcluster(name: &str, size: i32) -> Subcluster {
        Subcluster {
            name: name.to_string(),
            size,
            ..Default::default()
        }
    }

    fn build(replicas: i32) -> BuildContext {
        BuildContext {
            replicas,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_statefulset_basics() {
        let vdb = vdb();
        let sts = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        assert_eq!(sts.name_any(), "mydb-main");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("mydb"));
        assert_eq!(
            spec.update_strategy.unwrap().type_.as_deref(),
            Some("OnDelete")
        );
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector["vertica.com/subcluster"], "main");
        assert_eq!(selector["vertica.com/database"], "vertdb");

        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].name, "server");
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("opentext/vertica-k8s:24.3.0-0")
        );
        // depot defaults to the persistent volume, so only the PVC template
        assert_eq!(spec.volume_claim_templates.unwrap().len(), 1);
    }

    #[test]
    fn test_build_statefulset_owner_ref_requires_uid() {
        let mut vdb = vdb();
        vdb.metadata.uid = Some("uid-1".to_string());
        let sts = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        let orefs = sts.metadata.owner_references.unwrap();
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].kind, "VerticaDB");
        assert_eq!(orefs[0].name, "mydb");
    }

    #[test]
    fn test_depot_empty_dir() {
        let mut vdb = vdb();
        vdb.spec.local.depot_volume = DepotVolumeType::EmptyDir;
        let sts = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        let volumes = pod_spec.volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == "depot" && v.empty_dir.is_some()));
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.name == "depot" && m.mount_path == "/depot"));
    }

    #[test]
    fn test_nma_sidecar_under_vclusterops() {
        let mut vdb = vdb();
        vdb.metadata.annotations = Some(
            [("vertica.com/vcluster-ops".to_string(), "true".to_string())].into(),
        );
        vdb.spec.https_nma_tls_secret = Some("mydb-nma-tls".to_string());
        let sts = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.containers.len(), 2);
        let nma = &pod_spec.containers[1];
        assert_eq!(nma.name, "nma");
        assert!(pod_spec
            .volumes
            .unwrap()
            .iter()
            .any(|v| v.secret.as_ref().and_then(|s| s.secret_name.as_deref())
                == Some("mydb-nma-tls")));
    }

    #[test]
    fn test_sandbox_twin_naming_and_image() {
        let vdb = vdb();
        let ctx = BuildContext {
            replicas: 3,
            sandbox: Some("replica-group-b".to_string()),
            subcluster_name: Some(names::sandbox_subcluster_name("main")),
            image_override: Some("opentext/vertica-k8s:24.4.0-0".to_string()),
            ..Default::default()
        };
        let sts = build_statefulset(&vdb, &subcluster("main", 3), &ctx);
        assert_eq!(sts.name_any(), "mydb-main-sb");
        let spec = sts.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector["vertica.com/subcluster"], "main-sb");
        assert_eq!(selector["vertica.com/sandbox"], "replica-group-b");
        assert_eq!(
            spec.template.spec.unwrap().containers[0].image.as_deref(),
            Some("opentext/vertica-k8s:24.4.0-0")
        );
    }

    #[test]
    fn test_deterministic_output(){
        let vdb = vdb();
        let a = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        let b = build_statefulset(&vdb, &subcluster("main", 3), &build(3));
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }
}
