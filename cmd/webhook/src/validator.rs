//! Synchronous validation of VerticaDB and VerticaAutoscaler objects.
//! Everything rejected here is also re-checked by the reconcilers, but a
//! webhook rejection reaches the user at apply time.

use vertiop_autoscaler::crd::VerticaAutoscaler;
use vertiop_k8s_util::parse::image_version;
use vertiop_operator::vdb::annotations::VCLUSTER_OPS_ANNOTATION;
use vertiop_operator::vdb::crd::{SubclusterType, VerticaDB};
use vertiop_operator::vdb::names;

use std::collections::HashSet;

use kube::runtime::reflector::Store;
use kube::{Resource, ResourceExt};

/// Earliest server version the direct vcluster-ops back-end supports.
const MIN_VCLUSTEROPS_VERSION: (u64, u64, u64) = (23, 3, 0);
/// First server version that dropped admintools from the image.
const MAX_ADMINTOOLS_VERSION: (u64, u64, u64) = (24, 2, 0);

pub fn validate_vdb(vdb: &VerticaDB, old: Option<&VerticaDB>) -> Result<(), String> {
    validate_subcluster_names(vdb)?;
    validate_primary_exists(vdb)?;
    validate_communal_path(vdb)?;
    validate_deployment_method(vdb)?;
    validate_sandboxes(vdb)?;
    if let Some(old) = old {
        validate_no_downgrade(vdb, old)?;
        validate_communal_immutable(vdb, old)?;
    }
    Ok(())
}

fn validate_subcluster_names(vdb: &VerticaDB) -> Result<(), String> {
    let mut seen = HashSet::new();
    for sc in &vdb.spec.subclusters {
        if !seen.insert(&sc.name) {
            return Err(format!("duplicate subcluster name: {}", sc.name));
        }
        if names::dns1035_label(&sc.name).is_empty() {
            return Err(format!(
                "subcluster name {} cannot be lowered to a DNS-1035 label",
                sc.name
            ));
        }
        if sc.size < 0 {
            return Err(format!("subcluster {} has a negative size", sc.name));
        }
    }
    Ok(())
}

fn validate_primary_exists(vdb: &VerticaDB) -> Result<(), String> {
    let primary_nodes: i32 = vdb
        .spec
        .subclusters
        .iter()
        .filter(|sc| sc.type_ == SubclusterType::Primary)
        .map(|sc| sc.size)
        .sum();
    if primary_nodes < 1 {
        return Err(
            "at least one primary subcluster with size > 0 must exist in the main cluster"
                .to_string(),
        );
    }
    Ok(())
}

fn validate_communal_path(vdb: &VerticaDB) -> Result<(), String> {
    let path = &vdb.spec.communal.path;
    let Some(scheme) = names::communal_scheme(path) else {
        return Err(format!(
            "unsupported communal scheme in {path}; use s3://, gs://, azb:// or a POSIX path"
        ));
    };
    if scheme != "/" {
        let rest = &path[scheme.len()..];
        let Some((bucket, prefix)) = rest.split_once('/') else {
            return Err(format!(
                "communal path {path} must carry a path prefix after the bucket"
            ));
        };
        if bucket.is_empty() || prefix.is_empty() {
            return Err(format!(
                "communal path {path} must be {scheme}<bucket>/<prefix>"
            ));
        }
    }
    Ok(())
}

fn validate_deployment_method(vdb: &VerticaDB) -> Result<(), String> {
    let Some(version) = image_version(&vdb.spec.image) else {
        // digest or floating tags cannot be checked, let them through
        return Ok(());
    };
    let vcluster_ops = vdb
        .annotations()
        .get(VCLUSTER_OPS_ANNOTATION)
        .map(String::as_str)
        == Some("true");
    if vcluster_ops && version < MIN_VCLUSTEROPS_VERSION {
        return Err(format!(
            "server image {} is too old for the vcluster-ops deployment method",
            vdb.spec.image
        ));
    }
    if !vcluster_ops && version >= MAX_ADMINTOOLS_VERSION {
        return Err(format!(
            "server image {} no longer ships admintools; set the {VCLUSTER_OPS_ANNOTATION} annotation",
            vdb.spec.image
        ));
    }
    Ok(())
}

fn validate_sandboxes(vdb: &VerticaDB) -> Result<(), String> {
    let subcluster_names: HashSet<&str> = vdb
        .spec
        .subclusters
        .iter()
        .map(|sc| sc.name.as_str())
        .collect();
    let mut sandbox_names = HashSet::new();
    let mut sandboxed = HashSet::new();
    for sb in &vdb.spec.sandboxes {
        if !sandbox_names.insert(&sb.name) {
            return Err(format!("duplicate sandbox name: {}", sb.name));
        }
        for member in &sb.subclusters {
            if !subcluster_names.contains(member.name.as_str()) {
                return Err(format!(
                    "sandbox {} references unknown subcluster {}",
                    sb.name, member.name
                ));
            }
            // a subcluster is in exactly one sandbox or in the main cluster
            if !sandboxed.insert(member.name.as_str()) {
                return Err(format!(
                    "subcluster {} is a member of more than one sandbox",
                    member.name
                ));
            }
            let sc = vdb
                .spec
                .subclusters
                .iter()
                .find(|sc| sc.name == member.name)
                .expect("membership checked above");
            if sc.type_ == SubclusterType::Primary {
                return Err(format!(
                    "primary subcluster {} cannot join a sandbox",
                    member.name
                ));
            }
        }
    }
    Ok(())
}

fn validate_no_downgrade(vdb: &VerticaDB, old: &VerticaDB) -> Result<(), String> {
    let (Some(new_version), Some(old_version)) =
        (image_version(&vdb.spec.image), image_version(&old.spec.image))
    else {
        return Ok(());
    };
    if new_version < old_version {
        return Err(format!(
            "image downgrade from {} to {} is not supported",
            old.spec.image, vdb.spec.image
        ));
    }
    Ok(())
}

fn validate_communal_immutable(vdb: &VerticaDB, old: &VerticaDB) -> Result<(), String> {
    if vdb.spec.communal.path != old.spec.communal.path
        || vdb.spec.db_name != old.spec.db_name
    {
        return Err("communal path and database name cannot change after creation".to_string());
    }
    Ok(())
}

/// Two autoscalers may not fight over the same subcluster of the same
/// database.
pub fn validate_autoscaler(
    vas: &VerticaAutoscaler,
    store: &Store<VerticaAutoscaler>,
) -> Result<(), String> {
    if vas.spec.min_replicas > vas.spec.max_replicas {
        return Err("minReplicas cannot exceed maxReplicas".to_string());
    }
    let namespace = vas.namespace().unwrap_or_else(|| "default".to_string());
    if let Some(existing) = store.state().into_iter().find(|other| {
        other.meta().uid != vas.meta().uid
            && other.namespace().unwrap_or_else(|| "default".to_string()) == namespace
            && other.spec.vertica_db_name == vas.spec.vertica_db_name
            && other.spec.subcluster == vas.spec.subcluster
    }) {
        return Err(format!(
            "autoscaler {} already targets subcluster {} of {}",
            existing.name_any(),
            vas.spec.subcluster,
            vas.spec.vertica_db_name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use vertiop_operator::vdb::crd::{Sandbox, SandboxSubcluster, Subcluster};

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.spec.image = "opentext/vertica-k8s:24.1.0-0".to_string();
        vdb.spec.communal.path = "s3://bucket/prefix".to_string();
        vdb.spec.subclusters = vec![
            Subcluster {
                name: "main".to_string(),
                size: 3,
                ..Default::default()
            },
            Subcluster {
                name: "sec1".to_string(),
                size: 2,
                type_: SubclusterType::Secondary,
                ..Default::default()
            },
        ];
        vdb
    }

    #[test]
    fn test_valid_vdb_passes() {
        assert!(validate_vdb(&vdb(), None).is_ok());
    }

    #[test]
    fn test_duplicate_subcluster_names() {
        let mut vdb = vdb();
        vdb.spec.subclusters[1].name = "main".to_string();
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("duplicate subcluster name"));
    }

    #[test]
    fn test_primary_required() {
        let mut vdb = vdb();
        vdb.spec.subclusters[0].type_ = SubclusterType::Secondary;
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("primary subcluster"));

        // scale-in of the last primary to zero is also rejected
        let mut vdb = self::vdb();
        vdb.spec.subclusters[0].size = 0;
        assert!(validate_vdb(&vdb, None).is_err());
    }

    #[test]
    fn test_communal_scheme_and_prefix() {
        let mut vdb = vdb();
        vdb.spec.communal.path = "ftp://bucket/prefix".to_string();
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("unsupported communal scheme"));

        let mut vdb = self::vdb();
        vdb.spec.communal.path = "s3://bucket".to_string();
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("path prefix"));

        let mut vdb = self::vdb();
        vdb.spec.communal.path = "/mnt/communal".to_string();
        assert!(validate_vdb(&vdb, None).is_ok());
    }

    #[test]
    fn test_deployment_method_compatibility() {
        // a modern image without vcluster-ops has no admintools to call
        let mut vdb = vdb();
        vdb.spec.image = "opentext/vertica-k8s:24.3.0-0".to_string();
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("admintools"));

        vdb.metadata.annotations = Some(
            [(VCLUSTER_OPS_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        assert!(validate_vdb(&vdb, None).is_ok());

        // an image predating the agent cannot use the direct back-end
        let mut vdb = self::vdb();
        vdb.spec.image = "opentext/vertica-k8s:12.0.4-0".to_string();
        vdb.metadata.annotations = Some(
            [(VCLUSTER_OPS_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("too old"));
    }

    #[test]
    fn test_sandbox_membership() {
        let mut vdb = vdb();
        vdb.spec.sandboxes = vec![
            Sandbox {
                name: "sb1".to_string(),
                subclusters: vec![SandboxSubcluster {
                    name: "sec1".to_string(),
                }],
                ..Default::default()
            },
            Sandbox {
                name: "sb2".to_string(),
                subclusters: vec![SandboxSubcluster {
                    name: "sec1".to_string(),
                }],
                ..Default::default()
            },
        ];
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("more than one sandbox"));

        let mut vdb = self::vdb();
        vdb.spec.sandboxes = vec![Sandbox {
            name: "sb1".to_string(),
            subclusters: vec![SandboxSubcluster {
                name: "nope".to_string(),
            }],
            ..Default::default()
        }];
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("unknown subcluster"));

        let mut vdb = self::vdb();
        vdb.spec.sandboxes = vec![Sandbox {
            name: "sb1".to_string(),
            subclusters: vec![SandboxSubcluster {
                name: "main".to_string(),
            }],
            ..Default::default()
        }];
        assert!(validate_vdb(&vdb, None)
            .unwrap_err()
            .contains("primary subcluster"));
    }

    #[test]
    fn test_downgrade_rejected() {
        let old = vdb();
        let mut new = vdb();
        new.spec.image = "opentext/vertica-k8s:12.0.4-0".to_string();
        assert!(validate_vdb(&new, Some(&old))
            .unwrap_err()
            .contains("downgrade"));

        // same and newer versions pass
        assert!(validate_vdb(&old, Some(&old)).is_ok());
    }

    #[test]
    fn test_communal_immutable() {
        let old = vdb();
        let mut new = vdb();
        new.spec.communal.path = "s3://bucket/other".to_string();
        assert!(validate_vdb(&new, Some(&old))
            .unwrap_err()
            .contains("cannot change"));
    }
}
