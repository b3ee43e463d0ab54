//! Status generation and the single gate through which `.status` is
//! written.

use crate::facts::PodFacts;
use crate::vdb::annotations;
use crate::vdb::crd::{
    SandboxStatus, SubclusterStatus, UpgradePhase, UpgradeStatus, VerticaDB, VerticaDBStatus,
};
use crate::vdb::names;

use vertiop_k8s_util::error::{Error, Result};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, trace};

/// The database exists in communal storage and serves queries.
pub const TYPE_DB_INITIALIZED: &str = "DBInitialized";
/// The operator restarts vertica processes it finds down.
pub const TYPE_AUTO_RESTART: &str = "AutoRestartVertica";
/// An image change is being rolled out.
pub const TYPE_UPGRADE_IN_PROGRESS: &str = "UpgradeInProgress";
/// Legacy alias of UpgradeInProgress, written alongside it.
pub const TYPE_IMAGE_CHANGE_IN_PROGRESS: &str = "ImageChangeInProgress";
/// Every desired node is up.
pub const TYPE_READY: &str = "Ready";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

const STATUS_CONFLICT_RETRIES: usize = 3;

pub fn make_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Timestamp::now()),
        observed_generation: generation,
    }
}

/// Replace or append `new_condition`, keeping the previous transition time
/// when the status value did not change.
pub fn update_conditions(
    previous_conditions: Vec<Condition>,
    new_condition: &Condition,
) -> Vec<Condition> {
    let mut merged = new_condition.clone();
    if let Some(existing) = previous_conditions
        .iter()
        .find(|c| c.type_ == new_condition.type_)
    {
        if existing.status == new_condition.status {
            merged.last_transition_time = existing.last_transition_time.clone();
        }
    }
    let merged_type = merged.type_.clone();
    previous_conditions
        .into_iter()
        .filter(|c| c.type_ != merged_type)
        .chain(std::iter::once(merged))
        .collect()
}

pub fn condition_status(status: Option<&VerticaDBStatus>, type_: &str) -> Option<bool> {
    status?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status == CONDITION_TRUE)
}

pub fn is_condition_true(status: Option<&VerticaDBStatus>, type_: &str) -> bool {
    condition_status(status, type_) == Some(true)
}

/// Condition lookup over a bare condition list, for sibling CR statuses.
pub fn conditions_contain_true(conditions: &Option<Vec<Condition>>, type_: &str) -> bool {
    conditions
        .as_ref()
        .map(|cs| cs.iter().any(|c| c.type_ == type_ && c.status == CONDITION_TRUE))
        .unwrap_or(false)
}

pub fn is_db_initialized(vdb: &VerticaDB) -> bool {
    is_condition_true(vdb.status.as_ref(), TYPE_DB_INITIALIZED)
}

/// Compute the new status from this iteration's facts. `upgrade` and
/// `extra_conditions` come from the reconciler's draft: steps record their
/// outcomes there and this function folds them in.
pub fn generate_status(
    vdb: &VerticaDB,
    facts: &PodFacts,
    upgrade: Option<UpgradeStatus>,
    restore_point: Option<String>,
    extra_conditions: &[Condition],
) -> VerticaDBStatus {
    let previous = vdb.status.clone().unwrap_or_default();
    let generation = vdb.metadata.generation;

    let subclusters = vdb
        .spec
        .subclusters
        .iter()
        .map(|sc| {
            let label = annotations::subcluster_selector_override(vdb, &sc.name)
                .unwrap_or_else(|| sc.name.clone());
            let added = facts
                .subcluster(&label)
                .filter(|p| p.added_to_db == Some(true))
                .count() as i32;
            let up = facts
                .subcluster(&label)
                .filter(|p| p.up == Some(true))
                .count() as i32;
            SubclusterStatus {
                name: sc.name.clone(),
                statefulset_name: names::statefulset_name(vdb, &sc.name),
                added_to_db_count: added,
                up_node_count: up,
                type_: sc.type_,
                shutdown: sc.shutdown,
            }
        })
        .collect::<Vec<_>>();

    let sandboxes = vdb
        .spec
        .sandboxes
        .iter()
        .map(|sb| SandboxStatus {
            name: sb.name.clone(),
            subclusters: sb.subclusters.iter().map(|s| s.name.clone()).collect(),
            image: facts
                .in_sandbox(&sb.name)
                .find_map(|p| p.image.clone())
                .or_else(|| Some(sb.image.clone().unwrap_or_else(|| vdb.spec.image.clone()))),
        })
        .collect::<Vec<_>>();

    let desired: i32 = vdb
        .spec
        .subclusters
        .iter()
        .filter(|sc| !sc.shutdown)
        .map(|sc| sc.size)
        .sum();
    let up_node_count = facts.up_count();

    let upgrading = upgrade
        .as_ref()
        .map(|u| u.phase != UpgradePhase::Idle)
        .unwrap_or(false);
    let upgrade_reason = upgrade
        .as_ref()
        .map(|u| u.phase.to_string())
        .unwrap_or_else(|| UpgradePhase::Idle.to_string());

    let computed = [
        make_condition(
            TYPE_AUTO_RESTART,
            if vdb.spec.auto_restart_vertica {
                CONDITION_TRUE
            } else {
                CONDITION_FALSE
            },
            "SpecSetting",
            "Automatic restart of down nodes follows the spec.",
            generation,
        ),
        make_condition(
            TYPE_READY,
            if desired > 0 && up_node_count == desired {
                CONDITION_TRUE
            } else {
                CONDITION_FALSE
            },
            if desired > 0 && up_node_count == desired {
                "AllNodesUp"
            } else {
                "NodesDownOrMissing"
            },
            &format!("{up_node_count} of {desired} desired nodes are up."),
            generation,
        ),
        make_condition(
            TYPE_UPGRADE_IN_PROGRESS,
            if upgrading {
                CONDITION_TRUE
            } else {
                CONDITION_FALSE
            },
            &upgrade_reason,
            "Image rollout state.",
            generation,
        ),
        make_condition(
            TYPE_IMAGE_CHANGE_IN_PROGRESS,
            if upgrading {
                CONDITION_TRUE
            } else {
                CONDITION_FALSE
            },
            &upgrade_reason,
            "Image rollout state (legacy alias).",
            generation,
        ),
    ];

    let conditions = computed
        .iter()
        .chain(extra_conditions.iter())
        .fold(previous.conditions.unwrap_or_default(), |acc, c| {
            update_conditions(acc, c)
        });

    VerticaDBStatus {
        conditions: Some(conditions),
        added_to_db_count: facts.added_count(),
        up_node_count,
        subcluster_count: vdb.spec.subclusters.len() as i32,
        subclusters,
        sandboxes,
        restore_point: restore_point.or(previous.restore_point),
        upgrade,
    }
}

/// Write `.status` with optimistic concurrency: server-side apply under the
/// operator's field manager, re-read and retried on conflict a bounded
/// number of times.
pub async fn patch_status(
    client: Client,
    vdb: &VerticaDB,
    operator_name: &str,
    new_status: &VerticaDBStatus,
) -> Result<()> {
    // safe unwrap: VerticaDB is namespaced scoped
    let namespace = vdb.namespace().unwrap();
    let name = vdb.name_any();
    let api = Api::<VerticaDB>::namespaced(client, &namespace);
    let patch = Patch::Apply(json!({
        "apiVersion": "vertica.com/v1",
        "kind": "VerticaDB",
        "status": new_status,
    }));
    debug!(msg = "updating VerticaDB status");
    trace!(msg = format!("new status {new_status:?}"));

    let mut attempt = 0;
    loop {
        let params = if attempt == 0 {
            PatchParams::apply(operator_name)
        } else {
            PatchParams::apply(operator_name).force()
        };
        match api.patch_status(&name, &params, &patch).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < STATUS_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(msg = "status conflict, retrying", attempt);
            }
            Err(e) => {
                return Err(Error::KubeError(
                    format!("failed to patch VerticaDB/status {namespace}/{name}"),
                    Box::new(e),
                ));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::facts::{PodFact, PodFacts};
    use crate::vdb::crd::{Subcluster, UpgradeMarker, UpgradePolicy};

    fn vdb() -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some("mydb".to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.spec.subclusters = vec![Subcluster {
            name: "main".to_string(),
            size: 3,
            ..Default::default()
        }];
        vdb
    }

    fn up_fact(subcluster: &str, ordinal: i32) -> PodFact {
        PodFact {
            name: format!("mydb-{subcluster}-{ordinal}"),
            subcluster: subcluster.to_string(),
            ordinal,
            running: true,
            up: Some(true),
            added_to_db: Some(true),
            installed: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_status_counts() {
        let facts = PodFacts {
            pods: vec![
                up_fact("main", 0),
                up_fact("main", 1),
                PodFact {
                    name: "mydb-main-2".to_string(),
                    subcluster: "main".to_string(),
                    ordinal: 2,
                    running: true,
                    up: Some(false),
                    added_to_db: Some(true),
                    installed: Some(true),
                    ..Default::default()
                },
            ],
        };
        let status = generate_status(&vdb(), &facts, None, None, &[]);
        assert_eq!(status.added_to_db_count, 3);
        assert_eq!(status.up_node_count, 2);
        assert_eq!(status.subclusters.len(), 1);
        assert_eq!(status.subclusters[0].added_to_db_count, 3);
        assert_eq!(status.subclusters[0].up_node_count, 2);
        assert_eq!(status.subclusters[0].statefulset_name, "mydb-main");
        assert!(!is_condition_true(Some(&status), TYPE_READY));
        assert!(!is_condition_true(Some(&status), TYPE_UPGRADE_IN_PROGRESS));
    }

    #[test]
    fn test_generate_status_ready_when_all_up() {
        let facts = PodFacts {
            pods: vec![up_fact("main", 0), up_fact("main", 1), up_fact("main", 2)],
        };
        let status = generate_status(&vdb(), &facts, None, None, &[]);
        assert!(is_condition_true(Some(&status), TYPE_READY));
    }

    #[test]
    fn test_upgrade_condition_reason_carries_phase() {
        let facts = PodFacts::default();
        let upgrade = UpgradeStatus {
            policy: UpgradePolicy::Online,
            phase: UpgradePhase::Replicating,
            markers: vec![
                UpgradeMarker::UpgradeStarted,
                UpgradeMarker::SandboxCreated,
                UpgradeMarker::ClientTrafficShifted,
            ],
            started_at: None,
            target_image: None,
        };
        let status = generate_status(&vdb(), &facts, Some(upgrade), None, &[]);
        let conditions = status.conditions.as_ref().unwrap();
        let upgrade_cond = conditions
            .iter()
            .find(|c| c.type_ == TYPE_UPGRADE_IN_PROGRESS)
            .unwrap();
        assert_eq!(upgrade_cond.status, CONDITION_TRUE);
        assert_eq!(upgrade_cond.reason, "Replicating");
        // the legacy alias mirrors the modern condition
        let alias = conditions
            .iter()
            .find(|c| c.type_ == TYPE_IMAGE_CHANGE_IN_PROGRESS)
            .unwrap();
        assert_eq!(alias.status, CONDITION_TRUE);
    }

    #[test]
    fn test_update_conditions_preserves_transition_time() {
        let old = make_condition(TYPE_READY, CONDITION_TRUE, "AllNodesUp", "", None);
        let old_time = old.last_transition_time.clone();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let new = make_condition(TYPE_READY, CONDITION_TRUE, "AllNodesUp", "", None);
        let merged = update_conditions(vec![old], &new);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time, old_time);
    }

    #[test]
    fn test_update_conditions_flips_transition_time() {
        let old = make_condition(TYPE_READY, CONDITION_TRUE, "AllNodesUp", "", None);
        let old_time = old.last_transition_time.clone();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let new = make_condition(TYPE_READY, CONDITION_FALSE, "NodesDownOrMissing", "", None);
        let merged = update_conditions(vec![old], &new);
        assert_eq!(merged.len(), 1);
        assert_ne!(merged[0].last_transition_time, old_time);
        assert_eq!(merged[0].status, CONDITION_FALSE);
    }

    #[test]
    fn test_extra_conditions_folded() {
        let extra = make_condition(TYPE_DB_INITIALIZED, CONDITION_TRUE, "DBCreated", "", None);
        let status = generate_status(&vdb(), &PodFacts::default(), None, None, &[extra]);
        assert!(is_condition_true(Some(&status), TYPE_DB_INITIALIZED));
    }
}
