//! Sandbox-local reconcile: offline upgrades and restarts scoped to one
//! sandbox's pods, driven by the per-sandbox ConfigMap the VerticaDB
//! controller writes. Running from a separate controller means a sandbox
//! image move never races the main cluster's reconcile.

use crate::controller::Context;

use vertiop_operator::controller::DEFAULT_RECONCILE_INTERVAL;
use vertiop_operator::facts::PodFacts;
use vertiop_operator::telemetry;
use vertiop_operator::vadmin::{ClusterTarget, Dispatcher};
use vertiop_operator::vdb::crd::VerticaDB;
use vertiop_operator::vdb::reconcile::configmap::{
    DATA_IMAGE, DATA_SANDBOX_NAME, DATA_VDB_NAME,
};
use vertiop_operator::vdb::reconcile::labels::{INSTANCE_LABEL, SANDBOX_LABEL};

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::exec::PodRunner;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

const REQUEUE_SHORT: Duration = Duration::from_secs(10);
const REQUEUE_WAIT: Duration = Duration::from_secs(30);

#[instrument(skip(ctx, cm))]
pub async fn reconcile_sandbox(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.op_ctx.metrics.reconcile_count_and_measure();

    let data = cm
        .data
        .as_ref()
        .ok_or_else(|| Error::MissingData("sandbox config map has no data".to_string()))?;
    let vdb_name = data
        .get(DATA_VDB_NAME)
        .ok_or_else(|| Error::MissingData(format!("missing {DATA_VDB_NAME}")))?;
    let sandbox = data
        .get(DATA_SANDBOX_NAME)
        .ok_or_else(|| Error::MissingData(format!("missing {DATA_SANDBOX_NAME}")))?;
    let image = data
        .get(DATA_IMAGE)
        .ok_or_else(|| Error::MissingData(format!("missing {DATA_IMAGE}")))?;
    // safe unwrap: config maps from the watch are namespaced
    let namespace = cm.namespace().unwrap();

    let Some(vdb) = ctx.op_ctx.vdb_store.find(|v| {
        v.name_any() == *vdb_name && kube::ResourceExt::namespace(v).as_deref() == Some(&namespace)
    }) else {
        debug!(msg = "owning VerticaDB not cached yet", vdb_name);
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    info!(msg = "reconciling sandbox", sandbox, image);
    let runner = PodRunner::new(ctx.op_ctx.client.clone());
    let facts = PodFacts::collect(&runner, &ctx.op_ctx.pod_store, &vdb).await?;
    let dispatcher = Dispatcher::from_vdb(
        ctx.op_ctx.client.clone(),
        ctx.op_ctx.metrics.clone(),
        &vdb,
        None,
    )?;

    let sandbox_pods: Vec<_> = facts.in_sandbox(sandbox).cloned().collect();
    if sandbox_pods.is_empty() {
        debug!(msg = "sandbox has no pods yet");
        return Ok(Action::requeue(REQUEUE_WAIT));
    }

    let member_sets = sandbox_statefulsets(&ctx, &vdb, sandbox, &namespace);
    let set_images: Vec<(String, Option<String>)> = member_sets
        .iter()
        .map(|sts| (sts.name_any(), statefulset_image(sts)))
        .collect();

    match next_step(&sandbox_pods, &set_images, image) {
        SandboxStep::StopSandbox => {
            let initiator = facts
                .sandbox_initiator(sandbox)
                .map(|p| p.pod_ref(&vdb))
                .ok_or_else(|| Error::PodNotReady(format!("no pod to stop sandbox {sandbox}")))?;
            info!(msg = "stopping sandbox for image change", sandbox);
            dispatcher
                .stop_db(&initiator, ClusterTarget::Sandbox(sandbox))
                .await?;
            Ok(Action::requeue(REQUEUE_WAIT))
        }
        SandboxStep::BumpStatefulSets(names) => {
            for sts in member_sets.iter().filter(|s| names.contains(&s.name_any())) {
                bump_statefulset_image(&ctx, sts, image, &namespace).await?;
            }
            Ok(Action::requeue(REQUEUE_SHORT))
        }
        SandboxStep::RollPods(names) => {
            let api: Api<Pod> = Api::namespaced(ctx.op_ctx.client.clone(), &namespace);
            for pod in &names {
                debug!(msg = "rolling sandbox pod to new image", pod);
                let _ignore_missing = api.delete(pod, &Default::default()).await;
            }
            Ok(Action::requeue(REQUEUE_WAIT))
        }
        SandboxStep::StartSandbox => {
            let initiator = facts
                .sandbox_initiator(sandbox)
                .map(|p| p.pod_ref(&vdb))
                .ok_or_else(|| Error::PodNotReady(format!("no pod to start sandbox {sandbox}")))?;
            info!(msg = "starting sandbox", sandbox);
            dispatcher
                .start_db(
                    &initiator,
                    ClusterTarget::Sandbox(sandbox),
                    vertiop_operator::vadmin::DEFAULT_ADMIN_TIMEOUT,
                )
                .await?;
            Ok(Action::requeue(REQUEUE_WAIT))
        }
        SandboxStep::RestartNodes(names) => {
            let initiator = facts
                .sandbox_initiator(sandbox)
                .map(|p| p.pod_ref(&vdb))
                .ok_or_else(|| Error::PodNotReady(format!("no up pod in sandbox {sandbox}")))?;
            for pod in sandbox_pods.iter().filter(|p| names.contains(&p.name)) {
                info!(msg = "restarting sandbox node", pod = pod.name);
                dispatcher
                    .restart_node(&initiator, &pod.pod_ref(&vdb))
                    .await?;
            }
            Ok(Action::requeue(REQUEUE_SHORT))
        }
        SandboxStep::Converged => Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL)),
    }
}

/// What the sandbox needs next to converge on the override image: the
/// offline sequence stop, bump the sets, roll the pods, start, then
/// individual restarts once the image settled.
#[derive(Debug, PartialEq)]
enum SandboxStep {
    StopSandbox,
    BumpStatefulSets(Vec<String>),
    RollPods(Vec<String>),
    StartSandbox,
    RestartNodes(Vec<String>),
    Converged,
}

fn next_step(
    sandbox_pods: &[vertiop_operator::facts::PodFact],
    set_images: &[(String, Option<String>)],
    image: &str,
) -> SandboxStep {
    let stale_sets: Vec<String> = set_images
        .iter()
        .filter(|(_, current)| current.as_deref() != Some(image))
        .map(|(name, _)| name.clone())
        .collect();
    if !stale_sets.is_empty() {
        // the database must stop before any image moves
        if sandbox_pods.iter().any(|p| p.up == Some(true)) {
            return SandboxStep::StopSandbox;
        }
        return SandboxStep::BumpStatefulSets(stale_sets);
    }

    let stale_pods: Vec<String> = sandbox_pods
        .iter()
        .filter(|p| p.running && p.image.as_deref() != Some(image))
        .map(|p| p.name.clone())
        .collect();
    if !stale_pods.is_empty() {
        return SandboxStep::RollPods(stale_pods);
    }

    if sandbox_pods.iter().all(|p| p.up != Some(true)) {
        return SandboxStep::StartSandbox;
    }

    let down: Vec<String> = sandbox_pods
        .iter()
        .filter(|p| p.running && p.added_to_db == Some(true) && p.up == Some(false))
        .map(|p| p.name.clone())
        .collect();
    if !down.is_empty() {
        return SandboxStep::RestartNodes(down);
    }
    SandboxStep::Converged
}

fn sandbox_statefulsets(
    ctx: &Context,
    vdb: &VerticaDB,
    sandbox: &str,
    namespace: &str,
) -> Vec<Arc<StatefulSet>> {
    let instance = vdb.name_any();
    ctx.statefulset_store
        .state()
        .into_iter()
        .filter(|sts| {
            sts.namespace().as_deref() == Some(namespace)
                && sts.labels().get(INSTANCE_LABEL) == Some(&instance)
                && sts.labels().get(SANDBOX_LABEL).map(String::as_str) == Some(sandbox)
        })
        .collect()
}

fn statefulset_image(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

/// Replace the container images of a sandbox StatefulSet. The full
/// container array is sent so the merge patch cannot drop sidecars.
async fn bump_statefulset_image(
    ctx: &Context,
    sts: &StatefulSet,
    image: &str,
    namespace: &str,
) -> Result<()> {
    let mut containers = sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.clone())
        .unwrap_or_default();
    for container in &mut containers {
        container.image = Some(image.to_string());
    }
    let patch = serde_json::json!({
        "spec": {"template": {"spec": {"containers": containers}}}
    });
    let api: Api<StatefulSet> = Api::namespaced(ctx.op_ctx.client.clone(), namespace);
    info!(msg = "bumping sandbox statefulset image", name = sts.name_any(), image);
    api.patch(
        &sts.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch image on {}", sts.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use vertiop_operator::facts::PodFact;

    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    const OLD: &str = "opentext/vertica-k8s:24.3.0-0";
    const NEW: &str = "opentext/vertica-k8s:24.4.0-0";

    fn pod(name: &str, image: &str, up: Option<bool>) -> PodFact {
        PodFact {
            name: name.to_string(),
            subcluster: "sec1".to_string(),
            sandbox: Some("sb1".to_string()),
            db_sandbox: Some("sb1".to_string()),
            running: true,
            image: Some(image.to_string()),
            installed: Some(true),
            added_to_db: Some(true),
            up,
            ..Default::default()
        }
    }

    fn sets(image: &str) -> Vec<(String, Option<String>)> {
        vec![("mydb-sec1".to_string(), Some(image.to_string()))]
    }

    #[test]
    fn test_next_step_stops_before_image_moves() {
        let pods = vec![pod("mydb-sec1-0", OLD, Some(true))];
        assert_eq!(next_step(&pods, &sets(OLD), NEW), SandboxStep::StopSandbox);
    }

    #[test]
    fn test_next_step_bumps_sets_once_down() {
        let pods = vec![pod("mydb-sec1-0", OLD, Some(false))];
        assert_eq!(
            next_step(&pods, &sets(OLD), NEW),
            SandboxStep::BumpStatefulSets(vec!["mydb-sec1".to_string()])
        );
    }

    #[test]
    fn test_next_step_rolls_stale_pods() {
        // sets already carry the new image, one pod still runs the old one
        let pods = vec![
            pod("mydb-sec1-0", OLD, Some(false)),
            pod("mydb-sec1-1", NEW, Some(false)),
        ];
        assert_eq!(
            next_step(&pods, &sets(NEW), NEW),
            SandboxStep::RollPods(vec!["mydb-sec1-0".to_string()])
        );
    }

    #[test]
    fn test_next_step_starts_after_roll() {
        let pods = vec![
            pod("mydb-sec1-0", NEW, Some(false)),
            pod("mydb-sec1-1", NEW, Some(false)),
        ];
        assert_eq!(next_step(&pods, &sets(NEW), NEW), SandboxStep::StartSandbox);
    }

    #[test]
    fn test_next_step_restarts_individual_down_nodes() {
        let pods = vec![
            pod("mydb-sec1-0", NEW, Some(true)),
            pod("mydb-sec1-1", NEW, Some(false)),
        ];
        assert_eq!(
            next_step(&pods, &sets(NEW), NEW),
            SandboxStep::RestartNodes(vec!["mydb-sec1-1".to_string()])
        );
    }

    #[test]
    fn test_next_step_converged() {
        let pods = vec![
            pod("mydb-sec1-0", NEW, Some(true)),
            pod("mydb-sec1-1", NEW, Some(true)),
        ];
        assert_eq!(next_step(&pods, &sets(NEW), NEW), SandboxStep::Converged);
    }

    #[test]
    fn test_next_step_pod_with_unknown_state_blocks_nothing() {
        // a pending pod keeps None facts; it is not up, so the image bump
        // may proceed
        let mut pending = pod("mydb-sec1-1", OLD, None);
        pending.running = false;
        pending.installed = None;
        pending.added_to_db = None;
        let pods = vec![pod("mydb-sec1-0", OLD, Some(false)), pending];
        assert_eq!(
            next_step(&pods, &sets(OLD), NEW),
            SandboxStep::BumpStatefulSets(vec!["mydb-sec1".to_string()])
        );
    }

    #[test]
    fn test_statefulset_image() {
        let sts = StatefulSet {
            metadata: ObjectMeta {
                name: Some("mydb-sec1".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "server".to_string(),
                            image: Some(OLD.to_string()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        };
        assert_eq!(statefulset_image(&sts).as_deref(), Some(OLD));
        assert_eq!(statefulset_image(&StatefulSet::default()), None);
    }
}
