//! Schedule the diagnostic pod and reflect its phase into conditions.

use crate::crd::{VerticaScrutinize, VerticaScrutinizeStatus};
use crate::pod::{build_scrutinize_pod, pod_name, TARBALL_PATH};

use vertiop_operator::controller::context::Context;
use vertiop_operator::telemetry;
use vertiop_operator::vdb::reconcile::status::{
    conditions_contain_true, make_condition, update_conditions, CONDITION_FALSE, CONDITION_TRUE,
};

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::{Event, EventType};

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

pub static SCRUTINIZE_OPERATOR_NAME: &str = "verticascrutinizers.vertica.com";

pub const TYPE_POD_CREATED: &str = "PodCreated";
pub const TYPE_COLLECTION_FINISHED: &str = "CollectionFinished";

const REQUEUE_WAIT: Duration = Duration::from_secs(30);

#[instrument(skip(ctx, vscr))]
pub async fn reconcile_scrutinize(
    vscr: Arc<VerticaScrutinize>,
    ctx: Arc<Context<VerticaScrutinize>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure();

    let status = vscr.status.clone().unwrap_or_default();
    if conditions_contain_true(&status.conditions, TYPE_COLLECTION_FINISHED) {
        return Ok(Action::await_change());
    }

    info!(msg = "reconciling VerticaScrutinize");
    // safe unwrap: VerticaScrutinize is namespaced scoped
    let namespace = vscr.namespace().unwrap();
    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    if !conditions_contain_true(&status.conditions, TYPE_POD_CREATED) {
        let Some(vdb) = ctx.get_vdb(&vscr) else {
            debug!(msg = "target VerticaDB not found", name = vscr.spec.vertica_db_name);
            return Ok(Action::requeue(REQUEUE_WAIT));
        };
        let pod = build_scrutinize_pod(&vscr, &vdb);
        match pod_api.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(msg = "scrutinize pod already exists");
            }
            Err(e) => {
                return Err(Error::KubeError(
                    "failed to create scrutinize pod".to_string(),
                    Box::new(e),
                ));
            }
        }
        info!(msg = "created scrutinize pod", pod = pod_name(&vscr));
        patch_status(
            &ctx,
            &vscr,
            vec![make_condition(
                TYPE_POD_CREATED,
                CONDITION_TRUE,
                "PodScheduled",
                "The diagnostic pod has been created.",
                vscr.metadata.generation,
            )],
            Some(pod_name(&vscr)),
            None,
        )
        .await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    }

    // follow the pod phase until the collection resolves
    let phase = pod_api
        .get_opt(&pod_name(&vscr))
        .await
        .map_err(|e| Error::KubeError("failed to get scrutinize pod".to_string(), Box::new(e)))?
        .and_then(|p| p.status.and_then(|s| s.phase));

    match phase.as_deref() {
        Some("Succeeded") => {
            info!(msg = "scrutinize collection finished");
            patch_status(
                &ctx,
                &vscr,
                vec![make_condition(
                    TYPE_COLLECTION_FINISHED,
                    CONDITION_TRUE,
                    "CollectionSucceeded",
                    "The diagnostic collection finished.",
                    vscr.metadata.generation,
                )],
                Some(pod_name(&vscr)),
                Some(TARBALL_PATH.to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        Some("Failed") => {
            let _ignore_errors = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "CollectionFailed".to_string(),
                        note: Some("the scrutinize pod failed".to_string()),
                        action: "Scrutinize".to_string(),
                        secondary: None,
                    },
                    &vscr.object_ref(&()),
                )
                .await;
            patch_status(
                &ctx,
                &vscr,
                vec![make_condition(
                    TYPE_COLLECTION_FINISHED,
                    CONDITION_FALSE,
                    "CollectionFailed",
                    "The diagnostic pod failed.",
                    vscr.metadata.generation,
                )],
                Some(pod_name(&vscr)),
                None,
            )
            .await?;
            Ok(Action::await_change())
        }
        other => {
            debug!(msg = "scrutinize pod still running", phase = other.unwrap_or("unknown"));
            Ok(Action::requeue(REQUEUE_WAIT))
        }
    }
}

async fn patch_status(
    ctx: &Context<VerticaScrutinize>,
    vscr: &VerticaScrutinize,
    new_conditions: Vec<Condition>,
    pod_name: Option<String>,
    tarball_path: Option<String>,
) -> Result<()> {
    let previous = vscr.status.clone().unwrap_or_default();
    let conditions = new_conditions
        .iter()
        .fold(previous.conditions.unwrap_or_default(), |acc, c| {
            update_conditions(acc, c)
        });
    let new_status = VerticaScrutinizeStatus {
        conditions: Some(conditions),
        pod_name: pod_name.or(previous.pod_name),
        tarball_path: tarball_path.or(previous.tarball_path),
    };
    // safe unwrap: VerticaScrutinize is namespaced scoped
    let api: Api<VerticaScrutinize> =
        Api::namespaced(ctx.client.clone(), &vscr.namespace().unwrap());
    api.patch_status(
        &vscr.name_any(),
        &PatchParams::apply(SCRUTINIZE_OPERATOR_NAME).force(),
        &Patch::Apply(json!({
            "apiVersion": "vertica.com/v1beta1",
            "kind": "VerticaScrutinize",
            "status": new_status,
        })),
    )
    .await
    .map_err(|e| {
        ctx.metrics.status_update_errors_inc();
        Error::KubeError(
            format!("failed to patch VerticaScrutinize/status {}", vscr.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}
