//! One-shot replication driven through conditions:
//! `ReplicationReady` once both databases are initialized, `Replicating`
//! while the admin action runs, then `Succeeded` or `Failed`. The action is
//! long-running and intent-gated so an operator restart re-runs it instead
//! of losing it.

use crate::crd::{VerticaReplicator, VerticaReplicatorStatus};

use vertiop_operator::controller::context::Context;
use vertiop_operator::facts::PodFacts;
use vertiop_operator::telemetry;
use vertiop_operator::vadmin::{Dispatcher, ReplicateDbArgs};
use vertiop_operator::vdb::crd::VerticaDB;
use vertiop_operator::vdb::reconcile::status::{
    conditions_contain_true, make_condition, update_conditions, CONDITION_FALSE, CONDITION_TRUE,
};

use vertiop_k8s_util::error::{Error, Result, Severity};
use vertiop_k8s_util::events::{Event, EventType};

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

pub static REPLICATOR_OPERATOR_NAME: &str = "verticareplicators.vertica.com";

pub const TYPE_REPLICATION_READY: &str = "ReplicationReady";
pub const TYPE_REPLICATING: &str = "Replicating";
pub const TYPE_SUCCEEDED: &str = "Succeeded";
pub const TYPE_FAILED: &str = "Failed";

const INTENT_ANNOTATION: &str = "vertica.com/admin-intent";
const REQUEUE_WAIT: Duration = Duration::from_secs(30);
const REPLICATE_TIMEOUT: Duration = Duration::from_secs(3600);

#[instrument(skip(ctx, vrep))]
pub async fn reconcile_replicator(
    vrep: Arc<VerticaReplicator>,
    ctx: Arc<Context<VerticaReplicator>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure();

    let status = vrep.status.clone().unwrap_or_default();
    if is_finished(&status) {
        // a replicator is a one-shot request
        return Ok(Action::await_change());
    }

    info!(msg = "reconciling VerticaReplicator");

    // both ends must exist and be initialized before anything moves
    let source = ctx.get_vdb(&vrep);
    // safe unwrap: VerticaReplicator is namespaced scoped
    let namespace = vrep.namespace().unwrap();
    let target = ctx.vdb_store.find(|v| {
        v.name_any() == vrep.spec.target.vertica_db_name
            && kube::ResourceExt::namespace(v).as_deref() == Some(&namespace)
    });
    let (source, target) = match (source, target) {
        (Some(s), Some(t))
            if vertiop_operator::vdb::reconcile::status::is_db_initialized(&s)
                && vertiop_operator::vdb::reconcile::status::is_db_initialized(&t) =>
        {
            (s, t)
        }
        _ => {
            debug!(msg = "source or target not ready for replication");
            patch_conditions(
                &ctx,
                &vrep,
                vec![make_condition(
                    TYPE_REPLICATION_READY,
                    CONDITION_FALSE,
                    "DatabasesNotReady",
                    "Source and target must exist and be initialized.",
                    vrep.metadata.generation,
                )],
                Some("waiting for databases".to_string()),
            )
            .await?;
            return Ok(Action::requeue(REQUEUE_WAIT));
        }
    };

    // resolve pods through facts so the action runs against live nodes
    let runner = vertiop_k8s_util::exec::PodRunner::new(ctx.client.clone());
    let source_facts = PodFacts::collect(&runner, &ctx.pod_store, &source).await?;
    let target_facts = PodFacts::collect(&runner, &ctx.pod_store, &target).await?;

    let initiator = match &vrep.spec.source.sandbox_name {
        Some(sandbox) => source_facts
            .sandbox_initiator(sandbox)
            .filter(|p| p.up == Some(true)),
        None => source_facts.initiator().filter(|p| p.up == Some(true)),
    };
    let target_pod = target_facts.initiator().filter(|p| p.up == Some(true));
    let (Some(initiator), Some(target_pod)) = (initiator, target_pod) else {
        patch_conditions(
            &ctx,
            &vrep,
            vec![make_condition(
                TYPE_REPLICATION_READY,
                CONDITION_FALSE,
                "NoUpNodes",
                "No up node available on the source or target.",
                vrep.metadata.generation,
            )],
            Some("waiting for up nodes".to_string()),
        )
        .await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    patch_conditions(
        &ctx,
        &vrep,
        vec![
            make_condition(
                TYPE_REPLICATION_READY,
                CONDITION_TRUE,
                "DatabasesReady",
                "Source and target can replicate.",
                vrep.metadata.generation,
            ),
            make_condition(
                TYPE_REPLICATING,
                CONDITION_TRUE,
                "ReplicationStarted",
                "Replication is running.",
                vrep.metadata.generation,
            ),
        ],
        Some("replicating".to_string()),
    )
    .await?;

    let api: Api<VerticaReplicator> = Api::namespaced(ctx.client.clone(), &namespace);
    if vrep.annotations().get(INTENT_ANNOTATION).is_some() {
        debug!(msg = "found replicate intent from an interrupted run, re-running");
    }
    write_intent(&api, &vrep).await?;

    let dispatcher = Dispatcher::from_vdb(ctx.client.clone(), ctx.metrics.clone(), &source, None)?;
    let source_pod = initiator.pod_ref(&source);
    let target_ref = target_pod.pod_ref(&target);
    let result = dispatcher
        .replicate_db(
            &source_pod,
            ReplicateDbArgs {
                db_name: &source.spec.db_name,
                target_host: &target_ref.dns_name,
                sandbox: vrep.spec.source.sandbox_name.as_deref().unwrap_or(""),
                timeout: REPLICATE_TIMEOUT,
            },
        )
        .await;

    match result {
        Ok(()) => {
            clear_intent(&api, &vrep).await?;
            info!(msg = "replication succeeded");
            patch_conditions(
                &ctx,
                &vrep,
                outcome_conditions(true, "", vrep.metadata.generation),
                Some("succeeded".to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(e) if verdict_for_error(&e) == Verdict::Failed => {
            clear_intent(&api, &vrep).await?;
            warn!(msg = "replication failed", %e);
            let _ignore_errors = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "ReplicationFailed".to_string(),
                        note: Some(e.to_string()),
                        action: "Replicate".to_string(),
                        secondary: None,
                    },
                    &vrep.object_ref(&()),
                )
                .await;
            patch_conditions(
                &ctx,
                &vrep,
                outcome_conditions(false, &e.to_string(), vrep.metadata.generation),
                Some("failed".to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        // transient failures keep the intent so the next pass resumes
        Err(e) => Err(e),
    }
}

/// A finished replicator never runs again.
fn is_finished(status: &VerticaReplicatorStatus) -> bool {
    conditions_contain_true(&status.conditions, TYPE_SUCCEEDED)
        || conditions_contain_true(&status.conditions, TYPE_FAILED)
}

/// How a replicate_db error resolves the CR: a fatal refusal parks it in
/// Failed, anything else propagates so the backoff retries with the
/// intent token in place.
#[derive(Debug, PartialEq)]
enum Verdict {
    Failed,
    Retry,
}

fn verdict_for_error(e: &Error) -> Verdict {
    if e.severity() == Severity::Fatal {
        Verdict::Failed
    } else {
        Verdict::Retry
    }
}

/// Terminal conditions of one replication run.
fn outcome_conditions(
    succeeded: bool,
    failure_message: &str,
    generation: Option<i64>,
) -> Vec<Condition> {
    let done = make_condition(
        TYPE_REPLICATING,
        CONDITION_FALSE,
        "ReplicationDone",
        "Replication finished.",
        generation,
    );
    let outcome = if succeeded {
        make_condition(
            TYPE_SUCCEEDED,
            CONDITION_TRUE,
            "ReplicationSucceeded",
            "Committed data was replicated to the target.",
            generation,
        )
    } else {
        make_condition(
            TYPE_FAILED,
            CONDITION_TRUE,
            "ReplicationFailed",
            failure_message,
            generation,
        )
    };
    vec![done, outcome]
}

async fn write_intent(api: &Api<VerticaReplicator>, vrep: &VerticaReplicator) -> Result<()> {
    let intent = json!({
        "action": "replicate_db",
        "token": uuid::Uuid::new_v4().to_string(),
        "started_at": k8s_openapi::jiff::Timestamp::now().to_string(),
    });
    let patch = json!({
        "metadata": {"annotations": {INTENT_ANNOTATION: intent.to_string()}}
    });
    api.patch(
        &vrep.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| Error::KubeError("failed to record replicate intent".to_string(), Box::new(e)))?;
    Ok(())
}

async fn clear_intent(api: &Api<VerticaReplicator>, vrep: &VerticaReplicator) -> Result<()> {
    let patch = json!({
        "metadata": {"annotations": {INTENT_ANNOTATION: null}}
    });
    api.patch(
        &vrep.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| Error::KubeError("failed to clear replicate intent".to_string(), Box::new(e)))?;
    Ok(())
}

async fn patch_conditions(
    ctx: &Context<VerticaReplicator>,
    vrep: &VerticaReplicator,
    new_conditions: Vec<Condition>,
    state: Option<String>,
) -> Result<()> {
    let previous = vrep.status.clone().unwrap_or_default();
    let conditions = new_conditions
        .iter()
        .fold(previous.conditions.unwrap_or_default(), |acc, c| {
            update_conditions(acc, c)
        });
    let new_status = VerticaReplicatorStatus {
        conditions: Some(conditions),
        state,
    };
    // safe unwrap: VerticaReplicator is namespaced scoped
    let api: Api<VerticaReplicator> =
        Api::namespaced(ctx.client.clone(), &vrep.namespace().unwrap());
    api.patch_status(
        &vrep.name_any(),
        &PatchParams::apply(REPLICATOR_OPERATOR_NAME).force(),
        &Patch::Apply(json!({
            "apiVersion": "vertica.com/v1beta1",
            "kind": "VerticaReplicator",
            "status": new_status,
        })),
    )
    .await
    .map_err(|e| {
        ctx.metrics.status_update_errors_inc();
        Error::KubeError(
            format!("failed to patch VerticaReplicator/status {}", vrep.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{ReplicationSource, ReplicationTarget, VerticaReplicatorSpec};

    use vertiop_operator::metrics::ControllerMetrics;
    use vertiop_operator::vdb::crd::VerticaDB;
    use vertiop_operator::vdb::reconcile::status::TYPE_DB_INITIALIZED;

    use vertiop_k8s_util::events::Recorder;

    use http::{Request, Response};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use kube::{client::Body, Client};
    use serde_json::Value;

    #[test]
    fn test_is_finished_terminal_conditions() {
        let mut status = VerticaReplicatorStatus::default();
        assert!(!is_finished(&status));

        status.conditions = Some(vec![make_condition(
            TYPE_SUCCEEDED,
            CONDITION_TRUE,
            "ReplicationSucceeded",
            "",
            None,
        )]);
        assert!(is_finished(&status));

        status.conditions = Some(vec![make_condition(
            TYPE_FAILED,
            CONDITION_TRUE,
            "ReplicationFailed",
            "",
            None,
        )]);
        assert!(is_finished(&status));

        // a run that is merely in flight is not terminal
        status.conditions = Some(vec![make_condition(
            TYPE_REPLICATING,
            CONDITION_TRUE,
            "ReplicationStarted",
            "",
            None,
        )]);
        assert!(!is_finished(&status));
    }

    #[test]
    fn test_verdict_fatal_vs_transient() {
        assert_eq!(
            verdict_for_error(&Error::AdminFatal(
                "replicate_db".to_string(),
                "refused".to_string()
            )),
            Verdict::Failed
        );
        assert_eq!(
            verdict_for_error(&Error::PreconditionFailed("bad target".to_string())),
            Verdict::Failed
        );
        // transient classes propagate so the intent token survives for the
        // next pass
        assert_eq!(
            verdict_for_error(&Error::ExecTransient("reset".to_string())),
            Verdict::Retry
        );
        assert_eq!(
            verdict_for_error(&Error::AdminRetryable(
                "replicate_db".to_string(),
                "spread".to_string()
            )),
            Verdict::Retry
        );
        assert_eq!(
            verdict_for_error(&Error::PodNotReady("pending".to_string())),
            Verdict::Retry
        );
    }

    #[test]
    fn test_outcome_conditions() {
        let succeeded = outcome_conditions(true, "", None);
        assert_eq!(succeeded.len(), 2);
        assert!(succeeded
            .iter()
            .any(|c| c.type_ == TYPE_REPLICATING && c.status == CONDITION_FALSE));
        assert!(succeeded
            .iter()
            .any(|c| c.type_ == TYPE_SUCCEEDED && c.status == CONDITION_TRUE));

        let failed = outcome_conditions(false, "refused by the database", None);
        let failure = failed.iter().find(|c| c.type_ == TYPE_FAILED).unwrap();
        assert_eq!(failure.status, CONDITION_TRUE);
        assert_eq!(failure.message, "refused by the database");
        assert!(!failed.iter().any(|c| c.type_ == TYPE_SUCCEEDED));
    }

    impl VerticaReplicator {
        fn test() -> Self {
            let mut vrep = VerticaReplicator::new(
                "rep1",
                VerticaReplicatorSpec {
                    source: ReplicationSource {
                        vertica_db_name: "srcdb".to_string(),
                        sandbox_name: None,
                    },
                    target: ReplicationTarget {
                        vertica_db_name: "tgtdb".to_string(),
                    },
                    ..Default::default()
                },
            );
            vrep.metadata.namespace = Some("default".into());
            vrep
        }
    }

    fn initialized_vdb(name: &str) -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.metadata.name = Some(name.to_string());
        vdb.metadata.namespace = Some("default".to_string());
        vdb.spec.db_name = "vertdb".to_string();
        vdb.status = Some(vertiop_operator::vdb::crd::VerticaDBStatus {
            conditions: Some(vec![make_condition(
                TYPE_DB_INITIALIZED,
                CONDITION_TRUE,
                "DBCreated",
                "",
                None,
            )]),
            ..Default::default()
        });
        vdb
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn get_test_context(
        vdbs: Vec<VerticaDB>,
    ) -> (Arc<Context<VerticaReplicator>>, ApiServerHandle) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let mut vdb_writer = Writer::<VerticaDB>::default();
        for vdb in vdbs {
            vdb_writer.apply_watcher_event(&watcher::Event::Apply(vdb));
        }
        let ctx = Context::new(
            "replicator",
            mock_client.clone(),
            Arc::new(ControllerMetrics::default()),
            Recorder::new(mock_client, "verticareplicators.vertica.com".into()),
            vdb_writer.as_reader(),
            Writer::default().as_reader(),
            std::time::Duration::from_secs(300),
        );
        (Arc::new(ctx), handle)
    }

    /// One status patch is expected; asserts the given condition type has
    /// the given value and answers like the apiserver.
    async fn handle_status_patch(
        mut handle: ApiServerHandle,
        vrep: VerticaReplicator,
        condition_type: &str,
        condition_status: &str,
    ) {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            "/apis/vertica.com/v1beta1/namespaces/default/verticareplicators/rep1/status?&force=true&fieldManager=verticareplicators.vertica.com"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: Value = serde_json::from_slice(&req_body).expect("patch object is json");
        let conditions = json["status"]["conditions"].as_array().unwrap();
        assert!(conditions
            .iter()
            .any(|c| c["type"] == condition_type && c["status"] == condition_status));
        let response = serde_json::to_vec(&vrep).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
    }

    #[tokio::test]
    async fn replicator_waits_for_missing_databases() {
        let (testctx, handle) = get_test_context(vec![]);
        let vrep = VerticaReplicator::test();
        let mocksrv = tokio::spawn(handle_status_patch(
            handle,
            vrep.clone(),
            TYPE_REPLICATION_READY,
            CONDITION_FALSE,
        ));
        let action = reconcile_replicator(Arc::new(vrep), testctx)
            .await
            .expect("reconciler");
        assert_eq!(action, Action::requeue(REQUEUE_WAIT));
        tokio::time::timeout(std::time::Duration::from_secs(1), mocksrv)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded");
    }

    #[tokio::test]
    async fn replicator_waits_for_up_nodes() {
        // both databases are initialized, but neither has a pod yet
        let (testctx, handle) = get_test_context(vec![
            initialized_vdb("srcdb"),
            initialized_vdb("tgtdb"),
        ]);
        let vrep = VerticaReplicator::test();
        let mocksrv = tokio::spawn(handle_status_patch(
            handle,
            vrep.clone(),
            TYPE_REPLICATION_READY,
            CONDITION_FALSE,
        ));
        let action = reconcile_replicator(Arc::new(vrep), testctx)
            .await
            .expect("reconciler");
        assert_eq!(action, Action::requeue(REQUEUE_WAIT));
        tokio::time::timeout(std::time::Duration::from_secs(1), mocksrv)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded");
    }
}
