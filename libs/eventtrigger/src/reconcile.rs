//! Watch conditions on referenced VerticaDBs and create exactly one Job
//! when they reach the configured values.

use crate::crd::{ETRefStatus, EventTrigger, EventTriggerStatus};

use vertiop_operator::controller::context::Context;
use vertiop_operator::controller::DEFAULT_RECONCILE_INTERVAL;
use vertiop_operator::telemetry;
use vertiop_operator::vdb::crd::VerticaDB;

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::{Event, EventType};

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

pub static EVENTTRIGGER_OPERATOR_NAME: &str = "eventtriggers.vertica.com";

const REQUEUE_WAIT: Duration = Duration::from_secs(30);

#[instrument(skip(ctx, et))]
pub async fn reconcile_event_trigger(
    et: Arc<EventTrigger>,
    ctx: Arc<Context<EventTrigger>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure();

    let status = et.status.clone().unwrap_or_default();
    if status.job_name.is_some() {
        // the trigger already fired; it never fires twice
        return Ok(Action::await_change());
    }

    info!(msg = "reconciling EventTrigger");
    // safe unwrap: EventTrigger is namespaced scoped
    let namespace = et.namespace().unwrap();

    let mut references = Vec::new();
    let mut all_matched = !et.spec.references.is_empty();
    for reference in &et.spec.references {
        if reference.object.kind != "VerticaDB" {
            return Err(Error::PreconditionFailed(format!(
                "unsupported reference kind {}",
                reference.object.kind
            )));
        }
        let vdb = ctx.vdb_store.find(|v| {
            v.name_any() == reference.object.name
                && kube::ResourceExt::namespace(v).as_deref() == Some(&namespace)
        });
        let matched = vdb
            .as_deref()
            .map(|v| matches_all(&et, v))
            .unwrap_or(false);
        references.push(ETRefStatus {
            name: reference.object.name.clone(),
            resolved: vdb.is_some(),
            matched,
        });
        all_matched &= matched;
    }

    if !all_matched {
        debug!(msg = "trigger conditions not met yet");
        patch_status(&ctx, &et, references, None, None).await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    }

    // fire: one job, named after the trigger so a crashed create is found
    // again instead of duplicated
    let job_name = format!("{}-job", et.name_any());
    let job = build_job(&et, &job_name)?;
    let job_api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match job_api.create(&PostParams::default(), &job).await {
        Ok(_) => {
            info!(msg = "created triggered job", job = job_name);
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(msg = "triggered job already exists", job = job_name);
        }
        Err(e) => {
            return Err(Error::KubeError(
                format!("failed to create job {job_name}"),
                Box::new(e),
            ));
        }
    }
    let _ignore_errors = ctx
        .recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "TriggerFired".to_string(),
                note: Some(format!("created job {job_name}")),
                action: "CreateJob".to_string(),
                secondary: None,
            },
            &et.object_ref(&()),
        )
        .await;
    patch_status(
        &ctx,
        &et,
        references,
        Some(job_name),
        Some(Time(Timestamp::now())),
    )
    .await?;
    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

/// Every configured match must hold on the object's conditions.
fn matches_all(et: &EventTrigger, vdb: &VerticaDB) -> bool {
    let conditions = vdb
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .cloned()
        .unwrap_or_default();
    et.spec.matches.iter().all(|m| {
        conditions
            .iter()
            .any(|c| c.type_ == m.condition.type_ && c.status == m.condition.status)
    })
}

/// Placeholders the job template may carry, resolved against the
/// triggering reference before the Job is created.
fn substitution_values(et: &EventTrigger) -> Vec<(&'static str, String)> {
    let mut values = vec![
        ("$(TRIGGER_NAME)", et.name_any()),
        ("$(NAMESPACE)", et.namespace().unwrap_or_default()),
    ];
    if let Some(reference) = et.spec.references.first() {
        values.push(("$(VERTICADB_NAME)", reference.object.name.clone()));
    }
    if let Some(matched) = et.spec.matches.first() {
        values.push(("$(CONDITION_TYPE)", matched.condition.type_.clone()));
        values.push(("$(CONDITION_STATUS)", matched.condition.status.clone()));
    }
    values
}

/// Replace every placeholder occurrence in every string of the template.
fn substitute(value: &mut serde_json::Value, values: &[(&'static str, String)]) {
    match value {
        serde_json::Value::String(s) => {
            for (placeholder, replacement) in values {
                if s.contains(placeholder) {
                    *s = s.replace(placeholder, replacement);
                }
            }
        }
        serde_json::Value::Array(items) => {
            items.iter_mut().for_each(|item| substitute(item, values));
        }
        serde_json::Value::Object(map) => {
            map.values_mut().for_each(|item| substitute(item, values));
        }
        _ => {}
    }
}

fn build_job(et: &EventTrigger, job_name: &str) -> Result<Job> {
    let mut template = serde_json::to_value(&et.spec.template)
        .map_err(|e| Error::SerializationError("failed to serialize job template".to_string(), e))?;
    substitute(&mut template, &substitution_values(et));
    let template: crate::crd::ETJobTemplate = serde_json::from_value(template)
        .map_err(|e| Error::SerializationError("failed to rebuild job template".to_string(), e))?;

    let metadata = template.metadata.unwrap_or_default();
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: et.namespace(),
            labels: metadata.labels,
            annotations: metadata.annotations,
            owner_references: et.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(template.spec),
        ..Job::default()
    })
}

async fn patch_status(
    ctx: &Context<EventTrigger>,
    et: &EventTrigger,
    references: Vec<ETRefStatus>,
    job_name: Option<String>,
    job_created_at: Option<Time>,
) -> Result<()> {
    let previous = et.status.clone().unwrap_or_default();
    let new_status = EventTriggerStatus {
        job_name: job_name.or(previous.job_name),
        job_created_at: job_created_at.or(previous.job_created_at),
        references,
    };
    // safe unwrap: EventTrigger is namespaced scoped
    let api: Api<EventTrigger> = Api::namespaced(ctx.client.clone(), &et.namespace().unwrap());
    api.patch_status(
        &et.name_any(),
        &PatchParams::apply(EVENTTRIGGER_OPERATOR_NAME).force(),
        &Patch::Apply(json!({
            "apiVersion": "vertica.com/v1beta1",
            "kind": "EventTrigger",
            "status": new_status,
        })),
    )
    .await
    .map_err(|e| {
        ctx.metrics.status_update_errors_inc();
        Error::KubeError(
            format!("failed to patch EventTrigger/status {}", et.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{ETMatch, ETMatchCondition, ETReference, ETReferenceObject, EventTriggerSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

    fn trigger(condition_type: &str, status: &str) -> EventTrigger {
        let mut et = EventTrigger::new(
            "on-init",
            EventTriggerSpec {
                references: vec![ETReference {
                    object: ETReferenceObject {
                        api_version: "vertica.com/v1".to_string(),
                        kind: "VerticaDB".to_string(),
                        name: "mydb".to_string(),
                    },
                }],
                matches: vec![ETMatch {
                    condition: ETMatchCondition {
                        type_: condition_type.to_string(),
                        status: status.to_string(),
                    },
                }],
                template: Default::default(),
            },
        );
        et.metadata.namespace = Some("default".to_string());
        et
    }

    fn vdb_with_condition(condition_type: &str, status: &str) -> VerticaDB {
        let mut vdb = VerticaDB::default();
        vdb.status = Some(vertiop_operator::vdb::crd::VerticaDBStatus {
            conditions: Some(vec![Condition {
                type_: condition_type.to_string(),
                status: status.to_string(),
                reason: "".to_string(),
                message: "".to_string(),
                last_transition_time: Time(Timestamp::now()),
                observed_generation: None,
            }]),
            ..Default::default()
        });
        vdb
    }

    #[test]
    fn test_matches_all_on_transition() {
        let et = trigger("DBInitialized", "True");
        assert!(matches_all(&et, &vdb_with_condition("DBInitialized", "True")));
        assert!(!matches_all(&et, &vdb_with_condition("DBInitialized", "False")));
        assert!(!matches_all(&et, &vdb_with_condition("Ready", "True")));
        assert!(!matches_all(&et, &VerticaDB::default()));
    }

    #[test]
    fn test_build_job_owner_and_name() {
        let mut et = trigger("DBInitialized", "True");
        et.metadata.uid = Some("uid-9".to_string());
        let job = build_job(&et, "on-init-job").unwrap();
        assert_eq!(job.name_any(), "on-init-job");
        let orefs = job.metadata.owner_references.unwrap();
        assert_eq!(orefs[0].kind, "EventTrigger");
        assert_eq!(orefs[0].name, "on-init");
    }

    #[test]
    fn test_build_job_substitutes_parameters() {
        use k8s_openapi::api::batch::v1::JobSpec;
        use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};

        let mut et = trigger("DBInitialized", "True");
        et.spec.template.spec = JobSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "notify".to_string(),
                        image: Some("curlimages/curl:latest".to_string()),
                        args: Some(vec![
                            "--data".to_string(),
                            "db=$(VERTICADB_NAME) condition=$(CONDITION_TYPE)".to_string(),
                        ]),
                        env: Some(vec![EnvVar {
                            name: "TRIGGER".to_string(),
                            value: Some("$(TRIGGER_NAME)/$(NAMESPACE)".to_string()),
                            ..EnvVar::default()
                        }]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..JobSpec::default()
        };

        let job = build_job(&et, "on-init-job").unwrap();
        let pod_spec = job.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap()[1],
            "db=mydb condition=DBInitialized"
        );
        assert_eq!(
            container.env.as_ref().unwrap()[0].value.as_deref(),
            Some("on-init/default")
        );
        // strings without placeholders are untouched
        assert_eq!(container.image.as_deref(), Some("curlimages/curl:latest"));
    }

    #[test]
    fn test_substitution_values() {
        let et = trigger("Ready", "False");
        let values = substitution_values(&et);
        assert!(values.contains(&("$(VERTICADB_NAME)", "mydb".to_string())));
        assert!(values.contains(&("$(CONDITION_TYPE)", "Ready".to_string())));
        assert!(values.contains(&("$(CONDITION_STATUS)", "False".to_string())));
        assert!(values.contains(&("$(NAMESPACE)", "default".to_string())));
    }
}
