use crate::crd::{VerticaAutoscaler, VerticaAutoscalerStatus};
use crate::provider;

use vertiop_operator::controller::context::Context;
use vertiop_operator::controller::DEFAULT_RECONCILE_INTERVAL;
use vertiop_operator::telemetry;
use vertiop_operator::vdb::crd::VerticaDB;
use vertiop_operator::vdb::reconcile::status::{
    make_condition, update_conditions, CONDITION_FALSE, CONDITION_TRUE,
};

use vertiop_k8s_util::error::{Error, Result};

use std::sync::Arc;

use json_patch::{PatchOperation, ReplaceOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

pub static AUTOSCALER_OPERATOR_NAME: &str = "verticaautoscalers.vertica.com";

/// The autoscaler's condition: the target size has been applied to the
/// VerticaDB.
const TYPE_TARGET_SIZE_APPLIED: &str = "TargetSizeApplied";

const REQUEUE_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

#[instrument(skip(ctx, vas))]
pub async fn reconcile_autoscaler(
    vas: Arc<VerticaAutoscaler>,
    ctx: Arc<Context<VerticaAutoscaler>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling VerticaAutoscaler");

    let Some(vdb) = ctx.get_vdb(&vas) else {
        debug!(msg = "target VerticaDB not found", name = vas.spec.vertica_db_name);
        update_status(&ctx, &vas, 0, 0, false, "TargetNotFound").await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    let Some((index, subcluster)) = vdb
        .spec
        .subclusters
        .iter()
        .enumerate()
        .find(|(_, sc)| sc.name == vas.spec.subcluster)
    else {
        update_status(&ctx, &vas, 0, 0, false, "SubclusterNotFound").await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    let value = provider::current_value(&vas.spec.metric).await?;
    let desired = provider::compute_desired_size(
        value,
        vas.spec.metric.target_average_value,
        vas.spec.min_replicas,
        vas.spec.max_replicas,
    );
    let current = subcluster.size;

    if desired != current {
        info!(
            msg = "scaling subcluster",
            subcluster = vas.spec.subcluster,
            current,
            desired
        );
        patch_subcluster_size(&ctx, &vas, &vdb, index, desired).await?;
    }
    update_status(&ctx, &vas, current, desired, true, "SizeApplied").await?;

    Ok(Action::requeue(scrape_interval(&vdb)))
}

/// The autoscaler owns exactly one VerticaDB field: the target
/// subcluster's size. A JSON patch replaces it in place without touching
/// the rest of the array.
async fn patch_subcluster_size(
    ctx: &Context<VerticaAutoscaler>,
    vas: &VerticaAutoscaler,
    vdb: &VerticaDB,
    index: usize,
    size: i32,
) -> Result<()> {
    // safe unwrap: VerticaAutoscaler is namespaced scoped
    let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &vas.namespace().unwrap());
    let patch = json_patch::Patch(vec![PatchOperation::Replace(ReplaceOperation {
        path: format!("/spec/subclusters/{index}/size")
            .parse()
            .map_err(|e| Error::ParseError(format!("invalid patch pointer: {e}")))?,
        value: json!(size),
    })]);
    api.patch(
        &vdb.name_any(),
        &PatchParams::apply(AUTOSCALER_OPERATOR_NAME),
        &Patch::Json::<()>(patch),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch subcluster size on {}", vdb.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}

async fn update_status(
    ctx: &Context<VerticaAutoscaler>,
    vas: &VerticaAutoscaler,
    current: i32,
    desired: i32,
    applied: bool,
    reason: &str,
) -> Result<()> {
    let previous = vas.status.clone().unwrap_or_default();
    let condition = make_condition(
        TYPE_TARGET_SIZE_APPLIED,
        if applied { CONDITION_TRUE } else { CONDITION_FALSE },
        reason,
        "Autoscaler observation.",
        vas.metadata.generation,
    );
    let scaled = desired != current && applied;
    let new_status = VerticaAutoscalerStatus {
        conditions: Some(update_conditions(
            previous.conditions.unwrap_or_default(),
            &condition,
        )),
        current_size: current,
        desired_size: desired,
        last_scale_time: if scaled {
            Some(Time(Timestamp::now()))
        } else {
            previous.last_scale_time
        },
    };

    // safe unwrap: VerticaAutoscaler is namespaced scoped
    let api: Api<VerticaAutoscaler> =
        Api::namespaced(ctx.client.clone(), &vas.namespace().unwrap());
    let patch = Patch::Apply(json!({
        "apiVersion": "vertica.com/v1beta1",
        "kind": "VerticaAutoscaler",
        "status": new_status,
    }));
    api.patch_status(
        &vas.name_any(),
        &PatchParams::apply(AUTOSCALER_OPERATOR_NAME).force(),
        &patch,
    )
    .await
    .map_err(|e| {
        ctx.metrics.status_update_errors_inc();
        Error::KubeError(
            format!("failed to patch VerticaAutoscaler/status {}", vas.name_any()),
            Box::new(e),
        )
    })?;
    Ok(())
}

fn scrape_interval(vdb: &VerticaDB) -> Duration {
    vdb.annotations()
        .get(vertiop_operator::vdb::annotations::PROMETHEUS_SCRAPE_INTERVAL_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SCRAPE_INTERVAL)
        .min(DEFAULT_RECONCILE_INTERVAL)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{MetricProviderKind, VerticaAutoscalerSpec};

    #[test]
    fn test_scrape_interval_annotation() {
        let mut vdb = VerticaDB::default();
        assert_eq!(scrape_interval(&vdb), DEFAULT_SCRAPE_INTERVAL);
        vdb.metadata.annotations = Some(
            [(
                "vertica.com/prometheus-scrape-interval".to_string(),
                "15".to_string(),
            )]
            .into(),
        );
        assert_eq!(scrape_interval(&vdb), Duration::from_secs(15));
    }

    #[test]
    fn test_spec_defaults() {
        let spec: VerticaAutoscalerSpec = serde_json::from_value(json!({
            "verticaDBName": "mydb",
            "subcluster": "main",
            "maxReplicas": 8,
            "metric": {"provider": "static", "staticValue": 100.0, "targetAverageValue": 25.0},
        }))
        .unwrap();
        assert_eq!(spec.min_replicas, 1);
        assert_eq!(spec.metric.provider, MetricProviderKind::Static);
        assert_eq!(spec.metric.static_value, Some(100.0));
    }
}
