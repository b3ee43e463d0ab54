//! Read-only listing of restore points into the CR status.

use crate::crd::{
    RestorePointInfo, RestorePointsFilter, VerticaRestorePointsQuery,
    VerticaRestorePointsQueryStatus,
};

use vertiop_operator::controller::context::Context;
use vertiop_operator::controller::DEFAULT_RECONCILE_INTERVAL;
use vertiop_operator::facts::PodFacts;
use vertiop_operator::telemetry;
use vertiop_operator::vadmin::{Dispatcher, RestorePoint};
use vertiop_operator::vdb::reconcile::status::{
    make_condition, update_conditions, CONDITION_FALSE, CONDITION_TRUE,
};

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::exec::PodRunner;

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

pub static RESTOREPOINTS_OPERATOR_NAME: &str = "verticarestorepointsqueries.vertica.com";

pub const TYPE_QUERYING: &str = "Querying";
pub const TYPE_QUERY_COMPLETE: &str = "QueryComplete";

const REQUEUE_WAIT: Duration = Duration::from_secs(30);

#[instrument(skip(ctx, vrpq))]
pub async fn reconcile_restore_points_query(
    vrpq: Arc<VerticaRestorePointsQuery>,
    ctx: Arc<Context<VerticaRestorePointsQuery>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling VerticaRestorePointsQuery");

    let Some(vdb) = ctx.get_vdb(&vrpq) else {
        debug!(msg = "target VerticaDB not found", name = vrpq.spec.vertica_db_name);
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    let runner = PodRunner::new(ctx.client.clone());
    let facts = PodFacts::collect(&runner, &ctx.pod_store, &vdb).await?;
    let Some(initiator) = facts.initiator().filter(|p| p.up == Some(true)) else {
        patch_status(
            &ctx,
            &vrpq,
            vec![],
            false,
            "NoUpNodes",
        )
        .await?;
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    patch_status(&ctx, &vrpq, vec![], true, "Querying").await?;

    let dispatcher = Dispatcher::from_vdb(ctx.client.clone(), ctx.metrics.clone(), &vdb, None)?;
    let points = dispatcher
        .show_restore_points(&initiator.pod_ref(&vdb))
        .await?;
    let filtered = apply_filter(points, vrpq.spec.filter.as_ref());
    info!(msg = format!("query returned {} restore points", filtered.len()));

    patch_status(&ctx, &vrpq, filtered, false, "QueryFinished").await?;
    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

fn apply_filter(
    points: Vec<RestorePoint>,
    filter: Option<&RestorePointsFilter>,
) -> Vec<RestorePointInfo> {
    points
        .into_iter()
        .filter(|p| {
            filter
                .map(|f| {
                    f.archive.as_ref().map(|a| *a == p.archive).unwrap_or(true)
                        && f.start_timestamp
                            .as_ref()
                            .map(|start| p.timestamp.as_str() >= start.as_str())
                            .unwrap_or(true)
                        && f.end_timestamp
                            .as_ref()
                            .map(|end| p.timestamp.as_str() <= end.as_str())
                            .unwrap_or(true)
                })
                .unwrap_or(true)
        })
        .map(|p| RestorePointInfo {
            archive: p.archive,
            id: p.id,
            index: p.index,
            timestamp: p.timestamp,
        })
        .collect()
}

async fn patch_status(
    ctx: &Context<VerticaRestorePointsQuery>,
    vrpq: &VerticaRestorePointsQuery,
    restore_points: Vec<RestorePointInfo>,
    querying: bool,
    reason: &str,
) -> Result<()> {
    let previous = vrpq.status.clone().unwrap_or_default();
    let conditions = [
        make_condition(
            TYPE_QUERYING,
            if querying { CONDITION_TRUE } else { CONDITION_FALSE },
            reason,
            "Restore point listing state.",
            vrpq.metadata.generation,
        ),
        make_condition(
            TYPE_QUERY_COMPLETE,
            if !querying && reason == "QueryFinished" {
                CONDITION_TRUE
            } else {
                CONDITION_FALSE
            },
            reason,
            "Restore point listing state.",
            vrpq.metadata.generation,
        ),
    ]
    .iter()
    .fold(previous.conditions.clone().unwrap_or_default(), |acc, c| {
        update_conditions(acc, c)
    });

    let new_status = VerticaRestorePointsQueryStatus {
        conditions: Some(conditions),
        restore_points: if restore_points.is_empty() && reason != "QueryFinished" {
            previous.restore_points
        } else {
            restore_points
        },
    };
    // safe unwrap: VerticaRestorePointsQuery is namespaced scoped
    let api: Api<VerticaRestorePointsQuery> =
        Api::namespaced(ctx.client.clone(), &vrpq.namespace().unwrap());
    api.patch_status(
        &vrpq.name_any(),
        &PatchParams::apply(RESTOREPOINTS_OPERATOR_NAME).force(),
        &Patch::Apply(json!({
            "apiVersion": "vertica.com/v1beta1",
            "kind": "VerticaRestorePointsQuery",
            "status": new_status,
        })),
    )
    .await
    .map_err(|e| {
        ctx.metrics.status_update_errors_inc();
        Error::KubeError(
            format!(
                "failed to patch VerticaRestorePointsQuery/status {}",
                vrpq.name_any()
            ),
            Box::new(e),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn point(archive: &str, id: &str, ts: &str) -> RestorePoint {
        RestorePoint {
            archive: archive.to_string(),
            id: id.to_string(),
            index: 1,
            timestamp: ts.to_string(),
        }
    }

    #[test]
    fn test_apply_filter_none_keeps_all() {
        let points = vec![point("a", "p1", "2024-07-01 00:00:00")];
        assert_eq!(apply_filter(points, None).len(), 1);
    }

    #[test]
    fn test_apply_filter_archive_and_window() {
        let points = vec![
            point("a", "p1", "2024-07-01 00:00:00"),
            point("a", "p2", "2024-07-15 00:00:00"),
            point("b", "p3", "2024-07-15 00:00:00"),
        ];
        let filter = RestorePointsFilter {
            archive: Some("a".to_string()),
            start_timestamp: Some("2024-07-10 00:00:00".to_string()),
            end_timestamp: None,
        };
        let filtered = apply_filter(points, Some(&filter));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "p2");
    }
}
