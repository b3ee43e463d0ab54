use crate::crd::VerticaRestorePointsQuery;
use crate::reconcile::reconcile_restore_points_query;

use vertiop_operator::backoff_reconciler;
use vertiop_operator::controller::{error_policy, ControllerId, State};

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "restorepointsquery";

/// Initialize the VerticaRestorePointsQuery controller
pub async fn run(state: State, client: Client, vrpq: Api<VerticaRestorePointsQuery>, concurrency: u16) {

    let ctx = Arc::new(state.to_context(client, CONTROLLER_ID));

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    // TODO: watcher::Config::default().streaming_lists() when stabilized in K8s
    // https://kubernetes.io/docs/reference/using-api/api-concepts/#streaming-lists
    let vrpq_controller = Controller::new(vrpq, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(
            controller::Config::default()
                .debounce(Duration::from_millis(500))
                .concurrency(concurrency),
        )
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_restore_points_query),
            error_policy::<VerticaRestorePointsQuery>,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    tokio::join!(vrpq_controller);
}
