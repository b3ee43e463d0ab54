use crate::crd::VerticaScrutinize;
use crate::reconcile::reconcile_scrutinize;

use vertiop_operator::backoff_reconciler;
use vertiop_operator::controller::{error_policy, ControllerId, State};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "scrutinize";

/// Initialize the VerticaScrutinize controller; the diagnostic pods it
/// creates are owned, so their phase changes trigger reconciles.
pub async fn run(state: State, client: Client, vscr: Api<VerticaScrutinize>, concurrency: u16) {
    let pod_api = Api::<Pod>::all(client.clone());

    let ctx = Arc::new(state.to_context(client, CONTROLLER_ID));

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    // TODO: watcher::Config::default().streaming_lists() when stabilized in K8s
    // https://kubernetes.io/docs/reference/using-api/api-concepts/#streaming-lists
    let vscr_controller = Controller::new(vscr, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(
            controller::Config::default()
                .debounce(Duration::from_millis(500))
                .concurrency(concurrency),
        )
        .owns(
            pod_api,
            watcher::Config::default()
                .labels("vertica.com/scrutinize")
                .any_semantic(),
        )
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_scrutinize),
            error_policy::<VerticaScrutinize>,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    tokio::join!(vscr_controller);
}
