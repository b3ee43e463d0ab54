pub mod context;

use self::context::{Context, Stores};

use crate::backoff_reconciler;
use crate::controller::{
    check_api_queryable, create_subscriber, create_watcher, ControllerId, ResourceReflector,
    State, RELOAD_BUFFER_SIZE, SUBSCRIBE_BUFFER_SIZE,
};
use crate::vdb::crd::VerticaDB;
use crate::vdb::reconcile::reconcile_vdb;

use vertiop_k8s_util::error::Error;

use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::{watcher, WatchStreamExt};
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "verticadb";

/// Initialize the VerticaDB controller and its owned-resource watchers.
pub async fn run(
    state: State,
    client: Client,
    vdb_api: Api<VerticaDB>,
    vdb_r: ResourceReflector<VerticaDB>,
    pod_api: Api<Pod>,
    pod_r: ResourceReflector<Pod>,
    concurrency: u16,
) {
    let statefulset = check_api_queryable::<StatefulSet>(client.clone()).await;
    let service = check_api_queryable::<Service>(client.clone()).await;
    let configmap = check_api_queryable::<ConfigMap>(client.clone()).await;
    let secret = check_api_queryable::<Secret>(client.clone()).await;
    let deployment = check_api_queryable::<Deployment>(client.clone()).await;

    let statefulset_r = create_subscriber::<StatefulSet>(SUBSCRIBE_BUFFER_SIZE);
    let service_r = create_subscriber::<Service>(SUBSCRIBE_BUFFER_SIZE);
    let configmap_r = create_subscriber::<ConfigMap>(SUBSCRIBE_BUFFER_SIZE);
    let secret_r = create_subscriber::<Secret>(SUBSCRIBE_BUFFER_SIZE);
    let deployment_r = create_subscriber::<Deployment>(SUBSCRIBE_BUFFER_SIZE);

    let (reload_tx, reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);

    let stores = Stores {
        statefulset_store: statefulset_r.store,
        service_store: service_r.store,
        configmap_store: configmap_r.store,
        secret_store: secret_r.store,
        pod_store: pod_r.store,
        deployment_store: deployment_r.store,
    };

    let ctx = Arc::new(Context::new(
        state.to_context(client.clone(), CONTROLLER_ID),
        stores,
    ));
    let op_ctx = Arc::new(ctx.op_ctx.clone());

    let statefulset_watcher = create_watcher(
        statefulset,
        statefulset_r.writer,
        reload_tx.clone(),
        CONTROLLER_ID,
        op_ctx.clone(),
    );
    let service_watcher = create_watcher(
        service,
        service_r.writer,
        reload_tx.clone(),
        CONTROLLER_ID,
        op_ctx.clone(),
    );
    let configmap_watcher = create_watcher(
        configmap,
        configmap_r.writer,
        reload_tx.clone(),
        CONTROLLER_ID,
        op_ctx.clone(),
    );
    let secret_watcher = create_watcher(
        secret,
        secret_r.writer,
        reload_tx.clone(),
        CONTROLLER_ID,
        op_ctx.clone(),
    );
    let pod_watcher = create_watcher(
        pod_api,
        pod_r.writer,
        reload_tx.clone(),
        CONTROLLER_ID,
        op_ctx.clone(),
    );
    let deployment_watcher = create_watcher(
        deployment,
        deployment_r.writer,
        reload_tx,
        CONTROLLER_ID,
        op_ctx,
    );

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    // TODO: watcher::Config::default().streaming_lists() when stabilized in K8s
    // https://kubernetes.io/docs/reference/using-api/api-concepts/#streaming-lists
    let vdb_watcher = watcher(vdb_api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(vdb_r.writer)
        .touched_objects();

    let vdb_controller = Controller::for_stream(vdb_watcher, vdb_r.store)
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(
            controller::Config::default()
                .debounce(Duration::from_millis(500))
                .concurrency(concurrency),
        )
        .owns_shared_stream(statefulset_r.subscriber)
        .owns_shared_stream(service_r.subscriber)
        .owns_shared_stream(configmap_r.subscriber)
        .owns_shared_stream(pod_r.subscriber)
        .owns_shared_stream(deployment_r.subscriber)
        .reconcile_all_on(reload_rx.map(|_| ()))
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_vdb),
            |_obj, _error: &Error, _ctx| unreachable!(),
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.op_ctx.metrics.ready_set(1);
    tokio::select! {
        _ = vdb_controller => {},
        _ = statefulset_watcher => {},
        _ = service_watcher => {},
        _ = configmap_watcher => {},
        _ = secret_watcher => {},
        _ = pod_watcher => {},
        _ = deployment_watcher => {},
    }
}
