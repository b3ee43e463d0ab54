use crate::reconcile::reconcile_sandbox;

use vertiop_operator::backoff_reconciler;
use vertiop_operator::controller::context::{BackoffContext, Context as OperatorContext};
use vertiop_operator::controller::{
    check_api_queryable, create_subscriber, ControllerId, State, SUBSCRIBE_BUFFER_SIZE,
};
use vertiop_operator::metrics::ControllerMetrics;
use vertiop_operator::vdb::reconcile::labels::SANDBOX_CONFIGMAP_LABEL;

use vertiop_k8s_util::error::Error;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "sandbox";

/// Context of the sandbox controller: the generic operator context plus the
/// StatefulSet cache the sandbox-scoped upgrade needs. Pod facts come from
/// the shared pod cache in the operator context.
#[derive(Clone)]
pub struct Context {
    pub op_ctx: OperatorContext<ConfigMap>,
    pub statefulset_store: Store<StatefulSet>,
}

impl BackoffContext<ConfigMap> for Context {
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.op_ctx.metrics
    }

    async fn get_backoff(
        &self,
        obj_ref: ObjectRef<ConfigMap>,
        cap_override: Option<Duration>,
    ) -> Duration {
        self.op_ctx.get_backoff(obj_ref, cap_override).await
    }

    async fn reset_backoff(&self, obj_ref: ObjectRef<ConfigMap>) {
        self.op_ctx.reset_backoff(obj_ref).await
    }
}

/// Initialize the sandbox controller. It watches only the per-sandbox
/// ConfigMaps through a label selector and never touches main-cluster pods.
pub async fn run(state: State, client: Client, configmap: Api<ConfigMap>) {
    let statefulset = check_api_queryable::<StatefulSet>(client.clone()).await;

    let statefulset_r = create_subscriber::<StatefulSet>(SUBSCRIBE_BUFFER_SIZE);

    let ctx = Arc::new(Context {
        op_ctx: state.to_context(client, CONTROLLER_ID),
        statefulset_store: statefulset_r.store,
    });

    let statefulset_watcher = watcher(statefulset, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(statefulset_r.writer)
        .for_each(|_| async {});

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let selector = format!("{SANDBOX_CONFIGMAP_LABEL}=true");
    let sandbox_controller = Controller::new(
        configmap,
        watcher::Config::default().labels(&selector).any_semantic(),
    )
    // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
    .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
    .shutdown_on_signal()
    .run(
        backoff_reconciler!(reconcile_sandbox),
        |_obj, _error: &Error, _ctx| unreachable!(),
        ctx.clone(),
    )
    .filter_map(|x| async move { std::result::Result::ok(x) })
    .for_each(|_| futures::future::ready(()));

    ctx.op_ctx.metrics.ready_set(1);
    tokio::select! {
        _ = sandbox_controller => {},
        _ = statefulset_watcher => {},
    }
}
