pub mod context;

use self::context::Context;

use crate::metrics::Metrics;
use crate::vdb::crd::VerticaDB;

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::Recorder;
use vertiop_k8s_util::types::short_type_name;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, ReflectHandle, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::{error, trace};

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const SUBSCRIBE_BUFFER_SIZE: usize = 256;
pub const RELOAD_BUFFER_SIZE: usize = 16;

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<Metrics>,
    /// Cache for VerticaDB resources, shared with the sibling controllers
    /// that resolve their target database through it
    pub vdb_store: Store<VerticaDB>,
    /// Cache for Pods, shared so every controller can collect facts
    pub pod_store: Store<Pod>,
    /// Event burst limit handed to every recorder
    event_burst: usize,
    /// Per-controller cap on the error backoff delay
    backoff_caps: Arc<HashMap<ControllerId, Duration>>,
}

/// Shared state for a resource stream
pub struct ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

impl State {
    pub fn new(
        metrics: Metrics,
        vdb_store: Store<VerticaDB>,
        pod_store: Store<Pod>,
        event_burst: usize,
        backoff_caps: HashMap<ControllerId, Duration>,
    ) -> Self {
        Self {
            metrics: Arc::new(metrics),
            vdb_store,
            pod_store,
            event_burst,
            backoff_caps: Arc::new(backoff_caps),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))?;
        Ok(buffer)
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            Recorder::with_burst(client, controller_id.into(), self.event_burst),
            self.vdb_store.clone(),
            self.pod_store.clone(),
            self.backoff_caps
                .get(controller_id)
                .copied()
                .unwrap_or(DEFAULT_RECONCILE_INTERVAL),
        )
    }
}

/// Implemented by sibling custom resources that point at a VerticaDB.
pub trait VdbResource {
    fn vdb_name(&self) -> String;
    fn vdb_namespace(&self) -> String;
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store_shared(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

/// Reflect a watcher stream for an owned resource kind into its shared store.
/// Watch restarts push into `reload_tx` so the controller re-reconciles
/// everything after a relist.
pub fn create_watcher<K, C>(
    api: Api<K>,
    writer: Writer<K>,
    reload_tx: mpsc::Sender<()>,
    controller_id: ControllerId,
    ctx: Arc<Context<C>>,
) -> impl std::future::Future<Output = ()>
where
    K: Resource + Lookup + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    C: Resource + Lookup + Clone + 'static,
    <C as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    // TODO: watcher::Config::default().streaming_lists() when stabilized in K8s
    // https://kubernetes.io/docs/reference/using-api/api-concepts/#streaming-lists
    watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(move |res| {
            let mut reload_tx = reload_tx.clone();
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok(watcher::Event::InitDone) => {
                        trace!(msg = format!("watch relist done for {controller_id}"));
                        // full reload after a relist; drop the signal if one
                        // is already queued
                        let _ignore = reload_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(msg = "unexpected error when watching resource", %e);
                        ctx.metrics.watch_operations_failed_inc();
                    }
                }
            }
        })
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("Handle in backoff_reconciler macro")
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    // safe unwrap: all resources in the operator are namespace scoped resources
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let cap_override = kube::ResourceExt::annotations(obj.as_ref())
                        .get($crate::vdb::annotations::MAX_BACKOFF_SECONDS_ANNOTATION)
                        .and_then(|v| v.parse().ok())
                        .map(std::time::Duration::from_secs);
                    let backoff_duration = ctx
                        .get_backoff(
                            kube::runtime::reflector::ObjectRef::from(obj.as_ref()),
                            cap_override,
                        )
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
