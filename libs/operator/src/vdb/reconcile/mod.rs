pub mod configmap;
pub mod install;
pub mod labels;
pub mod proxy;
pub mod restart;
pub mod sandbox;
pub mod scale;
pub mod service;
pub mod statefulset;
pub mod status;
pub mod tls;
pub mod upgrade;

use self::statefulset::BuildContext;
use self::status::{generate_status, patch_status, CONDITION_TRUE};

use crate::controller::context::KubeOperations;
use crate::facts::{PodFact, PodFacts};
use crate::pipeline::{walk, StepResult, StepRunner};
use crate::telemetry;
use crate::vadmin::{ClusterTarget, Dispatcher, PodRef};
use crate::vdb::controller::context::Context;
use crate::vdb::crd::{Sandbox, Subcluster, UpgradeStatus, VerticaDB};
use crate::vdb::names;
use crate::vdb::reconcile::labels::{INSTANCE_LABEL, SUBCLUSTER_LABEL};

use vertiop_k8s_util::error::{Error, Result, Severity};
use vertiop_k8s_util::events::{Event, EventType};
use vertiop_k8s_util::exec::PodRunner;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, Resource};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::{Lookup, ObjectRef};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

pub static VDB_OPERATOR_NAME: &str = "verticadbs.vertica.com";
pub static VDB_FINALIZER: &str = "verticadbs.vertica.com/finalizer";

/// Transient conditions that clear quickly, e.g. an admin action just ran
/// and facts must be refreshed.
pub const REQUEUE_SHORT: Duration = Duration::from_secs(10);
/// Waiting for pods, PVCs or other cluster machinery.
pub const REQUEUE_WAIT: Duration = Duration::from_secs(30);
/// After a fatal precondition failure; the user has to edit the CR.
pub const REQUEUE_FATAL: Duration = Duration::from_secs(600);

/// The ordered steps of one VerticaDB reconcile. Earlier steps establish
/// preconditions for later ones; the walk stops at the first step that
/// requeues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepId {
    Preconditions,
    Services,
    Proxies,
    StatefulSets,
    WaitPodsRunning,
    InstallPods,
    CreateDb,
    Shutdown,
    TlsRotation,
    RestartNodes,
    Upgrade,
    Sandboxes,
    ScaleOut,
    ScaleIn,
    ReapOrphans,
}

pub const STEPS: &[StepId] = &[
    StepId::Preconditions,
    StepId::Services,
    StepId::Proxies,
    StepId::StatefulSets,
    StepId::WaitPodsRunning,
    StepId::InstallPods,
    StepId::CreateDb,
    StepId::Shutdown,
    StepId::TlsRotation,
    StepId::RestartNodes,
    StepId::Upgrade,
    StepId::Sandboxes,
    StepId::ScaleOut,
    StepId::ScaleIn,
    StepId::ReapOrphans,
];

#[instrument(skip(ctx, vdb))]
pub async fn reconcile_vdb(vdb: Arc<VerticaDB>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.op_ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling VerticaDB");

    // safe unwrap: VerticaDB is namespaced scoped
    let namespace = vdb.namespace().unwrap();
    let vdb_api: Api<VerticaDB> = Api::namespaced(ctx.op_ctx.client.clone(), &namespace);
    finalizer(&vdb_api, VDB_FINALIZER, vdb, |event| async {
        match event {
            Finalizer::Apply(v) => v.reconcile(ctx).await,
            Finalizer::Cleanup(v) => v.cleanup(ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError("failed on VerticaDB finalizer".to_string(), Box::new(e)))
}

impl VerticaDB {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        // facts are rebuilt from live state every iteration, never cached
        let runner = PodRunner::new(ctx.op_ctx.client.clone());
        let facts = PodFacts::collect(&runner, &ctx.stores.pod_store, self).await?;
        for sc in &self.spec.subclusters {
            ctx.op_ctx.metrics.subcluster_size_set(
                &self.namespace().unwrap_or_default(),
                &self.name_any(),
                &sc.name,
                sc.size,
            );
            ctx.op_ctx.metrics.subcluster_up_nodes_set(
                &self.namespace().unwrap_or_default(),
                &self.name_any(),
                &sc.name,
                facts
                    .subcluster(&sc.name)
                    .filter(|p| p.up == Some(true))
                    .count() as i32,
            );
        }

        let nma_secret = statefulset::nma_tls_secret_name(self).and_then(|name| {
            let secret_ref = ObjectRef::new_with(&name, ()).within(&self.namespace().unwrap());
            ctx.stores.secret_store.get(&secret_ref)
        });
        let dispatcher = Dispatcher::from_vdb(
            ctx.op_ctx.client.clone(),
            ctx.op_ctx.metrics.clone(),
            self,
            nma_secret.as_deref(),
        )?;

        let mut reconciler = VdbReconciler {
            vdb: self,
            ctx: ctx.clone(),
            facts,
            dispatcher,
            upgrade: self.status.as_ref().and_then(|s| s.upgrade.clone()),
            restore_point: None,
            extra_conditions: Vec::new(),
        };

        let walked = walk(&mut reconciler, STEPS).await;

        // status writes are always attempted, also on the error path
        let new_status = generate_status(
            self,
            &reconciler.facts,
            reconciler.upgrade.clone(),
            reconciler.restore_point.clone(),
            &reconciler.extra_conditions,
        );
        if let Err(e) = patch_status(
            ctx.op_ctx.client.clone(),
            self,
            VDB_OPERATOR_NAME,
            &new_status,
        )
        .await
        {
            debug!(msg = "failed to update status", %e);
            ctx.op_ctx.metrics.status_update_errors_inc();
            // a walk error stays authoritative over the status write error
            if walked.is_ok() {
                return Err(e);
            }
        }

        match walked {
            Ok(requeue) => {
                let delay = requeue.unwrap_or(crate::controller::DEFAULT_RECONCILE_INTERVAL);
                Ok(Action::requeue(delay))
            }
            Err(e) if e.severity() == Severity::Fatal => {
                warn!(msg = "fatal reconcile error, awaiting user edit", %e);
                self.publish_warning(&ctx, &e).await;
                Ok(Action::requeue(REQUEUE_FATAL))
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort teardown: stop the database; child objects are garbage
    /// collected through owner references.
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        info!(msg = "cleaning up VerticaDB");
        let runner = PodRunner::new(ctx.op_ctx.client.clone());
        if let Ok(facts) = PodFacts::collect(&runner, &ctx.stores.pod_store, self).await {
            if let Some(initiator) = facts.initiator() {
                let dispatcher = Dispatcher::from_vdb(
                    ctx.op_ctx.client.clone(),
                    ctx.op_ctx.metrics.clone(),
                    self,
                    None,
                )?;
                let _ignore_errors = dispatcher
                    .stop_db(&initiator.pod_ref(self), ClusterTarget::Main)
                    .await
                    .map_err(|e| debug!(msg = "stop_db during cleanup failed", %e));
            }
        }
        Ok(Action::await_change())
    }

    async fn publish_warning(&self, ctx: &Context, error: &Error) {
        let _ignore_errors = ctx
            .op_ctx
            .recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: "ReconcileFailed".to_string(),
                    note: Some(error.to_string()),
                    action: "Reconcile".to_string(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await
            .map_err(|e| warn!(msg = "failed to publish event", %e));
    }
}

/// Reconcile state of one walk: the CR snapshot, this iteration's facts and
/// the draft of status fields the steps produce.
pub struct VdbReconciler<'a> {
    pub vdb: &'a VerticaDB,
    pub ctx: Arc<Context>,
    pub facts: PodFacts,
    pub dispatcher: Dispatcher,
    /// Draft of `status.upgrade`, persisted by the status gate.
    pub upgrade: Option<UpgradeStatus>,
    /// Restore point taken this walk, folded into the status update.
    pub restore_point: Option<String>,
    /// Conditions set by steps this walk, folded into the status update.
    pub extra_conditions: Vec<Condition>,
}

impl StepRunner for VdbReconciler<'_> {
    type Id = StepId;

    async fn run_step(&mut self, id: StepId) -> Result<StepResult> {
        match id {
            StepId::Preconditions => self.check_preconditions().await,
            StepId::Services => self.apply_services().await,
            StepId::Proxies => self.apply_proxies().await,
            StepId::StatefulSets => self.apply_statefulsets().await,
            StepId::WaitPodsRunning => self.wait_pods_running().await,
            StepId::InstallPods => self.install_pods().await,
            StepId::CreateDb => self.create_db().await,
            StepId::Shutdown => self.shutdown_subclusters().await,
            StepId::TlsRotation => self.rotate_tls().await,
            StepId::RestartNodes => self.restart_nodes().await,
            StepId::Upgrade => self.upgrade().await,
            StepId::Sandboxes => self.reconcile_sandboxes().await,
            StepId::ScaleOut => self.scale_out().await,
            StepId::ScaleIn => self.scale_in().await,
            StepId::ReapOrphans => self.reap_orphans().await,
        }
    }
}

impl VdbReconciler<'_> {
    pub fn namespace(&self) -> String {
        // safe unwrap: VerticaDB is namespaced scoped
        ResourceExt::namespace(&self.vdb).unwrap()
    }

    pub fn vdb_api(&self) -> Api<VerticaDB> {
        Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace())
    }

    pub async fn apply<K>(&self, obj: K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Serialize
            + Clone
            + std::fmt::Debug
            + for<'de> Deserialize<'de>,
        <K as Resource>::DynamicType: Default,
    {
        self.vdb
            .kube_patch(
                self.ctx.op_ctx.client.clone(),
                &self.ctx.op_ctx.metrics,
                obj,
                VDB_OPERATOR_NAME,
            )
            .await
    }

    pub async fn delete<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Serialize
            + Clone
            + std::fmt::Debug
            + for<'de> Deserialize<'de>,
        <K as Resource>::DynamicType: Default,
    {
        self.vdb
            .kube_delete(self.ctx.op_ctx.client.clone(), &self.ctx.op_ctx.metrics, obj)
            .await
    }

    pub fn set_condition(&mut self, type_: &str, status: &str, reason: &str, message: &str) {
        let condition = status::make_condition(
            type_,
            status,
            reason,
            message,
            self.vdb.metadata.generation,
        );
        self.extra_conditions.retain(|c| c.type_ != type_);
        self.extra_conditions.push(condition);
    }

    pub fn set_condition_true(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(type_, CONDITION_TRUE, reason, message);
    }

    pub async fn publish_event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let _ignore_errors = self
            .ctx
            .op_ctx
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(note),
                    action: action.to_string(),
                    secondary: None,
                },
                &self.vdb.object_ref(&()),
            )
            .await
            .map_err(|e| warn!(msg = "failed to publish event", %e));
    }

    /// Persist the current status draft mid-walk. Used by state machines
    /// whose progress markers must survive a crash before the walk ends.
    pub async fn persist_status(&self) -> Result<()> {
        let new_status = generate_status(
            self.vdb,
            &self.facts,
            self.upgrade.clone(),
            self.restore_point.clone(),
            &self.extra_conditions,
        );
        patch_status(
            self.ctx.op_ctx.client.clone(),
            self.vdb,
            VDB_OPERATOR_NAME,
            &new_status,
        )
        .await
    }

    /// Merge-patch an annotation on the CR.
    pub async fn patch_vdb_annotation(&self, key: &str, value: Option<&str>) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        self.vdb_api()
            .patch(
                &self.vdb.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| {
                Error::KubeError(format!("failed to patch annotation {key}"), Box::new(e))
            })?;
        Ok(())
    }

    /// Pod to run main-cluster admin commands in. `NotReady` when no pod
    /// can take them yet.
    pub fn initiator(&self) -> Result<PodRef> {
        self.facts
            .initiator()
            .map(|p| p.pod_ref(self.vdb))
            .ok_or_else(|| Error::PodNotReady("no running pod to run admin commands".to_string()))
    }

    /// The pod-label value a subcluster's pods actually carry. After an
    /// online upgrade promotion the canonical name maps onto the promoted
    /// replica-group-b twin.
    pub fn pod_label_for(&self, sc: &Subcluster) -> String {
        crate::vdb::annotations::subcluster_selector_override(self.vdb, &sc.name)
            .unwrap_or_else(|| sc.name.clone())
    }

    /// The spec subcluster whose pods carry `label`.
    pub fn spec_subcluster_for_label(&self, label: &str) -> Option<&Subcluster> {
        self.vdb.spec.subclusters.iter().find(|sc| {
            crate::vdb::annotations::subcluster_selector_override(self.vdb, &sc.name)
                .as_deref()
                .unwrap_or(&sc.name)
                == label
        })
    }

    pub fn sandbox_of(&self, subcluster: &str) -> Option<&Sandbox> {
        self.vdb
            .spec
            .sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|s| s.name == subcluster))
    }

    /// A subcluster is shut down when it or its sandbox says so.
    pub fn effective_shutdown(&self, sc: &Subcluster) -> bool {
        sc.shutdown
            || self
                .sandbox_of(&sc.name)
                .map(|sb| sb.shutdown)
                .unwrap_or(false)
    }

    pub fn current_statefulset(&self, sc_name: &str) -> Option<Arc<StatefulSet>> {
        let name = names::statefulset_name(self.vdb, sc_name);
        let sts_ref = ObjectRef::new_with(&name, ()).within(&self.namespace());
        self.ctx.stores.statefulset_store.get(&sts_ref)
    }

    /// Replica count to apply for a subcluster this iteration. Creation is
    /// additive: fresh StatefulSets start at the full size, existing ones
    /// grow one pod at a time once the previous pods joined the database,
    /// and scale-in only happens through the drain path.
    pub fn desired_replicas(&self, sc: &Subcluster) -> i32 {
        let label = self.pod_label_for(sc);
        if self.effective_shutdown(sc)
            && self.facts.subcluster(&label).all(|p| p.up != Some(true))
        {
            return 0;
        }
        match self.current_statefulset(&sc.name) {
            None => sc.size,
            Some(sts) => {
                let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                if current == 0 && !self.effective_shutdown(sc) {
                    // waking up from shutdown
                    return sc.size;
                }
                let settled = self
                    .facts
                    .subcluster(&label)
                    .filter(|p| p.ordinal < current)
                    .all(|p| p.running && p.added_to_db == Some(true));
                let joined = self
                    .facts
                    .subcluster(&label)
                    .filter(|p| p.added_to_db == Some(true))
                    .count() as i32;
                if sc.size > current && settled && joined == current {
                    current + 1
                } else {
                    current
                }
            }
        }
    }

    /// Image to keep on a subcluster's StatefulSet outside the upgrade
    /// machinery: an image change is only rolled out by the Upgrade step,
    /// in the order its policy demands. Before the database exists there
    /// is nothing to protect and the new image applies directly.
    pub fn hold_image(&self, sc_name: &str) -> Option<String> {
        if !status::is_db_initialized(self.vdb) {
            return None;
        }
        let sts = self.current_statefulset(sc_name)?;
        let current = sts
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .first()?
            .image
            .clone()?;
        if current != self.vdb.spec.image {
            Some(current)
        } else {
            None
        }
    }

    /// Build context for a subcluster's StatefulSet in its steady state.
    pub fn build_context(&self, sc: &Subcluster) -> BuildContext {
        BuildContext {
            replicas: self.desired_replicas(sc),
            sandbox: self.sandbox_of(&sc.name).map(|sb| sb.name.clone()),
            subcluster_name: None,
            image_override: self.hold_image(&sc.name),
            template_annotations: self.tls_annotations(),
        }
    }

    /// StatefulSets in the cache that carry this database's instance label.
    pub fn owned_statefulsets(&self) -> Vec<Arc<StatefulSet>> {
        let instance = self.vdb.name_any();
        let namespace = ResourceExt::namespace(&self.vdb);
        self.ctx
            .stores
            .statefulset_store
            .state()
            .into_iter()
            .filter(|s| {
                ResourceExt::namespace(s) == namespace
                    && s.labels().get(INSTANCE_LABEL) == Some(&instance)
            })
            .collect()
    }

    pub fn statefulset_subcluster(sts: &StatefulSet) -> Option<String> {
        sts.labels().get(SUBCLUSTER_LABEL).cloned()
    }

    /// Pods expected for a subcluster at the given replica count.
    pub fn expected_pod_names(&self, sc: &Subcluster, replicas: i32) -> Vec<String> {
        let sts_name = names::statefulset_name(self.vdb, &sc.name);
        (0..replicas)
            .map(|i| names::pod_name(&sts_name, i))
            .collect()
    }

    pub fn find_fact(&self, pod_name: &str) -> Option<&PodFact> {
        self.facts.pods.iter().find(|p| p.name == pod_name)
    }

    /// Requeue delay while an upgrade is in flight.
    pub fn upgrade_requeue(&self) -> Duration {
        self.vdb
            .spec
            .upgrade_requeue_time
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(REQUEUE_WAIT)
    }

    fn tls_annotations(&self) -> BTreeMap<String, String> {
        self.tls_hash()
            .map(|hash| {
                BTreeMap::from([(
                    vertiop_k8s_util::tls::TLS_HASH_ANNOTATION.to_string(),
                    hash,
                )])
            })
            .unwrap_or_default()
    }

    /// Content hash over the referenced TLS secrets, or None when the CR
    /// references none.
    pub fn tls_hash(&self) -> Option<String> {
        let name = statefulset::nma_tls_secret_name(self.vdb)?;
        let secret_ref = ObjectRef::new_with(&name, ()).within(&self.namespace());
        let secret = self.ctx.stores.secret_store.get(&secret_ref)?;
        Some(vertiop_k8s_util::tls::secret_data_hash(&secret))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::context::Context as OperatorContext;
    use crate::metrics::ControllerMetrics;
    use crate::vdb::controller::context::{Context, Stores};
    use crate::vdb::crd::{Subcluster, VerticaDB, VerticaDBSpec};

    use vertiop_k8s_util::events::Recorder;

    use std::sync::Arc;

    use http::{Request, Response};
    use kube::runtime::reflector::store::Writer;
    use kube::{client::Body, Client};
    use serde_json::json;

    impl VerticaDB {
        /// A minimal test VerticaDB, carrying the finalizer so reconcile
        /// exercises the pipeline instead of adding it first.
        pub fn test() -> Self {
            let spec: VerticaDBSpec = serde_json::from_value(json!({
                "dbName": "vertdb",
                "image": "opentext/vertica-k8s:24.3.0-0",
                "communal": {"path": "s3://bucket/prefix"},
                "subclusters": [{"name": "main", "size": 3}],
            }))
            .unwrap();
            let mut vdb = VerticaDB::new("mydb", spec);
            vdb.meta_mut().namespace = Some("default".into());
            vdb.meta_mut().finalizers = Some(vec![VDB_FINALIZER.to_string()]);
            vdb
        }

        pub fn with_subcluster_size(mut self, size: i32) -> Self {
            self.spec.subclusters[0].size = size;
            self
        }

        pub fn with_secondary(mut self, name: &str, size: i32) -> Self {
            self.spec.subclusters.push(Subcluster {
                name: name.to_string(),
                size,
                type_: crate::vdb::crd::SubclusterType::Secondary,
                ..Default::default()
            });
            self
        }
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(ApiServerHandle);

    /// Scenarios we test for in ApiServerVerifier
    pub enum Scenario {
        /// Fresh CR, no pods yet: services and statefulsets are applied,
        /// then the walk requeues waiting for pods and status is written.
        FreshCreate(VerticaDB),
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        /// Tests only get to run specific scenarios that have matching
        /// handlers.
        ///
        /// NB: If the controller is making more calls than the scenario
        /// handles, you typically see a `KubeError(Service(Closed(())))`
        /// from the reconciler.
        pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FreshCreate(vdb) => {
                        self.handle_service_patch("mydb")
                            .await
                            .unwrap()
                            .handle_service_patch("mydb-main")
                            .await
                            .unwrap()
                            .handle_statefulset_patch("mydb-main", 3)
                            .await
                            .unwrap()
                            .handle_status_patch(&vdb)
                            .await
                    }
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_service_patch(mut self, name: &str) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/api/v1/namespaces/default/services/{name}?&force=true&fieldManager=verticadbs.vertica.com"
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let service: k8s_openapi::api::core::v1::Service =
                serde_json::from_slice(&req_body).expect("valid service");
            let response = serde_json::to_vec(&service).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_statefulset_patch(mut self, name: &str, replicas: i32) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/apps/v1/namespaces/default/statefulsets/{name}?&force=true&fieldManager=verticadbs.vertica.com"
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let sts: StatefulSet = serde_json::from_slice(&req_body).expect("valid statefulset");
            assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(replicas));
            assert_eq!(
                sts.spec
                    .as_ref()
                    .unwrap()
                    .update_strategy
                    .as_ref()
                    .unwrap()
                    .type_
                    .as_deref(),
                Some("OnDelete")
            );
            let response = serde_json::to_vec(&sts).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_patch(mut self, vdb: &VerticaDB) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/vertica.com/v1/namespaces/default/verticadbs/{}/status?&fieldManager=verticadbs.vertica.com",
                    vdb.name_any()
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value =
                serde_json::from_slice(&req_body).expect("patch object is json");
            // nothing is up yet, the status must say so
            assert_eq!(json["status"]["upNodeCount"], 0);
            assert_eq!(json["status"]["subclusterCount"], 1);
            let response = serde_json::to_vec(vdb).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    pub fn get_test_context() -> (Arc<Context>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let stores = Stores {
            statefulset_store: Writer::default().as_reader(),
            service_store: Writer::default().as_reader(),
            configmap_store: Writer::default().as_reader(),
            secret_store: Writer::default().as_reader(),
            pod_store: Writer::default().as_reader(),
            deployment_store: Writer::default().as_reader(),
        };
        let op_ctx = OperatorContext::new(
            "verticadb",
            mock_client.clone(),
            Arc::new(ControllerMetrics::default()),
            Recorder::new(mock_client, "verticadbs.vertica.com".into()),
            Writer::default().as_reader(),
            Writer::default().as_reader(),
            std::time::Duration::from_secs(300),
        );
        (
            Arc::new(Context::new(op_ctx, stores)),
            ApiServerVerifier(handle),
        )
    }

    #[tokio::test]
    async fn vdb_fresh_create_applies_objects_and_waits_for_pods() {
        let (testctx, fakeserver) = get_test_context();
        let vdb = VerticaDB::test();
        let mocksrv = fakeserver.run(Scenario::FreshCreate(vdb.clone()));
        let action = reconcile_vdb(Arc::new(vdb), testctx)
            .await
            .expect("reconciler");
        // waiting for pods requeues well before the steady-state interval
        assert_eq!(action, Action::requeue(REQUEUE_WAIT));
        timeout_after_1s(mocksrv).await;
    }

    fn reconciler_with<'a>(
        ctx: &Arc<Context>,
        vdb: &'a VerticaDB,
        facts: PodFacts,
    ) -> VdbReconciler<'a> {
        let dispatcher = Dispatcher::from_vdb(
            ctx.op_ctx.client.clone(),
            ctx.op_ctx.metrics.clone(),
            vdb,
            None,
        )
        .unwrap();
        VdbReconciler {
            vdb,
            ctx: ctx.clone(),
            facts,
            dispatcher,
            upgrade: None,
            restore_point: None,
            extra_conditions: vec![],
        }
    }

    #[test]
    fn test_desired_replicas_fresh_creates_full_size() {
        let (ctx, _handle) = get_test_context();
        let vdb = VerticaDB::test().with_subcluster_size(5);
        let reconciler = reconciler_with(&ctx, &vdb, PodFacts::default());
        // no statefulset yet: create at full size
        assert_eq!(reconciler.desired_replicas(&vdb.spec.subclusters[0]), 5);
    }

    fn added_fact(subcluster: &str, ordinal: i32, added: bool) -> crate::facts::PodFact {
        crate::facts::PodFact {
            name: format!("mydb-{subcluster}-{ordinal}"),
            subcluster: subcluster.to_string(),
            ordinal,
            running: true,
            installed: Some(true),
            added_to_db: Some(added),
            up: Some(added),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_desired_replicas_steps_one_at_a_time() {
        let (mock_service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");

        // a statefulset with 3 replicas is already live
        let mut sts = StatefulSet::default();
        sts.metadata.name = Some("mydb-main".to_string());
        sts.metadata.namespace = Some("default".to_string());
        sts.spec = Some(k8s_openapi::api::apps::v1::StatefulSetSpec {
            replicas: Some(3),
            ..Default::default()
        });
        let mut sts_writer = Writer::<StatefulSet>::default();
        sts_writer
            .apply_watcher_event(&kube::runtime::watcher::Event::Apply(sts));

        let stores = Stores {
            statefulset_store: sts_writer.as_reader(),
            service_store: Writer::default().as_reader(),
            configmap_store: Writer::default().as_reader(),
            secret_store: Writer::default().as_reader(),
            pod_store: Writer::default().as_reader(),
            deployment_store: Writer::default().as_reader(),
        };
        let op_ctx = OperatorContext::new(
            "verticadb",
            mock_client.clone(),
            Arc::new(ControllerMetrics::default()),
            Recorder::new(mock_client, "verticadbs.vertica.com".into()),
            Writer::default().as_reader(),
            Writer::default().as_reader(),
            std::time::Duration::from_secs(300),
        );
        let ctx = Arc::new(Context::new(op_ctx, stores));

        let vdb = VerticaDB::test().with_subcluster_size(5);
        let sc = vdb.spec.subclusters[0].clone();

        // all current pods joined: grow by exactly one
        let settled = PodFacts {
            pods: (0..3).map(|i| added_fact("main", i, true)).collect(),
        };
        let reconciler = reconciler_with(&ctx, &vdb, settled);
        assert_eq!(reconciler.desired_replicas(&sc), 4);

        // one pod still joining: hold the line
        let unsettled = PodFacts {
            pods: vec![
                added_fact("main", 0, true),
                added_fact("main", 1, true),
                added_fact("main", 2, false),
            ],
        };
        let reconciler = reconciler_with(&ctx, &vdb, unsettled);
        assert_eq!(reconciler.desired_replicas(&sc), 3);

        // scale-in never happens here, only through the drain path
        let vdb_small = VerticaDB::test().with_subcluster_size(2);
        let settled = PodFacts {
            pods: (0..3).map(|i| added_fact("main", i, true)).collect(),
        };
        let reconciler = reconciler_with(&ctx, &vdb_small, settled);
        assert_eq!(reconciler.desired_replicas(&vdb_small.spec.subclusters[0]), 3);
    }
}
