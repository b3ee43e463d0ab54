use crate::controller::context::{BackoffContext, Context as OperatorContext};
use crate::metrics::ControllerMetrics;
use crate::vdb::crd::VerticaDB;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::runtime::reflector::{ObjectRef, Store};

/// Context of the VerticaDB controller: the generic operator context plus
/// the caches of every owned resource kind.
#[derive(Clone)]
pub struct Context {
    pub op_ctx: OperatorContext<VerticaDB>,
    pub stores: Arc<Stores>,
}

impl Context {
    pub fn new(op_ctx: OperatorContext<VerticaDB>, stores: Stores) -> Self {
        Context {
            op_ctx,
            stores: Arc::new(stores),
        }
    }
}

impl BackoffContext<VerticaDB> for Context {
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.op_ctx.metrics
    }

    async fn get_backoff(
        &self,
        obj_ref: ObjectRef<VerticaDB>,
        cap_override: Option<Duration>,
    ) -> Duration {
        self.op_ctx.get_backoff(obj_ref, cap_override).await
    }

    async fn reset_backoff(&self, obj_ref: ObjectRef<VerticaDB>) {
        self.op_ctx.reset_backoff(obj_ref).await
    }
}

pub struct Stores {
    pub statefulset_store: Store<StatefulSet>,
    pub service_store: Store<Service>,
    pub configmap_store: Store<ConfigMap>,
    pub secret_store: Store<Secret>,
    pub pod_store: Store<Pod>,
    pub deployment_store: Store<Deployment>,
}
