//! TLS certificate rotation.
//!
//! The referenced TLS secrets are content-hashed into the pod template.
//! When the secret data changes, the hash changes, and pods still carrying
//! the old material are rolled one at a time so both trust anchors stay
//! live during the rollover.

use super::{VdbReconciler, REQUEUE_WAIT};

use crate::pipeline::StepResult;

use vertiop_k8s_util::error::{Error, Result};

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tracing::info;

impl VdbReconciler<'_> {
    pub(super) async fn rotate_tls(&mut self) -> Result<StepResult> {
        let Some(desired) = self.tls_hash() else {
            return Ok(StepResult::Continue);
        };

        let stale = self
            .facts
            .pods
            .iter()
            .find(|p| p.running && p.tls_hash.as_deref() != Some(desired.as_str()));
        let Some(pod) = stale else {
            return Ok(StepResult::Continue);
        };

        // roll one pod per pass so quorum holds through the rotation
        info!(msg = "remounting rotated TLS material", pod = pod.name);
        let api: Api<Pod> = Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
        api.delete(&pod.name, &Default::default())
            .await
            .map_err(|e| {
                Error::KubeError(
                    format!("failed to roll pod {} for TLS rotation", pod.name),
                    Box::new(e),
                )
            })?;
        Ok(StepResult::Requeue(REQUEUE_WAIT))
    }
}
