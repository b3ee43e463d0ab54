//! Read-only online upgrade: rolling restart that keeps a quorum up.
//! Secondaries restart first and may batch; primaries restart one at a
//! time. Clients landing on a not-yet-upgraded node see a read-only view;
//! the cluster never goes fully down.

use crate::facts::PodFact;
use crate::pipeline::StepResult;
use crate::vdb::crd::{SubclusterType, UpgradePhase};
use crate::vdb::reconcile::statefulset::build_statefulset;
use crate::vdb::reconcile::{VdbReconciler, REQUEUE_SHORT};

use vertiop_k8s_util::error::Result;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tracing::{debug, info};

impl VdbReconciler<'_> {
    pub(in crate::vdb::reconcile) async fn read_only_online_upgrade(
        &mut self,
    ) -> Result<StepResult> {
        let target = self.target_image();

        if self.upgrade.as_ref().map(|u| u.phase) == Some(UpgradePhase::Preparing) {
            self.save_upgrade_restore_point().await?;
        }

        // bump every set first; OnDelete keeps the pods where they are
        if self.image_changed() {
            for sc in &self.vdb.spec.subclusters {
                let mut build = self.build_context(sc);
                build.image_override = Some(target.clone());
                self.apply(build_statefulset(self.vdb, sc, &build)).await?;
            }
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        if let Some(batch) = self.next_restart_batch(&target) {
            let api: Api<Pod> =
                Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
            let initiator = self.initiator()?;
            for pod_name in &batch {
                if let Some(fact) = self.find_fact(pod_name) {
                    // the node is shut down before its pod restarts on the
                    // new image
                    if fact.up == Some(true) {
                        let pod_ref = fact.pod_ref(self.vdb);
                        self.dispatcher.stop_node(&initiator, &pod_ref).await?;
                    }
                }
                debug!(msg = "rolling pod to new image", pod = pod_name);
                let _ignore_missing = api.delete(pod_name, &Default::default()).await;
            }
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        // all pods carry the new image; restart whatever is still down
        let down: Vec<_> = self
            .facts
            .restartable_down_nodes()
            .into_iter()
            .map(|p| p.pod_ref(self.vdb))
            .collect();
        if !down.is_empty() {
            let initiator = self.initiator()?;
            for pod in &down {
                info!(msg = "restarting upgraded node", pod = pod.name);
                self.dispatcher.restart_node(&initiator, pod).await?;
            }
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        self.finish_upgrade().await
    }

    /// The next group of pods to roll: every stale secondary at once, then
    /// primaries one at a time, and only while the other primaries are up.
    fn next_restart_batch(&self, target: &str) -> Option<Vec<String>> {
        let stale = |p: &&PodFact| p.running && p.image.as_deref() != Some(target);

        let secondaries: Vec<String> = self
            .facts
            .in_main_cluster()
            .filter(stale)
            .filter(|p| {
                self.spec_subcluster_for_label(&p.subcluster).map(|sc| sc.type_)
                    == Some(SubclusterType::Secondary)
            })
            .map(|p| p.name.clone())
            .collect();
        if !secondaries.is_empty() {
            return Some(secondaries);
        }

        let primary = self
            .facts
            .in_main_cluster()
            .filter(stale)
            .find(|p| {
                self.spec_subcluster_for_label(&p.subcluster)
                    .map(|sc| sc.type_.is_primary())
                    .unwrap_or(false)
            })?;
        // quorum guard: every other primary node must be up before this one
        // goes down
        let others_up = self
            .facts
            .in_main_cluster()
            .filter(|p| p.name != primary.name)
            .filter(|p| {
                self.spec_subcluster_for_label(&p.subcluster)
                    .map(|sc| sc.type_.is_primary())
                    .unwrap_or(false)
            })
            .all(|p| p.up == Some(true));
        if others_up {
            Some(vec![primary.name.clone()])
        } else {
            // wait for the previous restart to settle
            Some(vec![])
        }
    }

}
