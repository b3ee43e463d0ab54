//! Offline upgrade: stop the whole database, swap the image everywhere,
//! restart the pods, start the database. Every transition is derived from
//! observable state, so a crashed walk resumes at the right point.

use crate::pipeline::StepResult;
use crate::vadmin::ClusterTarget;
use crate::vdb::crd::UpgradePhase;
use crate::vdb::reconcile::statefulset::build_statefulset;
use crate::vdb::reconcile::{VdbReconciler, REQUEUE_SHORT};

use vertiop_k8s_util::error::Result;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::ResourceExt;
use tracing::{debug, info};

impl VdbReconciler<'_> {
    pub(in crate::vdb::reconcile) async fn offline_upgrade(&mut self) -> Result<StepResult> {
        let target = self.target_image();

        if self.upgrade.as_ref().map(|u| u.phase) == Some(UpgradePhase::Preparing) {
            // idempotent, guarded by the recorded restore point
            self.save_upgrade_restore_point().await?;
        }

        // stop the database before any image moves
        if self.image_changed() {
            if self.facts.in_main_cluster().any(|p| p.up == Some(true)) {
                let initiator = self.initiator()?;
                info!(msg = "stopping database for offline upgrade");
                self.dispatcher
                    .stop_db(&initiator, ClusterTarget::Main)
                    .await?;
                return Ok(StepResult::Requeue(self.upgrade_requeue()));
            }
            for sc in &self.vdb.spec.subclusters {
                let mut build = self.build_context(sc);
                build.image_override = Some(target.clone());
                self.apply(build_statefulset(self.vdb, sc, &build)).await?;
            }
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        // the sets carry the new image; pods still running the old one are
        // rolled by deletion (update strategy is OnDelete)
        let stale: Vec<String> = self
            .facts
            .in_main_cluster()
            .filter(|p| p.running && p.image.as_deref() != Some(target.as_str()))
            .map(|p| p.name.clone())
            .collect();
        if !stale.is_empty() {
            let api: Api<Pod> =
                Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
            for pod in &stale {
                debug!(msg = "restarting pod with new image", pod);
                let _ignore_missing = api.delete(pod, &Default::default()).await;
            }
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        // pods are back on the new image; bring the database up
        let desired: i32 = self
            .vdb
            .spec
            .subclusters
            .iter()
            .filter(|sc| !self.effective_shutdown(sc))
            .map(|sc| sc.size)
            .sum();
        if self.facts.up_count() < desired {
            let expected_running = self
                .vdb
                .spec
                .subclusters
                .iter()
                .filter(|sc| !self.effective_shutdown(sc))
                .all(|sc| {
                    self.expected_pod_names(sc, sc.size)
                        .iter()
                        .all(|name| self.find_fact(name).map(|f| f.running).unwrap_or(false))
                });
            if !expected_running {
                return Ok(StepResult::Requeue(self.upgrade_requeue()));
            }
            let initiator = self.initiator()?;
            info!(msg = "starting database after offline upgrade");
            self.dispatcher
                .start_db(
                    &initiator,
                    ClusterTarget::Main,
                    crate::vadmin::DEFAULT_ADMIN_TIMEOUT,
                )
                .await?;
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        self.finish_upgrade().await
    }
}
