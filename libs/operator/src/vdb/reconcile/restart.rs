//! Shutdown of subclusters/sandboxes and automatic restart of down nodes.

use super::{VdbReconciler, REQUEUE_SHORT};

use crate::pipeline::StepResult;
use crate::vadmin::ClusterTarget;
use crate::vdb::crd::UpgradePhase;

use vertiop_k8s_util::error::{Error, Result};

use tracing::{debug, info};

impl VdbReconciler<'_> {
    /// Stop nodes of subclusters and sandboxes flagged `shutdown`. Their
    /// StatefulSets drop to zero replicas once facts confirm the processes
    /// are down.
    pub(super) async fn shutdown_subclusters(&mut self) -> Result<StepResult> {
        // whole sandboxes stop through one stop_db scoped to the sandbox
        for sb in self.vdb.spec.sandboxes.iter().filter(|sb| sb.shutdown) {
            let up_pods = self
                .facts
                .in_sandbox(&sb.name)
                .any(|p| p.up == Some(true));
            if !up_pods {
                continue;
            }
            let initiator = self
                .facts
                .sandbox_initiator(&sb.name)
                .map(|p| p.pod_ref(self.vdb))
                .ok_or_else(|| {
                    Error::PodNotReady(format!("no pod to stop sandbox {}", sb.name))
                })?;
            info!(msg = "stopping sandbox", sandbox = sb.name);
            self.dispatcher
                .stop_db(&initiator, ClusterTarget::Sandbox(&sb.name))
                .await?;
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        // individual subclusters stop node by node
        let mut stopped_any = false;
        for sc in &self.vdb.spec.subclusters {
            if !sc.shutdown || self.sandbox_of(&sc.name).is_some() {
                continue;
            }
            let label = self.pod_label_for(sc);
            let up_pods: Vec<_> = self
                .facts
                .subcluster(&label)
                .filter(|p| p.up == Some(true))
                .map(|p| p.pod_ref(self.vdb))
                .collect();
            if up_pods.is_empty() {
                continue;
            }
            let initiator = self.initiator()?;
            for pod in up_pods {
                info!(msg = "stopping node for shutdown", pod = pod.name);
                self.dispatcher.stop_node(&initiator, &pod).await?;
                stopped_any = true;
            }
        }
        if stopped_any {
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }
        Ok(StepResult::Continue)
    }

    /// Restart nodes the facts say are added but down. During an upgrade
    /// the upgrade state machine owns every restart.
    pub(super) async fn restart_nodes(&mut self) -> Result<StepResult> {
        if !self.vdb.spec.auto_restart_vertica {
            return Ok(StepResult::Continue);
        }
        if self
            .upgrade
            .as_ref()
            .map(|u| u.phase != UpgradePhase::Idle)
            .unwrap_or(false)
        {
            return Ok(StepResult::Continue);
        }

        let down: Vec<_> = self
            .facts
            .restartable_down_nodes()
            .into_iter()
            .filter(|p| {
                self.spec_subcluster_for_label(&p.subcluster)
                    .map(|sc| !self.effective_shutdown(sc))
                    .unwrap_or(false)
            })
            .map(|p| p.pod_ref(self.vdb))
            .collect();
        if down.is_empty() {
            return Ok(StepResult::Continue);
        }

        let any_up = self
            .facts
            .in_main_cluster()
            .any(|p| p.up == Some(true));
        let initiator = self.initiator()?;
        if !any_up {
            // the whole cluster is down, bring it back in one shot
            info!(msg = "cluster down, starting database");
            self.dispatcher
                .start_db(
                    &initiator,
                    ClusterTarget::Main,
                    crate::vadmin::DEFAULT_ADMIN_TIMEOUT,
                )
                .await?;
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        for pod in &down {
            debug!(msg = "restarting down node", pod = pod.name);
            self.dispatcher.restart_node(&initiator, pod).await?;
        }
        Ok(StepResult::Requeue(REQUEUE_SHORT))
    }
}
