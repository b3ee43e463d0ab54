//! Sandbox membership outside of upgrades: move subclusters into their
//! declared sandbox, and dissolve sandboxes that left the spec.
//!
//! Membership changes are serialized: one sandbox action per walk, so two
//! pending operations on disjoint subclusters cannot interleave their
//! database-level effects.

use super::configmap::{build_sandbox_configmap, DATA_SANDBOX_NAME};
use super::status::is_db_initialized;
use super::{VdbReconciler, REQUEUE_SHORT};

use crate::pipeline::StepResult;
use crate::vdb::reconcile::labels::{INSTANCE_LABEL, SANDBOX_CONFIGMAP_LABEL};

use vertiop_k8s_util::error::Result;
use vertiop_k8s_util::events::EventType;

use kube::ResourceExt;
use tracing::info;

impl VdbReconciler<'_> {
    pub(super) async fn reconcile_sandboxes(&mut self) -> Result<StepResult> {
        if !is_db_initialized(self.vdb) {
            return Ok(StepResult::Continue);
        }

        // move declared members into their sandbox, one per pass
        for sb in &self.vdb.spec.sandboxes {
            for member in &sb.subclusters {
                let member_label = self
                    .vdb
                    .spec
                    .subclusters
                    .iter()
                    .find(|sc| sc.name == member.name)
                    .map(|sc| self.pod_label_for(sc))
                    .unwrap_or_else(|| member.name.clone());
                let needs_sandboxing = self
                    .facts
                    .subcluster(&member_label)
                    .any(|p| p.up == Some(true) && p.db_sandbox.as_deref() != Some(&sb.name));
                if !needs_sandboxing {
                    continue;
                }
                let initiator = self.up_initiator()?;
                info!(
                    msg = "sandboxing subcluster",
                    sandbox = sb.name,
                    subcluster = member.name
                );
                self.dispatcher
                    .sandbox_subcluster(&initiator, &sb.name, &member.name)
                    .await?;
                self.apply(build_sandbox_configmap(self.vdb, sb)).await?;
                self.publish_event(
                    EventType::Normal,
                    "SubclusterSandboxed",
                    "Sandbox",
                    format!("subcluster {} joined sandbox {}", member.name, sb.name),
                )
                .await;
                return Ok(StepResult::Requeue(REQUEUE_SHORT));
            }
        }

        // dissolve sandboxes that are no longer declared
        let declared: Vec<&str> = self
            .vdb
            .spec
            .sandboxes
            .iter()
            .map(|sb| sb.name.as_str())
            .collect();
        let instance = self.vdb.name_any();
        for cm in self.ctx.stores.configmap_store.state() {
            let labels = cm.labels();
            if labels.get(INSTANCE_LABEL) != Some(&instance)
                || labels.get(SANDBOX_CONFIGMAP_LABEL).map(String::as_str) != Some("true")
            {
                continue;
            }
            let Some(sandbox_name) = cm
                .data
                .as_ref()
                .and_then(|d| d.get(DATA_SANDBOX_NAME))
                .cloned()
            else {
                continue;
            };
            if declared.contains(&sandbox_name.as_str()) {
                continue;
            }
            // the online upgrade owns its replica-group sandbox lifecycle
            if self
                .upgrade
                .as_ref()
                .map(|u| u.phase != crate::vdb::crd::UpgradePhase::Idle)
                .unwrap_or(false)
            {
                continue;
            }

            if let Some(member) = self
                .facts
                .db_in_sandbox(&sandbox_name)
                .find(|p| p.up == Some(true))
            {
                let subcluster = member.subcluster.clone();
                let initiator = self.up_initiator()?;
                info!(
                    msg = "unsandboxing subcluster",
                    sandbox = sandbox_name,
                    subcluster
                );
                self.dispatcher
                    .unsandbox_subcluster(&initiator, &subcluster)
                    .await?;
                return Ok(StepResult::Requeue(REQUEUE_SHORT));
            }

            // membership drained back to the main cluster, drop the marker
            info!(msg = "removing sandbox config map", name = cm.name_any());
            self.delete(cm.as_ref()).await?;
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        Ok(StepResult::Continue)
    }
}
