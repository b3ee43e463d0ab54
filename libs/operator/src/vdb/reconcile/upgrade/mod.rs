//! Image rollout. Three policies, one state machine each; progress lives
//! in `status.upgrade` so a restarted operator resumes from the point the
//! observable state and the markers determine.

pub mod offline;
pub mod online;
pub mod read_only_online;

use super::status::is_db_initialized;
use super::{VdbReconciler, REQUEUE_SHORT};

use crate::pipeline::StepResult;
use crate::vdb::annotations;
use crate::vdb::crd::{UpgradeMarker, UpgradePhase, UpgradePolicy, UpgradeStatus};
use crate::vdb::reconcile::labels::SANDBOX_LABEL;

use vertiop_k8s_util::error::Result;
use vertiop_k8s_util::events::EventType;

use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use tracing::info;

impl VdbReconciler<'_> {
    /// Entry point of the Upgrade step: detect an image change, start the
    /// policy's state machine, and drive it until the rollout converged.
    pub(super) async fn upgrade(&mut self) -> Result<StepResult> {
        if !is_db_initialized(self.vdb) {
            return Ok(StepResult::Continue);
        }

        let active = self
            .upgrade
            .as_ref()
            .map(|u| u.phase != UpgradePhase::Idle)
            .unwrap_or(false);
        if !active && !self.image_changed() {
            return Ok(StepResult::Continue);
        }

        if !active {
            return self.start_upgrade().await;
        }

        match self
            .upgrade
            .as_ref()
            .map(|u| u.policy.clone())
            .unwrap_or_default()
        {
            UpgradePolicy::Offline => self.offline_upgrade().await,
            UpgradePolicy::ReadOnlyOnline => self.read_only_online_upgrade().await,
            UpgradePolicy::Online => self.online_upgrade().await,
        }
    }

    /// Whether any main-cluster StatefulSet still runs an image different
    /// from the spec. Sandboxes run their own image on purpose.
    pub(super) fn image_changed(&self) -> bool {
        self.owned_statefulsets().iter().any(|sts| {
            if sts.labels().contains_key(SANDBOX_LABEL) {
                return false;
            }
            sts.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers.first())
                .and_then(|c| c.image.as_deref())
                .map(|image| image != self.vdb.spec.image)
                .unwrap_or(false)
        })
    }

    async fn start_upgrade(&mut self) -> Result<StepResult> {
        let policy = self.vdb.spec.upgrade_policy.clone();
        info!(msg = "starting upgrade", policy = format!("{policy:?}"));
        self.upgrade = Some(UpgradeStatus {
            policy: policy.clone(),
            phase: UpgradePhase::Preparing,
            markers: vec![UpgradeMarker::UpgradeStarted],
            started_at: Some(Timestamp::now().to_string()),
            target_image: Some(self.vdb.spec.image.clone()),
        });
        self.publish_event(
            EventType::Normal,
            "UpgradeStarted",
            "Upgrade",
            format!("upgrading to image {}", self.vdb.spec.image),
        )
        .await;
        // the marker is persisted before any external change happens
        self.persist_status().await?;
        Ok(StepResult::Requeue(REQUEUE_SHORT))
    }

    /// Optional restore point before any image change, common to every
    /// policy.
    pub(super) async fn save_upgrade_restore_point(&mut self) -> Result<()> {
        if !annotations::save_restore_point_on_upgrade(self.vdb) {
            return Ok(());
        }
        let already_taken = self
            .vdb
            .status
            .as_ref()
            .and_then(|s| s.restore_point.as_ref())
            .is_some()
            || self.restore_point.is_some();
        if already_taken {
            return Ok(());
        }
        let initiator = self.up_initiator()?;
        let id = self
            .dispatcher
            .save_restore_point(&initiator, "upgrade")
            .await?;
        info!(msg = "saved restore point before upgrade", id);
        self.restore_point = Some(id);
        Ok(())
    }

    /// Record a marker once; markers keep their canonical order.
    pub(super) fn add_marker(&mut self, marker: UpgradeMarker) {
        if let Some(upgrade) = self.upgrade.as_mut() {
            if !upgrade.markers.contains(&marker) {
                upgrade.markers.push(marker);
            }
        }
    }

    pub(super) fn set_phase(&mut self, phase: UpgradePhase) {
        if let Some(upgrade) = self.upgrade.as_mut() {
            upgrade.phase = phase;
        }
    }

    pub(super) fn has_marker(&self, marker: UpgradeMarker) -> bool {
        self.upgrade
            .as_ref()
            .map(|u| u.markers.contains(&marker))
            .unwrap_or(false)
    }

    pub(super) fn target_image(&self) -> String {
        self.upgrade
            .as_ref()
            .and_then(|u| u.target_image.clone())
            .unwrap_or_else(|| self.vdb.spec.image.clone())
    }

    /// Finish the rollout: clear the upgrade state and note the event.
    pub(super) async fn finish_upgrade(&mut self) -> Result<StepResult> {
        info!(msg = "upgrade finished", image = self.target_image());
        self.publish_event(
            EventType::Normal,
            "UpgradeSucceeded",
            "Upgrade",
            format!("all nodes run image {}", self.target_image()),
        )
        .await;
        self.upgrade = None;
        self.persist_status().await?;
        Ok(StepResult::Continue)
    }
}
