//! Online (replica-split) upgrade.
//!
//! A sandboxed copy of every subcluster (replica-group-b, the "-sb" twins)
//! is brought up on the new image against the same communal storage.
//! Client traffic shifts to the twins, committed data is replicated, the
//! twins are promoted to be the main cluster and the old group is retired.
//! Every sub-step writes a progress marker so a crashed operator resumes
//! from the correct point. If the configured timeout elapses before
//! promotion the upgrade rolls back; at or after promotion it always rolls
//! forward, the old group's state is no longer authoritative.

use crate::pipeline::StepResult;
use crate::vadmin::{ClusterTarget, intent, PodRef, ReplicateDbArgs};
use crate::vdb::annotations;
use crate::vdb::crd::{Subcluster, UpgradeMarker, UpgradePhase};
use crate::vdb::names;
use crate::vdb::reconcile::configmap::build_sandbox_configmap;
use crate::vdb::reconcile::statefulset::{build_statefulset, BuildContext};
use crate::vdb::reconcile::{VdbReconciler, REQUEUE_SHORT};

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::EventType;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, ObjectMeta};
use kube::ResourceExt;
use tracing::{debug, info, warn};

impl VdbReconciler<'_> {
    pub(in crate::vdb::reconcile) async fn online_upgrade(&mut self) -> Result<StepResult> {
        if self.online_timeout_elapsed() && !self.has_marker(UpgradeMarker::Promoted) {
            return self.rollback().await;
        }

        let phase = self
            .upgrade
            .as_ref()
            .map(|u| u.phase)
            .unwrap_or(UpgradePhase::Idle);
        match phase {
            UpgradePhase::Preparing => {
                self.save_upgrade_restore_point().await?;
                self.set_phase(UpgradePhase::Sandboxing);
                self.persist_status().await?;
                Ok(StepResult::Requeue(REQUEUE_SHORT))
            }
            UpgradePhase::Sandboxing => self.sandboxing_step().await,
            UpgradePhase::ShiftingTraffic => self.shifting_step().await,
            UpgradePhase::Replicating => self.replicating_step().await,
            UpgradePhase::Promoting => self.promoting_step().await,
            UpgradePhase::Cleaning => self.cleaning_step().await,
            UpgradePhase::Failed => {
                if !self.image_changed() {
                    // the user reverted the image; the failed rollout is over
                    self.upgrade = None;
                    self.persist_status().await?;
                    return Ok(StepResult::Continue);
                }
                Ok(StepResult::Stop)
            }
            UpgradePhase::Idle => Ok(StepResult::Continue),
        }
    }

    fn online_sandbox(&self) -> String {
        annotations::online_upgrade_sandbox_name(self.vdb)
    }

    fn online_timeout_elapsed(&self) -> bool {
        let Some(started) = self
            .upgrade
            .as_ref()
            .and_then(|u| u.started_at.as_ref())
            .and_then(|s| s.parse::<Timestamp>().ok())
        else {
            return false;
        };
        let elapsed = Timestamp::now().as_second() - started.as_second();
        elapsed > annotations::online_upgrade_timeout(self.vdb).as_secs() as i64
    }

    /// The image replica-group-a currently runs, which the twins join on
    /// before their sandbox moves to the target image.
    fn group_a_image(&self) -> String {
        self.facts
            .in_main_cluster()
            .find_map(|p| p.image.clone())
            .unwrap_or_else(|| self.target_image())
    }

    fn twin_statefulset(&self, sc: &Subcluster) -> Option<std::sync::Arc<StatefulSet>> {
        let name = names::statefulset_name(self.vdb, &names::sandbox_subcluster_name(&sc.name));
        let sts_ref = kube::runtime::reflector::ObjectRef::new_with(&name, ())
            .within(&self.namespace());
        self.ctx.stores.statefulset_store.get(&sts_ref)
    }

    fn twin_build(&self, sc: &Subcluster, image: String) -> BuildContext {
        BuildContext {
            replicas: sc.size,
            sandbox: Some(self.online_sandbox()),
            subcluster_name: Some(names::sandbox_subcluster_name(&sc.name)),
            image_override: Some(image),
            template_annotations: Default::default(),
        }
    }

    /// Form replica-group-b: twins join the database on the old image, get
    /// sandboxed, and the sandbox is then moved to the target image.
    async fn sandboxing_step(&mut self) -> Result<StepResult> {
        let sandbox = self.online_sandbox();
        let target = self.target_image();
        let old_image = self.group_a_image();

        // twins exist on the old image first so they can join the cluster
        let mut applied_any = false;
        for sc in &self.vdb.spec.subclusters {
            if self.twin_statefulset(sc).is_none() {
                let build = self.twin_build(sc, old_image.clone());
                self.apply(build_statefulset(self.vdb, sc, &build)).await?;
                applied_any = true;
            }
        }
        if applied_any {
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        let twin_pods: Vec<_> = self
            .facts
            .in_sandbox(&sandbox)
            .map(|p| p.clone())
            .collect();
        let expected: usize = self
            .vdb
            .spec
            .subclusters
            .iter()
            .map(|sc| sc.size as usize)
            .sum();
        if twin_pods.len() < expected || twin_pods.iter().any(|p| !p.running) {
            debug!(msg = "waiting for replica-group-b pods");
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        // join the database (install is handled by the install step, which
        // sees the twins through their labels)
        let pending: Vec<PodRef> = twin_pods
            .iter()
            .filter(|p| p.installed == Some(true) && p.added_to_db == Some(false))
            .map(|p| p.pod_ref(self.vdb))
            .collect();
        if !pending.is_empty() {
            let initiator = self.up_initiator()?;
            for pod in &pending {
                let subcluster = twin_pods
                    .iter()
                    .find(|p| p.name == pod.name)
                    .map(|p| p.subcluster.clone())
                    .unwrap_or_default();
                self.dispatcher
                    .add_node(&initiator, pod, &subcluster)
                    .await?;
            }
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        // sandbox membership, one subcluster per pass
        for sc in &self.vdb.spec.subclusters {
            let twin_name = names::sandbox_subcluster_name(&sc.name);
            let member_sandboxed = self
                .facts
                .pods
                .iter()
                .filter(|p| p.subcluster == twin_name)
                .all(|p| p.db_sandbox.as_deref() == Some(sandbox.as_str()));
            if !member_sandboxed {
                let initiator = self.up_initiator()?;
                info!(msg = "sandboxing replica group", subcluster = twin_name);
                self.dispatcher
                    .sandbox_subcluster(&initiator, &sandbox, &twin_name)
                    .await?;
                return Ok(StepResult::Requeue(REQUEUE_SHORT));
            }
        }

        // move the sandbox to the target image, offline within the sandbox
        let twins_on_target = self
            .vdb
            .spec
            .subclusters
            .iter()
            .all(|sc| self.twin_image(sc).as_deref() == Some(target.as_str()));
        if !twins_on_target {
            if twin_pods.iter().any(|p| p.up == Some(true)) {
                let initiator = self
                    .facts
                    .sandbox_initiator(&sandbox)
                    .map(|p| p.pod_ref(self.vdb))
                    .ok_or_else(|| {
                        Error::PodNotReady(format!("no pod to stop sandbox {sandbox}"))
                    })?;
                info!(msg = "stopping sandbox before image move", sandbox);
                self.dispatcher
                    .stop_db(&initiator, ClusterTarget::Sandbox(&sandbox))
                    .await?;
                return Ok(StepResult::Requeue(self.upgrade_requeue()));
            }
            for sc in &self.vdb.spec.subclusters {
                let build = self.twin_build(sc, target.clone());
                self.apply(build_statefulset(self.vdb, sc, &build)).await?;
            }
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        let stale: Vec<String> = twin_pods
            .iter()
            .filter(|p| p.image.as_deref() != Some(target.as_str()))
            .map(|p| p.name.clone())
            .collect();
        if !stale.is_empty() {
            let api: Api<Pod> =
                Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
            for pod in &stale {
                debug!(msg = "rolling replica-group-b pod to target image", pod);
                let _ignore_missing = api.delete(pod, &Default::default()).await;
            }
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        if twin_pods.iter().all(|p| p.up != Some(true)) {
            let initiator = self
                .facts
                .sandbox_initiator(&sandbox)
                .map(|p| p.pod_ref(self.vdb))
                .ok_or_else(|| Error::PodNotReady(format!("no pod to start sandbox {sandbox}")))?;
            info!(msg = "starting sandbox on target image", sandbox);
            self.dispatcher
                .start_db(
                    &initiator,
                    ClusterTarget::Sandbox(&sandbox),
                    crate::vadmin::DEFAULT_ADMIN_TIMEOUT,
                )
                .await?;
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }
        if twin_pods.iter().any(|p| p.up != Some(true)) {
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        let sandbox_spec = crate::vdb::crd::Sandbox {
            name: sandbox.clone(),
            image: Some(target.clone()),
            subclusters: self
                .vdb
                .spec
                .subclusters
                .iter()
                .map(|sc| crate::vdb::crd::SandboxSubcluster {
                    name: names::sandbox_subcluster_name(&sc.name),
                })
                .collect(),
            shutdown: false,
        };
        self.apply(build_sandbox_configmap(self.vdb, &sandbox_spec))
            .await?;

        self.add_marker(UpgradeMarker::SandboxCreated);
        self.set_phase(UpgradePhase::ShiftingTraffic);
        self.persist_status().await?;
        self.publish_event(
            EventType::Normal,
            "ReplicaGroupCreated",
            "Upgrade",
            format!("replica group b is up in sandbox {sandbox}"),
        )
        .await;
        Ok(StepResult::Requeue(REQUEUE_SHORT))
    }

    /// The services step already flipped the selectors for this phase, so
    /// new sessions land on the twins. Old connections drain until they
    /// close or the deadline expires.
    async fn shifting_step(&mut self) -> Result<StepResult> {
        let open_sessions: i64 = self
            .facts
            .in_main_cluster()
            .filter_map(|p| p.sessions)
            .sum();
        if open_sessions > 0 && !self.online_timeout_elapsed() {
            debug!(msg = "waiting for old sessions to drain", open_sessions);
            return Ok(StepResult::Requeue(self.upgrade_requeue()));
        }

        self.add_marker(UpgradeMarker::ClientTrafficShifted);
        self.set_phase(UpgradePhase::Replicating);
        self.persist_status().await?;
        Ok(StepResult::Requeue(REQUEUE_SHORT))
    }

    /// Replicate committed data from replica-group-a into the sandbox.
    /// Long-running and intent-gated: a restart mid-flight re-runs the
    /// replication rather than losing it.
    async fn replicating_step(&mut self) -> Result<StepResult> {
        let sandbox = self.online_sandbox();
        if let Some(token) = intent::pending(self.vdb) {
            if token.action == "replicate_db" {
                debug!(msg = "found replicate intent, re-running replication");
                intent::clear(&self.vdb_api(), self.vdb).await?;
            }
        }

        let initiator = self.up_initiator()?;
        let target_pod = self
            .facts
            .in_sandbox(&sandbox)
            .find(|p| p.up == Some(true))
            .map(|p| p.pod_ref(self.vdb))
            .ok_or_else(|| Error::PodNotReady(format!("no up pod in sandbox {sandbox}")))?;

        intent::write(&self.vdb_api(), self.vdb, "replicate_db").await?;
        let result = self
            .dispatcher
            .replicate_db(
                &initiator,
                ReplicateDbArgs {
                    db_name: &self.vdb.spec.db_name,
                    target_host: &target_pod.dns_name,
                    sandbox: &sandbox,
                    timeout: annotations::online_upgrade_timeout(self.vdb),
                },
            )
            .await;
        match result {
            Ok(()) => {
                intent::clear(&self.vdb_api(), self.vdb).await?;
                self.add_marker(UpgradeMarker::Replicated);
                self.set_phase(UpgradePhase::Promoting);
                self.persist_status().await?;
                Ok(StepResult::Requeue(REQUEUE_SHORT))
            }
            Err(e) => {
                if e.severity() == vertiop_k8s_util::error::Severity::Fatal {
                    intent::clear(&self.vdb_api(), self.vdb).await?;
                }
                Err(e)
            }
        }
    }

    /// Promote replica-group-b: unsandbox the twins, point the canonical
    /// subcluster names at the twin StatefulSets, retire group a.
    async fn promoting_step(&mut self) -> Result<StepResult> {
        let sandbox = self.online_sandbox();

        // unsandbox, one subcluster per pass
        if let Some(member) = self
            .facts
            .db_in_sandbox(&sandbox)
            .find(|p| p.up == Some(true))
        {
            let subcluster = member.subcluster.clone();
            let initiator = self.up_initiator()?;
            info!(msg = "promoting replica group subcluster", subcluster);
            self.dispatcher
                .unsandbox_subcluster(&initiator, &subcluster)
                .await?;
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }

        // the canonical names map onto the twin sets from here on
        for sc in &self.vdb.spec.subclusters {
            let twin_sts = names::statefulset_name(
                self.vdb,
                &names::sandbox_subcluster_name(&sc.name),
            );
            let name_key = format!(
                "{}{}",
                annotations::STATEFULSET_NAME_OVERRIDE_ANNOTATION_PREFIX,
                sc.name
            );
            let selector_key = format!(
                "{}{}",
                annotations::SUBCLUSTER_SELECTOR_OVERRIDE_ANNOTATION_PREFIX,
                sc.name
            );
            if self.vdb.annotations().get(&name_key).is_none() {
                self.patch_vdb_annotation(&name_key, Some(&twin_sts)).await?;
                self.patch_vdb_annotation(
                    &selector_key,
                    Some(&names::sandbox_subcluster_name(&sc.name)),
                )
                .await?;
            }
        }

        // retire group a: its nodes leave the database, then the sets go
        for sc in &self.vdb.spec.subclusters {
            let old_sts_name = format!(
                "{}-{}",
                self.vdb.name_any(),
                names::dns1035_label(&sc.name)
            );
            let group_a_pods: Vec<_> = self
                .facts
                .pods
                .iter()
                .filter(|p| p.subcluster == sc.name && p.added_to_db == Some(true))
                .map(|p| (p.name.clone(), p.pod_ref(self.vdb)))
                .collect();
            if !group_a_pods.is_empty() {
                let initiator = self.up_initiator()?;
                for (name, pod_ref) in &group_a_pods {
                    debug!(msg = "removing group-a node", pod = name);
                    self.dispatcher
                        .remove_node(&initiator, pod_ref, &sc.name)
                        .await?;
                    self.reclaim_pvc(name).await?;
                }
                return Ok(StepResult::Requeue(REQUEUE_SHORT));
            }
            let old_sts = StatefulSet {
                metadata: ObjectMeta {
                    name: Some(old_sts_name),
                    namespace: self.vdb.namespace(),
                    ..ObjectMeta::default()
                },
                ..StatefulSet::default()
            };
            self.delete(&old_sts).await?;
        }

        self.add_marker(UpgradeMarker::Promoted);
        self.set_phase(UpgradePhase::Cleaning);
        self.persist_status().await?;
        self.publish_event(
            EventType::Normal,
            "ReplicaGroupPromoted",
            "Upgrade",
            "replica group b is the main cluster now".to_string(),
        )
        .await;
        Ok(StepResult::Requeue(REQUEUE_SHORT))
    }

    async fn cleaning_step(&mut self) -> Result<StepResult> {
        let sandbox = self.online_sandbox();
        let cm = k8s_openapi::api::core::v1::ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::sandbox_configmap_name(self.vdb, &sandbox)),
                namespace: self.vdb.namespace(),
                ..ObjectMeta::default()
            },
            ..Default::default()
        };
        self.delete(&cm).await?;

        self.add_marker(UpgradeMarker::Cleaned);
        self.finish_upgrade().await
    }

    /// Tear replica-group-b down and hand control back to the user. Runs
    /// only before promotion; group a is still authoritative.
    async fn rollback(&mut self) -> Result<StepResult> {
        let sandbox = self.online_sandbox();
        warn!(msg = "online upgrade timed out, rolling back", sandbox);

        // twins leave the database first, while group a can still serve
        // the admin commands
        if let Some(initiator) = self
            .facts
            .in_main_cluster()
            .find(|p| p.up == Some(true))
            .map(|p| p.pod_ref(self.vdb))
        {
            let twin_pods: Vec<_> = self
                .facts
                .in_sandbox(&sandbox)
                .filter(|p| p.added_to_db == Some(true))
                .map(|p| (p.subcluster.clone(), p.pod_ref(self.vdb)))
                .collect();
            for (subcluster, pod_ref) in &twin_pods {
                let _best_effort = self
                    .dispatcher
                    .remove_node(&initiator, pod_ref, subcluster)
                    .await
                    .map_err(|e| debug!(msg = "rollback remove_node failed", %e));
            }
        }

        for sc in &self.vdb.spec.subclusters {
            if let Some(sts) = self.twin_statefulset(sc) {
                let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                for i in 0..replicas {
                    self.reclaim_pvc(&names::pod_name(&sts.name_any(), i)).await?;
                }
                self.delete(sts.as_ref()).await?;
            }
        }

        let cm = k8s_openapi::api::core::v1::ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::sandbox_configmap_name(self.vdb, &sandbox)),
                namespace: self.vdb.namespace(),
                ..ObjectMeta::default()
            },
            ..Default::default()
        };
        self.delete(&cm).await?;

        if let Some(upgrade) = self.upgrade.as_mut() {
            upgrade.phase = UpgradePhase::Failed;
            // traffic reverts to group a with the shift marker gone
            upgrade.markers.retain(|m| *m == UpgradeMarker::UpgradeStarted);
        }
        self.persist_status().await?;
        self.publish_event(
            EventType::Warning,
            "UpgradeRolledBack",
            "Upgrade",
            "online upgrade exceeded its timeout before promotion".to_string(),
        )
        .await;
        Ok(StepResult::Stop)
    }

    fn twin_image(&self, sc: &Subcluster) -> Option<String> {
        self.twin_statefulset(sc)?
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .first()?
            .image
            .clone()
    }
}
