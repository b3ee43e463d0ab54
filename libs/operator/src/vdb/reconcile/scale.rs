//! Subcluster scaling: additive scale-out, drain-then-decrement scale-in
//! and removal of StatefulSets whose subcluster left the spec.

use super::status::is_db_initialized;
use super::{VdbReconciler, REQUEUE_SHORT, REQUEUE_WAIT};

use crate::pipeline::StepResult;
use crate::vadmin::PodRef;
use crate::vdb::annotations;
use crate::vdb::crd::UpgradeMarker;
use crate::vdb::names;

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::EventType;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{debug, info};

impl VdbReconciler<'_> {
    /// Add installed-but-unjoined pods to the database, one add_node per
    /// pod. Batching is not required; the walk revisits until the target
    /// count is reached.
    pub(super) async fn scale_out(&mut self) -> Result<StepResult> {
        if !is_db_initialized(self.vdb) {
            return Ok(StepResult::Continue);
        }
        let mut added_any = false;
        for sc in &self.vdb.spec.subclusters {
            if self.effective_shutdown(sc) {
                continue;
            }
            let label = self.pod_label_for(sc);
            let pending: Vec<_> = self
                .facts
                .subcluster(&label)
                .filter(|p| {
                    p.running
                        && p.installed == Some(true)
                        && p.added_to_db == Some(false)
                        && p.ordinal < sc.size
                })
                .map(|p| p.pod_ref(self.vdb))
                .collect();
            if pending.is_empty() {
                continue;
            }
            let initiator = match self.sandbox_of(&sc.name) {
                Some(sb) => self
                    .facts
                    .sandbox_initiator(&sb.name)
                    .filter(|p| p.up == Some(true))
                    .map(|p| p.pod_ref(self.vdb))
                    .ok_or_else(|| {
                        Error::PodNotReady(format!("no up pod in sandbox {}", sb.name))
                    })?,
                None => self.up_initiator()?,
            };
            for pod in pending {
                self.dispatcher.add_node(&initiator, &pod, &sc.name).await?;
                if let Some(fact) = self.facts.pods.iter_mut().find(|p| p.name == pod.name) {
                    fact.added_to_db = Some(true);
                }
                added_any = true;
            }
        }
        if added_any {
            // refresh facts before counting the new nodes as up
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }
        Ok(StepResult::Continue)
    }

    /// Remove surplus pods, highest ordinal first: wait for sessions to
    /// drain (bounded by the grace annotation), remove the node from the
    /// database, shrink the StatefulSet, reclaim the PVC.
    pub(super) async fn scale_in(&mut self) -> Result<StepResult> {
        for sc in &self.vdb.spec.subclusters {
            let Some(sts) = self.current_statefulset(&sc.name) else {
                continue;
            };
            let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if self.effective_shutdown(sc) || sc.size >= current {
                continue;
            }

            let target_ordinal = current - 1;
            let pod_name = names::pod_name(&sts.name_any(), target_ordinal);
            let fact = self.find_fact(&pod_name);

            if let Some(fact) = fact {
                if fact.added_to_db == Some(true) {
                    if let Some(requeue) = self.wait_for_drain(&pod_name, fact.sessions).await? {
                        return Ok(requeue);
                    }
                    let initiator = self.up_initiator()?;
                    let pod_ref = fact.pod_ref(self.vdb);
                    self.dispatcher
                        .remove_node(&initiator, &pod_ref, &sc.name)
                        .await?;
                }
            }

            self.shrink_statefulset(&sts.name_any(), current - 1).await?;
            self.reclaim_pvc(&pod_name).await?;
            self.clear_drain_start(&pod_name).await?;
            self.publish_event(
                EventType::Normal,
                "SubclusterScaledIn",
                "ScaleIn",
                format!("removed pod {pod_name} from subcluster {}", sc.name),
            )
            .await;
            // one pod per pass, re-observe before the next one
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }
        Ok(StepResult::Continue)
    }

    /// StatefulSets whose subcluster left the spec: drain their nodes out
    /// of the database, then delete the set and its service.
    pub(super) async fn reap_orphans(&mut self) -> Result<StepResult> {
        let spec_names: Vec<String> = self
            .vdb
            .spec
            .subclusters
            .iter()
            .map(|sc| sc.name.clone())
            .collect();
        let twins_active = self
            .upgrade
            .as_ref()
            .map(|u| {
                u.markers.contains(&UpgradeMarker::SandboxCreated)
                    && !u.markers.contains(&UpgradeMarker::Cleaned)
            })
            .unwrap_or(false);

        for sts in self.owned_statefulsets() {
            let Some(subcluster) = Self::statefulset_subcluster(&sts) else {
                continue;
            };
            if spec_names.contains(&subcluster) {
                continue;
            }
            // override mappings keep promoted twins alive under their new
            // subcluster name
            if spec_names.iter().any(|sc| {
                annotations::statefulset_name_override(self.vdb, sc).as_deref()
                    == Some(&sts.name_any())
            }) {
                continue;
            }
            if twins_active && subcluster.ends_with(names::SANDBOX_SUBCLUSTER_SUFFIX) {
                continue;
            }

            debug!(msg = "reaping orphan statefulset", name = sts.name_any());
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            // remove the members from the database before the pods go away
            if let Some(top) = (0..replicas)
                .rev()
                .map(|i| names::pod_name(&sts.name_any(), i))
                .find_map(|name| self.find_fact(&name))
                .filter(|f| f.added_to_db == Some(true))
            {
                let initiator = self.up_initiator()?;
                let pod_ref = top.pod_ref(self.vdb);
                self.dispatcher
                    .remove_node(&initiator, &pod_ref, &subcluster)
                    .await?;
                self.shrink_statefulset(&sts.name_any(), top.ordinal).await?;
                self.reclaim_pvc(&top.name).await?;
                return Ok(StepResult::Requeue(REQUEUE_SHORT));
            }

            self.delete(sts.as_ref()).await?;
            let service = Service {
                metadata: ObjectMeta {
                    name: Some(names::subcluster_service_name(self.vdb, &subcluster)),
                    namespace: self.vdb.namespace(),
                    ..ObjectMeta::default()
                },
                ..Service::default()
            };
            self.delete(&service).await?;
            return Ok(StepResult::Requeue(REQUEUE_SHORT));
        }
        Ok(StepResult::Continue)
    }

    /// `Ok(Some(requeue))` while the drain is still running, `Ok(None)`
    /// once sessions are gone or the grace expired.
    async fn wait_for_drain(
        &self,
        pod_name: &str,
        sessions: Option<i64>,
    ) -> Result<Option<StepResult>> {
        if sessions.unwrap_or(0) == 0 {
            return Ok(None);
        }
        let key = format!("{}{pod_name}", annotations::DRAIN_START_ANNOTATION_PREFIX);
        let started = self
            .vdb
            .annotations()
            .get(&key)
            .and_then(|v| v.parse::<Timestamp>().ok());
        match started {
            None => {
                info!(msg = "draining sessions before scale-in", pod = pod_name);
                self.patch_vdb_annotation(&key, Some(&Timestamp::now().to_string()))
                    .await?;
                Ok(Some(StepResult::Requeue(REQUEUE_WAIT)))
            }
            Some(start) => {
                let grace = annotations::drain_grace(self.vdb);
                let elapsed = Timestamp::now().as_second() - start.as_second();
                if elapsed < grace.as_secs() as i64 {
                    debug!(
                        msg = "sessions still open, waiting for drain",
                        pod = pod_name,
                        elapsed
                    );
                    Ok(Some(StepResult::Requeue(REQUEUE_WAIT)))
                } else {
                    info!(msg = "drain grace expired, removing node", pod = pod_name);
                    Ok(None)
                }
            }
        }
    }

    async fn clear_drain_start(&self, pod_name: &str) -> Result<()> {
        let key = format!("{}{pod_name}", annotations::DRAIN_START_ANNOTATION_PREFIX);
        if self.vdb.annotations().contains_key(&key) {
            self.patch_vdb_annotation(&key, None).await?;
        }
        Ok(())
    }

    pub(super) async fn shrink_statefulset(&self, name: &str, replicas: i32) -> Result<()> {
        let api: Api<StatefulSet> =
            Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::KubeError(format!("failed to shrink statefulset {name}"), Box::new(e))
            })?;
        Ok(())
    }

    pub(super) async fn reclaim_pvc(&self, pod_name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.op_ctx.client.clone(), &self.namespace());
        let pvc_name = format!("local-data-{pod_name}");
        match api.delete(&pvc_name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(
                format!("failed to reclaim pvc {pvc_name}"),
                Box::new(e),
            )),
        }
    }

    /// Initiator that is actually up; adding and removing nodes needs a
    /// live database connection.
    pub(super) fn up_initiator(&self) -> Result<PodRef> {
        self.facts
            .in_main_cluster()
            .find(|p| p.up == Some(true))
            .map(|p| p.pod_ref(self.vdb))
            .ok_or_else(|| Error::PodNotReady("no up pod to run admin commands".to_string()))
    }

}
