//! Steps that take a fresh CR to a created database:
//! preconditions, object application, pod waits, per-pod install and the
//! intent-gated create/revive.

use super::configmap::build_sandbox_configmap;
use super::proxy::{build_proxy_configmap, build_proxy_deployment};
use super::service::{build_headless_service, build_subcluster_service};
use super::statefulset::build_statefulset;
use super::status::{is_db_initialized, TYPE_DB_INITIALIZED};
use super::{VdbReconciler, REQUEUE_SHORT, REQUEUE_WAIT};

use crate::pipeline::StepResult;
use crate::vadmin::{intent, CreateDbArgs, PodRef, SERVER_CONTAINER};
use crate::vdb::annotations;
use crate::vdb::crd::InitPolicy;
use crate::vdb::names;

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::events::EventType;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::{debug, info};

const PROBE_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

impl VdbReconciler<'_> {
    /// Re-check what the webhook already validated plus the referenced
    /// secrets; a missing reference is fatal until the user fixes the CR.
    pub(super) async fn check_preconditions(&mut self) -> Result<StepResult> {
        let communal = &self.vdb.spec.communal.path;
        if names::communal_scheme(communal).is_none() {
            return Err(Error::PreconditionFailed(format!(
                "unsupported communal scheme in {communal}"
            )));
        }

        let required_secrets = [
            self.vdb.spec.password_secret.as_ref(),
            self.vdb.spec.communal.credential_secret.as_ref(),
            self.vdb.spec.communal.ca_file_secret.as_ref(),
            self.vdb.spec.license_secret.as_ref(),
            self.vdb.spec.nma_tls_secret.as_ref(),
            self.vdb.spec.https_nma_tls_secret.as_ref(),
            self.vdb.spec.client_server_tls_secret.as_ref(),
        ];
        for name in required_secrets.into_iter().flatten() {
            let secret_ref =
                ObjectRef::<Secret>::new_with(name, ()).within(&self.namespace());
            if self.ctx.stores.secret_store.get(&secret_ref).is_none() {
                return Err(Error::PreconditionFailed(format!(
                    "referenced secret {name} does not exist"
                )));
            }
        }
        Ok(StepResult::Continue)
    }

    pub(super) async fn apply_services(&self) -> Result<StepResult> {
        self.apply(build_headless_service(self.vdb)).await?;
        for sc in &self.vdb.spec.subclusters {
            let selector = self.service_selector(&sc.name);
            self.apply(build_subcluster_service(self.vdb, sc, &selector))
                .await?;
        }
        Ok(StepResult::Continue)
    }

    /// The pod-label value the subcluster's client service selects. During
    /// the traffic-shift of an online upgrade, and after its promotion,
    /// sessions land on the replica-group-b twin.
    pub(super) fn service_selector(&self, subcluster: &str) -> String {
        if let Some(selector) = annotations::subcluster_selector_override(self.vdb, subcluster) {
            return selector;
        }
        let shifted = self
            .upgrade
            .as_ref()
            .map(|u| {
                u.markers
                    .contains(&crate::vdb::crd::UpgradeMarker::ClientTrafficShifted)
                    || u.phase == crate::vdb::crd::UpgradePhase::ShiftingTraffic
            })
            .unwrap_or(false);
        if shifted {
            names::sandbox_subcluster_name(subcluster)
        } else {
            subcluster.to_string()
        }
    }

    pub(super) async fn apply_proxies(&self) -> Result<StepResult> {
        for sc in &self.vdb.spec.subclusters {
            if let Some(cm) = build_proxy_configmap(self.vdb, sc) {
                self.apply(cm).await?;
            }
            if let Some(deployment) = build_proxy_deployment(self.vdb, sc) {
                self.apply(deployment).await?;
            }
        }

        // proxies whose subcluster lost its proxy config are removed
        let wanted: Vec<String> = self
            .vdb
            .spec
            .subclusters
            .iter()
            .filter(|sc| sc.proxy.as_ref().map(|p| p.replicas > 0).unwrap_or(false))
            .map(|sc| names::proxy_deployment_name(self.vdb, &sc.name))
            .collect();
        let instance = self.vdb.name_any();
        for deployment in self.ctx.stores.deployment_store.state() {
            let labels = deployment.labels();
            if labels.get(super::labels::INSTANCE_LABEL) == Some(&instance)
                && labels.get("vertica.com/proxy").map(String::as_str) == Some("true")
                && !wanted.contains(&deployment.name_any())
            {
                self.delete(deployment.as_ref()).await?;
            }
        }
        Ok(StepResult::Continue)
    }

    pub(super) async fn apply_statefulsets(&self) -> Result<StepResult> {
        for sc in &self.vdb.spec.subclusters {
            let build = self.build_context(sc);
            self.apply(build_statefulset(self.vdb, sc, &build)).await?;
        }
        // sandbox config maps are rewritten alongside, they carry the image
        // override the sandbox controller acts on
        for sb in &self.vdb.spec.sandboxes {
            self.apply(build_sandbox_configmap(self.vdb, sb)).await?;
        }
        Ok(StepResult::Continue)
    }

    pub(super) async fn wait_pods_running(&self) -> Result<StepResult> {
        for sc in &self.vdb.spec.subclusters {
            if self.effective_shutdown(sc) {
                continue;
            }
            let replicas = self.desired_replicas(sc);
            for pod_name in self.expected_pod_names(sc, replicas) {
                match self.find_fact(&pod_name) {
                    Some(fact) if fact.running => {}
                    _ => {
                        debug!(msg = "waiting for pod", pod = pod_name);
                        return Ok(StepResult::Requeue(REQUEUE_WAIT));
                    }
                }
            }
        }
        Ok(StepResult::Continue)
    }

    /// Per-pod installation: config directories, license staging and the
    /// admintools configuration. Idempotent; guarded so re-runs are cheap.
    pub(super) async fn install_pods(&mut self) -> Result<StepResult> {
        if self.vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(StepResult::Continue);
        }
        let script = install_script(
            &self.vdb.spec.local.data_path,
            &self.vdb.spec.local.depot_path,
            &self.vdb.spec.db_name,
        );
        let runner = vertiop_k8s_util::exec::PodRunner::new(self.ctx.op_ctx.client.clone());
        let namespace = self.namespace();
        let mut installed_any = false;
        for fact in self
            .facts
            .pods
            .iter_mut()
            .filter(|p| p.running && p.installed == Some(false))
        {
            info!(msg = "installing pod", pod = fact.name);
            runner
                .exec(
                    &namespace,
                    &fact.name,
                    SERVER_CONTAINER,
                    &[
                        "sh".to_string(),
                        "-c".to_string(),
                        script.clone(),
                    ],
                    None,
                    PROBE_EXEC_TIMEOUT,
                )
                .await?;
            // the walk continues with the just-installed state instead of
            // waiting a full round-trip through facts
            fact.installed = Some(true);
            installed_any = true;
        }
        if installed_any {
            debug!(msg = "installed pods this pass");
        }
        Ok(StepResult::Continue)
    }

    /// Exactly one invocation of create_db (or revive_db), gated by the
    /// intent token.
    pub(super) async fn create_db(&mut self) -> Result<StepResult> {
        if is_db_initialized(self.vdb) {
            return Ok(StepResult::Continue);
        }
        match self.vdb.spec.init_policy {
            InitPolicy::ScheduleOnly => return Ok(StepResult::Continue),
            _ => {}
        }

        if let Some(token) = intent::pending(self.vdb) {
            if token.action == "create_db" || token.action == "revive_db" {
                if self.facts.added_count() > 0 {
                    // the interrupted action went through; observable state
                    // says the database exists
                    info!(msg = "resuming from intent token, database exists");
                    intent::clear(&self.vdb_api(), self.vdb).await?;
                    self.mark_db_initialized(&token.action).await;
                    return Ok(StepResult::Requeue(REQUEUE_SHORT));
                }
                debug!(msg = "clearing stale intent token", action = token.action);
                intent::clear(&self.vdb_api(), self.vdb).await?;
            }
        }

        let creator_pods = self.creator_pods()?;
        if creator_pods.is_empty() {
            return Ok(StepResult::Requeue(REQUEUE_WAIT));
        }

        let communal_path = names::communal_path(self.vdb);
        let action = match self.vdb.spec.init_policy {
            InitPolicy::Revive => "revive_db",
            _ => "create_db",
        };
        intent::write(&self.vdb_api(), self.vdb, action).await?;

        let args = CreateDbArgs {
            db_name: &self.vdb.spec.db_name,
            communal_path: &communal_path,
            pods: &creator_pods,
            skip_package_install: self.vdb.spec.init_policy
                == InitPolicy::CreateSkipPackageInstall,
            timeout: annotations::createdb_timeout(self.vdb),
        };
        let result = match self.vdb.spec.init_policy {
            InitPolicy::Revive => self.dispatcher.revive_db(args).await,
            _ => self.dispatcher.create_db(args).await,
        };
        match result {
            Ok(()) => {
                intent::clear(&self.vdb_api(), self.vdb).await?;
                self.mark_db_initialized(action).await;
                Ok(StepResult::Requeue(REQUEUE_SHORT))
            }
            Err(e) => {
                // fatal refusals will not succeed on a blind retry; clear
                // the token so the next attempt starts clean. transient
                // failures keep it, the next reconcile resolves it against
                // facts.
                if e.severity() == vertiop_k8s_util::error::Severity::Fatal {
                    intent::clear(&self.vdb_api(), self.vdb).await?;
                }
                Err(e)
            }
        }
    }

    async fn mark_db_initialized(&mut self, action: &str) {
        let (reason, note) = if action == "revive_db" {
            ("DBRevived", "database revived from communal storage")
        } else {
            ("DBCreated", "database created")
        };
        self.set_condition_true(TYPE_DB_INITIALIZED, reason, note);
        self.publish_event(
            EventType::Normal,
            reason,
            "CreateDB",
            note.to_string(),
        )
        .await;
    }

    /// The pods create_db runs against: every pod of the primary
    /// subclusters, which must all be installed and running.
    fn creator_pods(&self) -> Result<Vec<PodRef>> {
        let mut pods = Vec::new();
        for sc in self
            .vdb
            .spec
            .subclusters
            .iter()
            .filter(|sc| sc.type_.is_primary() && !self.effective_shutdown(sc))
        {
            for pod_name in self.expected_pod_names(sc, sc.size) {
                match self.find_fact(&pod_name) {
                    Some(fact) if fact.running && fact.installed == Some(true) => {
                        pods.push(fact.pod_ref(self.vdb));
                    }
                    _ => return Ok(vec![]),
                }
            }
        }
        Ok(pods)
    }
}

fn install_script(data_path: &str, depot_path: &str, db_name: &str) -> String {
    format!(
        r#"set -e
mkdir -p {data_path}/{db_name} {depot_path}/{db_name} /opt/vertica/config/licensing
cp /home/dbadmin/licensing/mnt/* /opt/vertica/config/licensing/ 2>/dev/null || true
[ -f /opt/vertica/config/admintools.conf ] || cp /opt/vertica/config/admintools.conf.default /opt/vertica/config/admintools.conf"#
    )
}

#[cfg(test)]
mod test {
    use super::install_script;

    #[test]
    fn test_install_script_guards() {
        let script = install_script("/data", "/depot", "vertdb");
        assert!(script.contains("mkdir -p /data/vertdb /depot/vertdb"));
        // re-runs must not clobber an existing configuration
        assert!(script.contains("[ -f /opt/vertica/config/admintools.conf ]"));
    }
}
