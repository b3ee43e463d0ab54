//! Per-pod facts, rebuilt from live state at the top of every reconcile.
//!
//! Facts are never cached across reconciles; staleness causes subtle
//! ordering bugs around restart and re-add. Pods that are pending,
//! terminating or missing their server container keep `None` in every
//! probed field, which is the "unknown" sentinel and never confused with
//! installed-but-down.

use crate::vadmin::{PodRef, SERVER_CONTAINER};
use crate::vdb::crd::VerticaDB;
use crate::vdb::names;
use crate::vdb::reconcile::labels::{DATABASE_LABEL, INSTANCE_LABEL, SANDBOX_LABEL, SUBCLUSTER_LABEL};

use vertiop_k8s_util::error::Result;
use vertiop_k8s_util::exec::PodRunner;

use std::collections::HashMap;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::{debug, trace};

/// Cap on concurrent probe execs per reconcile.
const PROBE_CONCURRENCY: usize = 8;
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Observable state of one pod of the database.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodFact {
    pub name: String,
    pub subcluster: String,
    /// Sandbox membership as labeled on the pod.
    pub sandbox: Option<String>,
    /// Sandbox membership as the database sees it, from the probe.
    pub db_sandbox: Option<String>,
    pub ordinal: i32,
    /// Pod object exists and its server container is running.
    pub running: bool,
    /// Pod reports Ready.
    pub ready: bool,
    /// Image of the server container.
    pub image: Option<String>,
    /// Server software is installed in the pod. `None` while unknown.
    pub installed: Option<bool>,
    /// The pod's node has been added to the database.
    pub added_to_db: Option<bool>,
    /// The vertica process is up.
    pub up: Option<bool>,
    /// The node serves reads only.
    pub read_only: Option<bool>,
    /// In-database node name, once added.
    pub node_name: Option<String>,
    /// Established client sessions, used while draining.
    pub sessions: Option<i64>,
    /// Hash of the TLS material the pod was started with, from its
    /// template annotation.
    pub tls_hash: Option<String>,
}

impl PodFact {
    pub fn pod_ref(&self, vdb: &VerticaDB) -> PodRef {
        // safe unwrap: VerticaDB is namespaced scoped
        let namespace = vdb.namespace().unwrap();
        let service = names::headless_service_name(vdb);
        PodRef {
            dns_name: format!("{}.{}.{}.svc", self.name, service, namespace),
            namespace,
            name: self.name.clone(),
        }
    }

    /// The implication chain `up => addedToDB => installed` holds for every
    /// fact after normalization.
    fn normalize(mut self) -> Self {
        if self.up == Some(true) {
            self.added_to_db = Some(true);
        }
        if self.added_to_db == Some(true) {
            self.installed = Some(true);
        }
        self
    }
}

/// All facts of one reconcile iteration.
#[derive(Clone, Debug, Default)]
pub struct PodFacts {
    pub pods: Vec<PodFact>,
}

impl PodFacts {
    /// Probe every pod carrying the database's labels. Pods are discovered
    /// through the shared pod cache; probes run through C1 with bounded
    /// concurrency.
    pub async fn collect(
        runner: &PodRunner,
        pod_store: &Store<Pod>,
        vdb: &VerticaDB,
    ) -> Result<PodFacts> {
        let namespace = vdb.namespace();
        let instance = vdb.name_any();
        let members: Vec<_> = pod_store
            .state()
            .into_iter()
            .filter(|p| {
                p.namespace() == namespace
                    && p.labels().get(INSTANCE_LABEL) == Some(&instance)
                    && p.labels().get(DATABASE_LABEL) == Some(&vdb.spec.db_name)
            })
            .collect();
        debug!(msg = format!("collecting facts for {} pods", members.len()));

        let facts = stream::iter(members)
            .map(|pod| async move { probe_pod(runner, vdb, &pod).await })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut pods: Vec<PodFact> = facts.into_iter().collect();
        pods.sort_by(|a, b| (&a.subcluster, a.ordinal).cmp(&(&b.subcluster, b.ordinal)));
        Ok(PodFacts { pods })
    }

    pub fn up_count(&self) -> i32 {
        self.pods.iter().filter(|p| p.up == Some(true)).count() as i32
    }

    pub fn added_count(&self) -> i32 {
        self.pods
            .iter()
            .filter(|p| p.added_to_db == Some(true))
            .count() as i32
    }

    pub fn subcluster(&self, name: &str) -> impl Iterator<Item = &PodFact> {
        self.pods.iter().filter(move |p| p.subcluster == name)
    }

    /// Pods that belong to the sandbox in either the Kubernetes or the
    /// database view.
    pub fn in_sandbox(&self, sandbox: &str) -> impl Iterator<Item = &PodFact> {
        self.pods.iter().filter(move |p| {
            p.sandbox.as_deref() == Some(sandbox) || p.db_sandbox.as_deref() == Some(sandbox)
        })
    }

    /// Pods whose node the database itself counts as sandbox members.
    pub fn db_in_sandbox(&self, sandbox: &str) -> impl Iterator<Item = &PodFact> {
        self.pods
            .iter()
            .filter(move |p| p.db_sandbox.as_deref() == Some(sandbox))
    }

    pub fn in_main_cluster(&self) -> impl Iterator<Item = &PodFact> {
        self.pods
            .iter()
            .filter(|p| p.sandbox.is_none() && p.db_sandbox.is_none())
    }

    /// First up pod to run admin commands in, falling back to any running
    /// pod.
    pub fn initiator(&self) -> Option<&PodFact> {
        self.in_main_cluster()
            .find(|p| p.up == Some(true))
            .or_else(|| self.in_main_cluster().find(|p| p.running))
    }

    pub fn sandbox_initiator(&self, sandbox: &str) -> Option<&PodFact> {
        self.db_in_sandbox(sandbox)
            .find(|p| p.up == Some(true))
            .or_else(|| self.in_sandbox(sandbox).find(|p| p.running))
    }

    /// Nodes that are added to the database but whose process is down, and
    /// whose pod could run it.
    pub fn restartable_down_nodes(&self) -> Vec<&PodFact> {
        self.pods
            .iter()
            .filter(|p| {
                p.running
                    && p.sandbox.is_none()
                    && p.db_sandbox.is_none()
                    && p.added_to_db == Some(true)
                    && p.up == Some(false)
            })
            .collect()
    }

    /// Whether every running pod of the given iterator runs `image`.
    pub fn all_running_image<'a>(
        mut pods: impl Iterator<Item = &'a PodFact>,
        image: &str,
    ) -> bool {
        pods.all(|p| p.image.as_deref() == Some(image))
    }
}

async fn probe_pod(runner: &PodRunner, vdb: &VerticaDB, pod: &Pod) -> PodFact {
    let name = pod.name_any();
    let labels = pod.labels();
    let subcluster = labels.get(SUBCLUSTER_LABEL).cloned().unwrap_or_default();
    let sandbox = labels.get(SANDBOX_LABEL).cloned();
    let ordinal = name
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let status = pod.status.as_ref();
    let terminating = pod.meta().deletion_timestamp.is_some();
    let container_status = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == SERVER_CONTAINER));
    let running = !terminating
        && container_status
            .and_then(|c| c.state.as_ref())
            .map(|s| s.running.is_some())
            .unwrap_or(false);
    let ready = container_status.map(|c| c.ready).unwrap_or(false);
    let image = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == SERVER_CONTAINER))
        .and_then(|c| c.image.clone());

    let mut fact = PodFact {
        name: name.clone(),
        subcluster,
        sandbox,
        ordinal,
        running,
        ready,
        image,
        tls_hash: pod
            .annotations()
            .get(vertiop_k8s_util::tls::TLS_HASH_ANNOTATION)
            .cloned(),
        ..Default::default()
    };

    if !running {
        // unknown sentinel: leave every probed field at None
        return fact;
    }

    let script = probe_script(vdb);
    let argv = vec!["sh".to_string(), "-c".to_string(), script];
    match runner
        .exec(
            // safe unwrap: pods from the store are namespaced
            &pod.namespace().unwrap(),
            &name,
            SERVER_CONTAINER,
            &argv,
            None,
            PROBE_TIMEOUT,
        )
        .await
    {
        Ok(output) => {
            apply_probe_output(&mut fact, &output.stdout);
            fact.normalize()
        }
        Err(e) => {
            trace!(msg = "probe failed, keeping unknown facts", pod = name, %e);
            fact
        }
    }
}

/// One shell round-trip that prints a `key=value` line per discovered fact.
fn probe_script(vdb: &VerticaDB) -> String {
    let db = &vdb.spec.db_name;
    let catalog = &vdb.spec.local.catalog_path;
    let data = &vdb.spec.local.data_path;
    format!(
        r#"cat_dir=$(ls -d {catalog}/{db}/v_*_catalog 2>/dev/null | head -1)
if [ -n "$cat_dir" ]; then echo added_to_db=true; echo node_name=$(basename "$cat_dir" | sed 's/_catalog$//'); else echo added_to_db=false; fi
[ -f /opt/vertica/config/admintools.conf ] && echo installed=true || echo installed=false
pgrep -x vertica >/dev/null 2>&1 && echo up=true || echo up=false
[ -f {data}/{db}/read_only ] && echo read_only=true || echo read_only=false
[ -f /opt/vertica/config/sandbox_name ] && echo sandbox=$(cat /opt/vertica/config/sandbox_name)
command -v ss >/dev/null 2>&1 && echo sessions=$(ss -tn state established '( sport = :5433 )' 2>/dev/null | tail -n +2 | wc -l)
exit 0"#
    )
}

fn apply_probe_output(fact: &mut PodFact, stdout: &str) {
    let values: HashMap<&str, &str> = stdout
        .lines()
        .filter_map(|l| l.trim().split_once('='))
        .collect();

    fact.installed = values.get("installed").map(|v| *v == "true");
    fact.added_to_db = values.get("added_to_db").map(|v| *v == "true");
    fact.up = values.get("up").map(|v| *v == "true");
    fact.read_only = values.get("read_only").map(|v| *v == "true");
    fact.node_name = values.get("node_name").map(|v| v.to_string());
    fact.sessions = values.get("sessions").and_then(|v| v.parse().ok());
    if let Some(sandbox) = values.get("sandbox") {
        if !sandbox.is_empty() {
            fact.db_sandbox = Some(sandbox.to_string());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_apply_probe_output() {
        let mut fact = PodFact::default();
        apply_probe_output(
            &mut fact,
            "added_to_db=true\nnode_name=v_vertdb_node0002\ninstalled=true\nup=true\nread_only=false\nsessions=3\n",
        );
        assert_eq!(fact.added_to_db, Some(true));
        assert_eq!(fact.node_name.as_deref(), Some("v_vertdb_node0002"));
        assert_eq!(fact.up, Some(true));
        assert_eq!(fact.read_only, Some(false));
        assert_eq!(fact.sessions, Some(3));
        assert_eq!(fact.db_sandbox, None);
    }

    #[test]
    fn test_apply_probe_output_partial() {
        let mut fact = PodFact::default();
        apply_probe_output(&mut fact, "installed=false\ngarbage line\n");
        assert_eq!(fact.installed, Some(false));
        assert_eq!(fact.up, None);
        assert_eq!(fact.sessions, None);
    }

    #[test]
    fn test_normalize_implication_chain() {
        let fact = PodFact {
            up: Some(true),
            added_to_db: Some(false),
            installed: None,
            ..Default::default()
        }
        .normalize();
        assert_eq!(fact.up, Some(true));
        assert_eq!(fact.added_to_db, Some(true));
        assert_eq!(fact.installed, Some(true));
    }

    fn fact(subcluster: &str, ordinal: i32, up: Option<bool>, sandbox: Option<&str>) -> PodFact {
        PodFact {
            name: format!("mydb-{subcluster}-{ordinal}"),
            subcluster: subcluster.to_string(),
            ordinal,
            running: true,
            up,
            added_to_db: up,
            installed: up,
            sandbox: sandbox.map(String::from),
            db_sandbox: sandbox.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_counting_and_filtering() {
        let facts = PodFacts {
            pods: vec![
                fact("main", 0, Some(true), None),
                fact("main", 1, Some(false), None),
                fact("sec1", 0, Some(true), Some("sb1")),
            ],
        };
        assert_eq!(facts.up_count(), 2);
        assert_eq!(facts.subcluster("main").count(), 2);
        assert_eq!(facts.in_sandbox("sb1").count(), 1);
        assert_eq!(facts.in_main_cluster().count(), 2);
        // initiator prefers an up pod from the main cluster
        assert_eq!(facts.initiator().unwrap().name, "mydb-main-0");
        assert_eq!(facts.sandbox_initiator("sb1").unwrap().name, "mydb-sec1-0");
    }

    #[test]
    fn test_restartable_down_nodes() {
        let facts = PodFacts {
            pods: vec![
                fact("main", 0, Some(true), None),
                fact("main", 1, Some(false), None),
                // sandbox pods are restarted by the sandbox controller
                fact("sec1", 0, Some(false), Some("sb1")),
                // unknown state pods are not restart candidates
                PodFact {
                    name: "mydb-main-2".to_string(),
                    subcluster: "main".to_string(),
                    ordinal: 2,
                    running: false,
                    ..Default::default()
                },
            ],
        };
        let down = facts.restartable_down_nodes();
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].name, "mydb-main-1");
    }
}
