//! Typed facade over the database's administrative interfaces.
//!
//! Every administrative action goes through the [`Dispatcher`], which picks
//! one of two back-ends per resource: the legacy admintools CLI invoked with
//! a pod exec, or the node management agent's HTTPS API. The legacy back-end
//! returns free-form text that is parsed here into structured results; the
//! direct back-end returns structured results natively.

pub mod admintools;
pub mod intent;
pub mod vclusterops;

use crate::metrics::{AdminOutcome, ControllerMetrics};
use crate::vdb::annotations;
use crate::vdb::crd::VerticaDB;

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::exec::PodRunner;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::client::Client;
use tokio::time::Duration;
use tracing::info;

/// Container running the Vertica server process.
pub const SERVER_CONTAINER: &str = "server";
/// Sidecar container running the node management agent.
pub const NMA_CONTAINER: &str = "nma";

pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentMethod {
    /// Exec `admintools -t <action>` in the server container and parse its
    /// textual output.
    Admintools,
    /// Talk HTTPS to the node management agent in each pod.
    VclusterOps,
}

impl DeploymentMethod {
    pub fn from_vdb(vdb: &VerticaDB) -> Self {
        if annotations::vcluster_ops_enabled(vdb) {
            DeploymentMethod::VclusterOps
        } else {
            DeploymentMethod::Admintools
        }
    }
}

/// A pod an admin action runs against or in.
#[derive(Clone, Debug, PartialEq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// Stable DNS name within the cluster, through the headless service.
    pub dns_name: String,
}

/// One database node as reported by the admin interface.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeState {
    pub name: String,
    pub host: String,
    pub up: bool,
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestorePoint {
    pub archive: String,
    pub id: String,
    pub index: i64,
    pub timestamp: String,
}

/// Which part of the cluster an action addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterTarget<'a> {
    Main,
    Sandbox(&'a str),
}

pub struct CreateDbArgs<'a> {
    pub db_name: &'a str,
    pub communal_path: &'a str,
    pub pods: &'a [PodRef],
    pub skip_package_install: bool,
    pub timeout: Duration,
}

pub struct ReplicateDbArgs<'a> {
    pub db_name: &'a str,
    /// DNS name of a node in the target (sandbox) cluster.
    pub target_host: &'a str,
    pub sandbox: &'a str,
    pub timeout: Duration,
}

/// Typed facade over C1 for administrative actions. One instance per
/// reconcile; carries no state besides the back-end clients.
pub struct Dispatcher {
    method: DeploymentMethod,
    runner: PodRunner,
    nma: vclusterops::NmaClient,
    metrics: Arc<ControllerMetrics>,
    db_name: String,
}

impl Dispatcher {
    pub fn from_vdb(
        client: Client,
        metrics: Arc<ControllerMetrics>,
        vdb: &VerticaDB,
        nma_tls_secret: Option<&Secret>,
    ) -> Result<Self> {
        Ok(Self {
            method: DeploymentMethod::from_vdb(vdb),
            runner: PodRunner::new(client),
            nma: vclusterops::NmaClient::new(nma_tls_secret)?,
            metrics,
            db_name: vdb.spec.db_name.clone(),
        })
    }

    pub fn method(&self) -> DeploymentMethod {
        self.method
    }

    /// Record the metric outcome of an action and pass the result through.
    fn observe<T>(&self, action: &str, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => AdminOutcome::Success,
            Err(Error::AdminRetryable(_, _)) => AdminOutcome::Retryable,
            Err(Error::AdminFatal(_, _)) => AdminOutcome::Fatal,
            Err(_) => AdminOutcome::Retryable,
        };
        self.metrics.admin_action_inc(action, outcome);
        result
    }

    /// Like [`Self::observe`], but folds the idempotent already-done answer
    /// parsed from the back-end into a success.
    fn finish(&self, action: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(Error::AdminFatal(_, detail)) if admintools::is_already_done(&detail) => {
                info!(msg = format!("{action} already done"), detail);
                self.metrics.admin_action_inc(action, AdminOutcome::AlreadyDone);
                Ok(())
            }
            other => self.observe(action, other),
        }
    }

    pub async fn create_db(&self, args: CreateDbArgs<'_>) -> Result<()> {
        let action = "create_db";
        info!(msg = "invoking create_db", db_name = args.db_name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::create_db(&self.runner, &args).await
            }
            DeploymentMethod::VclusterOps => self.nma.create_db(&args).await,
        };
        info!(msg = "create_db finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn revive_db(&self, args: CreateDbArgs<'_>) -> Result<()> {
        let action = "revive_db";
        info!(msg = "invoking revive_db", db_name = args.db_name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::revive_db(&self.runner, &args).await
            }
            DeploymentMethod::VclusterOps => self.nma.revive_db(&args).await,
        };
        info!(msg = "revive_db finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn start_db(
        &self,
        initiator: &PodRef,
        target: ClusterTarget<'_>,
        timeout: Duration,
    ) -> Result<()> {
        let action = "start_db";
        info!(msg = "invoking start_db", initiator = initiator.name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::start_db(&self.runner, &self.db_name, initiator, target, timeout).await
            }
            DeploymentMethod::VclusterOps => {
                self.nma
                    .start_db(&self.db_name, initiator, target, timeout)
                    .await
            }
        };
        info!(msg = "start_db finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn stop_db(&self, initiator: &PodRef, target: ClusterTarget<'_>) -> Result<()> {
        let action = "stop_db";
        info!(msg = "invoking stop_db", initiator = initiator.name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::stop_db(&self.runner, &self.db_name, initiator, target).await
            }
            DeploymentMethod::VclusterOps => self.nma.stop_db(&self.db_name, initiator, target).await,
        };
        info!(msg = "stop_db finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn stop_node(&self, initiator: &PodRef, node: &PodRef) -> Result<()> {
        let action = "stop_node";
        info!(msg = "invoking stop_node", node = node.name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::stop_node(&self.runner, &self.db_name, initiator, node).await
            }
            DeploymentMethod::VclusterOps => self.nma.stop_node(&self.db_name, node).await,
        };
        info!(msg = "stop_node finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn restart_node(&self, initiator: &PodRef, node: &PodRef) -> Result<()> {
        let action = "restart_node";
        info!(msg = "invoking restart_node", node = node.name);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::restart_node(&self.runner, &self.db_name, initiator, node).await
            }
            DeploymentMethod::VclusterOps => self.nma.restart_node(&self.db_name, node).await,
        };
        info!(msg = "restart_node finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn add_node(
        &self,
        initiator: &PodRef,
        new_node: &PodRef,
        subcluster: &str,
    ) -> Result<()> {
        let action = "add_node";
        info!(msg = "invoking add_node", node = new_node.name, subcluster);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::add_node(&self.runner, &self.db_name, initiator, new_node, subcluster)
                    .await
            }
            DeploymentMethod::VclusterOps => {
                self.nma.add_node(&self.db_name, new_node, subcluster).await
            }
        };
        info!(msg = "add_node finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn remove_node(
        &self,
        initiator: &PodRef,
        node: &PodRef,
        subcluster: &str,
    ) -> Result<()> {
        let action = "remove_node";
        info!(msg = "invoking remove_node", node = node.name, subcluster);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::remove_node(&self.runner, &self.db_name, initiator, node).await
            }
            DeploymentMethod::VclusterOps => self.nma.remove_node(&self.db_name, node).await,
        };
        info!(msg = "remove_node finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn sandbox_subcluster(
        &self,
        initiator: &PodRef,
        sandbox: &str,
        subcluster: &str,
    ) -> Result<()> {
        let action = "sandbox_subcluster";
        info!(msg = "invoking sandbox_subcluster", sandbox, subcluster);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::sandbox_subcluster(
                    &self.runner,
                    &self.db_name,
                    initiator,
                    sandbox,
                    subcluster,
                )
                .await
            }
            DeploymentMethod::VclusterOps => {
                self.nma
                    .sandbox_subcluster(&self.db_name, initiator, sandbox, subcluster)
                    .await
            }
        };
        info!(msg = "sandbox_subcluster finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn unsandbox_subcluster(&self, initiator: &PodRef, subcluster: &str) -> Result<()> {
        let action = "unsandbox_subcluster";
        info!(msg = "invoking unsandbox_subcluster", subcluster);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::unsandbox_subcluster(&self.runner, &self.db_name, initiator, subcluster)
                    .await
            }
            DeploymentMethod::VclusterOps => {
                self.nma
                    .unsandbox_subcluster(&self.db_name, initiator, subcluster)
                    .await
            }
        };
        info!(msg = "unsandbox_subcluster finished", success = result.is_ok());
        self.finish(action, result)
    }

    pub async fn replicate_db(
        &self,
        initiator: &PodRef,
        args: ReplicateDbArgs<'_>,
    ) -> Result<()> {
        let action = "replicate_db";
        info!(msg = "invoking replicate_db", target = args.target_host);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::replicate_db(&self.runner, initiator, &args).await
            }
            DeploymentMethod::VclusterOps => self.nma.replicate_db(initiator, &args).await,
        };
        info!(msg = "replicate_db finished", success = result.is_ok());
        self.finish(action, result)
    }

    /// Save a restore point into the given archive, returning its
    /// identifier.
    pub async fn save_restore_point(&self, initiator: &PodRef, archive: &str) -> Result<String> {
        let action = "save_restore_point";
        info!(msg = "invoking save_restore_point", archive);
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::save_restore_point(&self.runner, &self.db_name, initiator, archive)
                    .await
            }
            DeploymentMethod::VclusterOps => {
                self.nma
                    .save_restore_point(&self.db_name, initiator, archive)
                    .await
            }
        };
        info!(msg = "save_restore_point finished", success = result.is_ok());
        self.observe(action, result)
    }

    /// Read-only: list restore points available in communal storage.
    pub async fn show_restore_points(&self, initiator: &PodRef) -> Result<Vec<RestorePoint>> {
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::show_restore_points(&self.runner, &self.db_name, initiator).await
            }
            DeploymentMethod::VclusterOps => {
                self.nma.show_restore_points(&self.db_name, initiator).await
            }
        };
        self.observe("show_restore_points", result)
    }

    /// Read-only: list nodes with their state.
    pub async fn list_nodes(&self, initiator: &PodRef) -> Result<Vec<NodeState>> {
        let result = match self.method {
            DeploymentMethod::Admintools => {
                admintools::list_nodes(&self.runner, &self.db_name, initiator).await
            }
            DeploymentMethod::VclusterOps => self.nma.list_nodes(initiator).await,
        };
        self.observe("list_nodes", result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deployment_method_from_annotation() {
        let mut vdb = VerticaDB::default();
        assert_eq!(DeploymentMethod::from_vdb(&vdb), DeploymentMethod::Admintools);
        vdb.metadata.annotations = Some(
            [("vertica.com/vcluster-ops".to_string(), "true".to_string())].into(),
        );
        assert_eq!(
            DeploymentMethod::from_vdb(&vdb),
            DeploymentMethod::VclusterOps
        );
    }

}
