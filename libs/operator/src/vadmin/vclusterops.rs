//! Direct back-end: HTTPS against the node management agent inside each pod.
//!
//! Mutual TLS uses the certificate material from the secret referenced by
//! the VerticaDB. Responses are structured JSON, so no output parsing is
//! required; HTTP status codes map onto the admin failure taxonomy.

use super::{
    ClusterTarget, CreateDbArgs, NodeState, PodRef, ReplicateDbArgs, RestorePoint,
    DEFAULT_ADMIN_TIMEOUT,
};

use vertiop_k8s_util::error::{Error, Result};

use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use tracing::trace;

/// Port the node management agent listens on in every pod.
pub const NMA_PORT: u16 = 5554;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const TLS_CA_KEY: &str = "ca.crt";

#[derive(Clone)]
pub struct NmaClient {
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct NodesResponse {
    node_list: Vec<NmaNode>,
}

#[derive(Deserialize)]
struct NmaNode {
    name: String,
    address: String,
    state: String,
    #[serde(default)]
    build_info: Option<String>,
}

#[derive(Deserialize)]
struct RestorePointsResponse {
    restore_points: Vec<NmaRestorePoint>,
}

#[derive(Deserialize)]
struct NmaRestorePoint {
    archive: String,
    id: String,
    index: i64,
    timestamp: String,
}

#[derive(Deserialize)]
struct SaveRestorePointResponse {
    id: String,
}

impl NmaClient {
    /// Build the HTTPS client. With a secret, the client presents
    /// `tls.crt`/`tls.key` and trusts `ca.crt`; without one it falls back to
    /// accepting the agent's self-signed certificate.
    pub fn new(tls_secret: Option<&Secret>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        match tls_secret.and_then(|s| s.data.as_ref()) {
            Some(data) => {
                let cert = data.get(TLS_CERT_KEY).ok_or_else(|| {
                    Error::MissingData(format!("tls secret missing key {TLS_CERT_KEY}"))
                })?;
                let key = data.get(TLS_KEY_KEY).ok_or_else(|| {
                    Error::MissingData(format!("tls secret missing key {TLS_KEY_KEY}"))
                })?;
                let mut identity_pem = cert.0.clone();
                identity_pem.extend_from_slice(&key.0);
                let identity = reqwest::Identity::from_pem(&identity_pem)
                    .map_err(|e| Error::ParseError(format!("invalid tls identity: {e}")))?;
                builder = builder.identity(identity);

                if let Some(ca) = data.get(TLS_CA_KEY) {
                    let ca = reqwest::Certificate::from_pem(&ca.0)
                        .map_err(|e| Error::ParseError(format!("invalid ca bundle: {e}")))?;
                    builder = builder.add_root_certificate(ca);
                } else {
                    builder = builder.danger_accept_invalid_certs(true);
                }
            }
            None => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let http = builder
            .build()
            .map_err(|e| Error::ParseError(format!("failed to build nma client: {e}")))?;
        Ok(Self { http })
    }

    fn url(host: &str, path: &str) -> String {
        format!("https://{host}:{NMA_PORT}/{path}")
    }

    async fn request(
        &self,
        action: &str,
        host: &str,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = Self::url(host, path);
        trace!(msg = "nma request", url, action);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::ExecTransient(format!("nma request to {url}: {e}")))?;
        classify_response(action, response).await
    }

    async fn get(&self, action: &str, host: &str, path: &str) -> Result<reqwest::Response> {
        let url = Self::url(host, path);
        trace!(msg = "nma request", url, action);
        let response = self
            .http
            .get(&url)
            .timeout(DEFAULT_ADMIN_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::ExecTransient(format!("nma request to {url}: {e}")))?;
        classify_response(action, response).await
    }

    pub async fn create_db(&self, args: &CreateDbArgs<'_>) -> Result<()> {
        let hosts: Vec<&str> = args.pods.iter().map(|p| p.dns_name.as_str()).collect();
        self.request(
            "create_db",
            &args.pods[0].dns_name,
            "v1/vertica/create-db",
            json!({
                "db_name": args.db_name,
                "communal_path": args.communal_path,
                "hosts": hosts,
                "skip_package_install": args.skip_package_install,
            }),
            args.timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn revive_db(&self, args: &CreateDbArgs<'_>) -> Result<()> {
        let hosts: Vec<&str> = args.pods.iter().map(|p| p.dns_name.as_str()).collect();
        self.request(
            "revive_db",
            &args.pods[0].dns_name,
            "v1/vertica/revive-db",
            json!({
                "db_name": args.db_name,
                "communal_path": args.communal_path,
                "hosts": hosts,
            }),
            args.timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn start_db(
        &self,
        db_name: &str,
        initiator: &PodRef,
        target: ClusterTarget<'_>,
        timeout: Duration,
    ) -> Result<()> {
        self.request(
            "start_db",
            &initiator.dns_name,
            "v1/vertica/start-db",
            json!({
                "db_name": db_name,
                "sandbox": sandbox_field(target),
            }),
            timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn stop_db(
        &self,
        db_name: &str,
        initiator: &PodRef,
        target: ClusterTarget<'_>,
    ) -> Result<()> {
        self.request(
            "stop_db",
            &initiator.dns_name,
            "v1/vertica/stop-db",
            json!({
                "db_name": db_name,
                "sandbox": sandbox_field(target),
            }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn stop_node(&self, db_name: &str, node: &PodRef) -> Result<()> {
        self.request(
            "stop_node",
            &node.dns_name,
            "v1/vertica-process/stop",
            json!({ "db_name": db_name }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn restart_node(&self, db_name: &str, node: &PodRef) -> Result<()> {
        self.request(
            "restart_node",
            &node.dns_name,
            "v1/vertica-process/restart",
            json!({ "db_name": db_name }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn add_node(&self, db_name: &str, new_node: &PodRef, subcluster: &str) -> Result<()> {
        self.request(
            "add_node",
            &new_node.dns_name,
            "v1/nodes/add",
            json!({
                "db_name": db_name,
                "subcluster": subcluster,
            }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_node(&self, db_name: &str, node: &PodRef) -> Result<()> {
        self.request(
            "remove_node",
            &node.dns_name,
            "v1/nodes/remove",
            json!({ "db_name": db_name }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn sandbox_subcluster(
        &self,
        db_name: &str,
        initiator: &PodRef,
        sandbox: &str,
        subcluster: &str,
    ) -> Result<()> {
        self.request(
            "sandbox_subcluster",
            &initiator.dns_name,
            "v1/subclusters/sandbox",
            json!({
                "db_name": db_name,
                "sandbox": sandbox,
                "subcluster": subcluster,
            }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn unsandbox_subcluster(
        &self,
        db_name: &str,
        initiator: &PodRef,
        subcluster: &str,
    ) -> Result<()> {
        self.request(
            "unsandbox_subcluster",
            &initiator.dns_name,
            "v1/subclusters/unsandbox",
            json!({
                "db_name": db_name,
                "subcluster": subcluster,
            }),
            DEFAULT_ADMIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn replicate_db(
        &self,
        initiator: &PodRef,
        args: &ReplicateDbArgs<'_>,
    ) -> Result<()> {
        self.request(
            "replicate_db",
            &initiator.dns_name,
            "v1/replicate/start",
            json!({
                "db_name": args.db_name,
                "target_host": args.target_host,
                "sandbox": args.sandbox,
            }),
            args.timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn save_restore_point(
        &self,
        db_name: &str,
        initiator: &PodRef,
        archive: &str,
    ) -> Result<String> {
        let response = self
            .request(
                "save_restore_point",
                &initiator.dns_name,
                "v1/restore-points/save",
                json!({
                    "db_name": db_name,
                    "archive": archive,
                }),
                DEFAULT_ADMIN_TIMEOUT,
            )
            .await?;
        let parsed: SaveRestorePointResponse = response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("invalid save restore point response: {e}")))?;
        Ok(parsed.id)
    }

    pub async fn show_restore_points(
        &self,
        db_name: &str,
        initiator: &PodRef,
    ) -> Result<Vec<RestorePoint>> {
        let response = self
            .get(
                "show_restore_points",
                &initiator.dns_name,
                &format!("v1/restore-points?db_name={db_name}"),
            )
            .await?;
        let parsed: RestorePointsResponse = response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("invalid restore points response: {e}")))?;
        Ok(parsed
            .restore_points
            .into_iter()
            .map(|p| RestorePoint {
                archive: p.archive,
                id: p.id,
                index: p.index,
                timestamp: p.timestamp,
            })
            .collect())
    }

    pub async fn list_nodes(&self, initiator: &PodRef) -> Result<Vec<NodeState>> {
        let response = self.get("list_nodes", &initiator.dns_name, "v1/nodes").await?;
        let parsed: NodesResponse = response
            .json()
            .await
            .map_err(|e| Error::ParseError(format!("invalid nodes response: {e}")))?;
        Ok(parsed
            .node_list
            .into_iter()
            .map(|n| NodeState {
                up: n.state == "UP",
                name: n.name,
                host: n.address,
                version: n.build_info,
            })
            .collect())
    }
}

fn sandbox_field(target: ClusterTarget<'_>) -> serde_json::Value {
    match target {
        ClusterTarget::Main => serde_json::Value::Null,
        ClusterTarget::Sandbox(name) => serde_json::Value::String(name.to_string()),
    }
}

/// Map HTTP status classes onto the admin failure taxonomy. A 409 means the
/// requested state already holds, which the dispatcher folds into success.
async fn classify_response(action: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    match status.as_u16() {
        409 => Err(Error::AdminFatal(
            action.to_string(),
            format!("already exists: {detail}"),
        )),
        429 | 502 | 503 | 504 => Err(Error::AdminRetryable(action.to_string(), detail)),
        _ => Err(Error::AdminFatal(action.to_string(), detail)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn test_client_without_secret() {
        assert!(NmaClient::new(None).is_ok());
    }

    #[test]
    fn test_client_with_incomplete_secret() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                TLS_CERT_KEY.to_string(),
                ByteString(b"pem".to_vec()),
            )])),
            ..Default::default()
        };
        let err = NmaClient::new(Some(&secret)).unwrap_err();
        assert!(matches!(err, Error::MissingData(_)));
    }

    #[test]
    fn test_sandbox_field() {
        assert_eq!(sandbox_field(ClusterTarget::Main), serde_json::Value::Null);
        assert_eq!(
            sandbox_field(ClusterTarget::Sandbox("sb1")),
            serde_json::Value::String("sb1".to_string())
        );
    }

    #[test]
    fn test_url() {
        assert_eq!(
            NmaClient::url("mydb-sc1-0.mydb.default.svc", "v1/nodes"),
            "https://mydb-sc1-0.mydb.default.svc:5554/v1/nodes"
        );
    }
}
