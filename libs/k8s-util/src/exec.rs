//! Remote command execution inside pod containers.
//!
//! Wraps the apiserver exec subresource behind a deadline and maps the
//! failure modes the reconcilers care about: transient stream errors,
//! pods that are not ready to accept an exec, and commands that ran but
//! exited non-zero.

use crate::error::{Error, Result};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::client::Client;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tracing::{debug, trace};

const MAX_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes commands and shell snippets inside named containers in named
/// pods. Stateless besides the shared client; concurrent invocations are
/// independent and unordered.
#[derive(Clone)]
pub struct PodRunner {
    client: Client,
}

impl PodRunner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run `command` in `container` of `namespace/pod`, feeding `stdin` if
    /// given, bounded by `timeout`. Cancelling the future tears down the
    /// remote stream.
    pub async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        trace!(
            msg = "exec in pod",
            namespace,
            pod,
            container,
            command = command.join(" ")
        );
        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            tty: false,
            stdin: stdin.is_some(),
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(MAX_BUF_SIZE),
            max_stdout_buf_size: Some(MAX_BUF_SIZE),
            max_stderr_buf_size: Some(MAX_BUF_SIZE),
        };

        let attached = pods_api
            .exec(pod, command, &attach_params)
            .await
            .map_err(|e| classify_exec_error(namespace, pod, e))?;

        tokio::time::timeout(timeout, drain(attached, command, stdin))
            .await
            .map_err(|_| {
                Error::ExecTransient(format!(
                    "deadline of {timeout:?} exceeded for exec in {namespace}/{pod}"
                ))
            })?
    }
}

async fn drain(
    mut attached: AttachedProcess,
    command: &[String],
    stdin: Option<&str>,
) -> Result<ExecOutput> {
    if let Some(input) = stdin {
        let mut writer = attached
            .stdin()
            .ok_or_else(|| Error::MissingData("stdin".to_string()))?;
        writer
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::ExecTransient(format!("failed to write stdin: {e}")))?;
        // drop closes the remote stdin so the command can terminate
        drop(writer);
    }

    let stdout = tokio_util::io::ReaderStream::new(
        attached
            .stdout()
            .ok_or_else(|| Error::MissingData("stdout".to_string()))?,
    );
    let stderr = tokio_util::io::ReaderStream::new(
        attached
            .stderr()
            .ok_or_else(|| Error::MissingData("stderr".to_string()))?,
    );

    let status_fut = attached
        .take_status()
        .ok_or_else(|| Error::MissingData("status".to_string()))?;

    let stdout_fut = stdout
        .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
        .collect::<Vec<_>>();
    let stderr_fut = stderr
        .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
        .collect::<Vec<_>>();

    let (out_vec, err_vec, status_opt) = tokio::join!(stdout_fut, stderr_fut, status_fut);
    let out = out_vec.join("");
    let err = err_vec.join("");

    let status =
        status_opt.ok_or_else(|| Error::ReceiveOutput("process status unavailable".to_string()))?;

    match status.status.as_deref() {
        Some("Success") => Ok(ExecOutput {
            stdout: out,
            stderr: err,
        }),
        Some("Failure") => {
            debug!(
                msg = "command failed in pod",
                reason = status.reason.as_deref().unwrap_or(""),
                stderr = err.replace("\n", "\\n")
            );
            Err(Error::CommandFailed {
                command: command.join(" "),
                code: exit_code(&status),
                stderr: err,
            })
        }
        _ => Err(Error::KubeExecError(format!(
            "undefined exec status for command {:?}",
            command.join(" ")
        ))),
    }
}

/// The apiserver reports the exit code as a cause with reason `ExitCode` on
/// the failure status.
fn exit_code(status: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Status) -> Option<i32> {
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.parse().ok())
}

fn classify_exec_error(namespace: &str, pod: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref ae) if ae.code == 404 => {
            Error::PodNotReady(format!("pod {namespace}/{pod} is gone"))
        }
        kube::Error::Api(ref ae) if ae.code == 400 => {
            // apiserver rejects exec into containers that are not running
            Error::PodNotReady(format!("container in {namespace}/{pod} is not running"))
        }
        e => Error::ExecTransient(format!("exec in {namespace}/{pod}: {e}")),
    }
}

#[cfg(test)]
mod test {
    use super::exit_code;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusCause, StatusDetails};

    fn failure_status(causes: Vec<StatusCause>) -> Status {
        Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(causes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_code_parsed_from_causes() {
        let status = failure_status(vec![StatusCause {
            reason: Some("ExitCode".to_string()),
            message: Some("137".to_string()),
            ..Default::default()
        }]);
        assert_eq!(exit_code(&status), Some(137));
    }

    #[test]
    fn test_exit_code_absent() {
        let status = failure_status(vec![]);
        assert_eq!(exit_code(&status), None);
        assert_eq!(exit_code(&Status::default()), None);
    }
}
