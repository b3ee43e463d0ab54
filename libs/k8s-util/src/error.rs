use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    /// The websocket exec channel broke or the network path to the apiserver
    /// flapped. Retry with backoff.
    #[error("transient exec error: {0}")]
    ExecTransient(String),

    /// Pod is pending, terminating or the target container is absent.
    #[error("pod not ready: {0}")]
    PodNotReady(String),

    /// Remote command completed with a non-zero exit code. The caller decides
    /// whether this is fatal.
    #[error("command {command:?} exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("kube exec error: {0}")]
    KubeExecError(String),

    /// Admin action hit a condition the database will clear by itself, e.g.
    /// spread not yet converged.
    #[error("retryable admin error on {0}: {1}")]
    AdminRetryable(String, String),

    /// Admin action refused because a precondition does not hold. Surfaced as
    /// an Event and a Condition; never retried blindly.
    #[error("admin action {0} failed: {1}")]
    AdminFatal(String, String),

    /// Some nodes succeeded and some did not; the next facts collection
    /// reflects the partial state.
    #[error("admin action {0} partially failed: {1}")]
    AdminPartial(String, String),

    /// A resource referenced by the CR is missing or malformed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{0}: {1}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("invalid trace ID")]
    InvalidTraceId,

    #[error("{0}")]
    MissingData(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("receive output error: {0}")]
    ReceiveOutput(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    Utf8Error(String, #[source] std::str::Utf8Error),
}

/// Requeue class of an error. Transient errors requeue on the short backoff,
/// NotReady on the medium wait interval, Fatal emits an Event plus a Condition
/// and requeues on the long interval without mutating state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Transient,
    NotReady,
    Fatal,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::ExecTransient(_) | Error::AdminRetryable(_, _) | Error::KubeError(_, _) => {
                Severity::Transient
            }
            Error::PodNotReady(_) => Severity::NotReady,
            Error::AdminFatal(_, _) | Error::PreconditionFailed(_) => Severity::Fatal,
            // partial failures are observed through facts on the next pass
            Error::AdminPartial(_, _) => Severity::Transient,
            _ => Severity::Transient,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::{Error, Severity};

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            Error::ExecTransient("reset".into()).severity(),
            Severity::Transient
        );
        assert_eq!(
            Error::PodNotReady("pending".into()).severity(),
            Severity::NotReady
        );
        assert_eq!(
            Error::AdminFatal("create_db".into(), "refused".into()).severity(),
            Severity::Fatal
        );
        assert_eq!(
            Error::PreconditionFailed("missing secret".into()).severity(),
            Severity::Fatal
        );
        assert_eq!(
            Error::AdminRetryable("add_node".into(), "spread".into()).severity(),
            Severity::Transient
        );
        assert_eq!(
            Error::AdminPartial("restart_node".into(), "2/3".into()).severity(),
            Severity::Transient
        );
    }
}
