//! Intent tokens for long-running admin actions.
//!
//! A long-running action records its intent on the CR before invoking the
//! back-end. An operator restart then finds the token, polls observable
//! state and decides whether to treat the action as done, re-run it, or
//! clear the token, instead of double-executing or hanging.

use crate::vdb::crd::VerticaDB;

use vertiop_k8s_util::error::{Error, Result};

use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub const ADMIN_INTENT_ANNOTATION: &str = "vertica.com/admin-intent";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntentToken {
    pub action: String,
    pub token: String,
    pub started_at: String,
}

/// The in-flight intent recorded on the CR, if any.
pub fn pending(vdb: &VerticaDB) -> Option<IntentToken> {
    vdb.annotations()
        .get(ADMIN_INTENT_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

/// Record an intent for `action` on the CR. Must complete before the action
/// is invoked.
pub async fn write(api: &Api<VerticaDB>, vdb: &VerticaDB, action: &str) -> Result<IntentToken> {
    let intent = IntentToken {
        action: action.to_string(),
        token: uuid::Uuid::new_v4().to_string(),
        started_at: Timestamp::now().to_string(),
    };
    debug!(msg = "writing admin intent", action, token = intent.token);
    let raw = serde_json::to_string(&intent)
        .map_err(|e| Error::SerializationError("failed to serialize intent".to_string(), e))?;
    let patch = json!({
        "metadata": {
            "annotations": {
                ADMIN_INTENT_ANNOTATION: raw,
            }
        }
    });
    api.patch(
        &vdb.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to record intent for {action}"),
            Box::new(e),
        )
    })?;
    Ok(intent)
}

/// Clear the recorded intent after the action resolved either way.
pub async fn clear(api: &Api<VerticaDB>, vdb: &VerticaDB) -> Result<()> {
    if pending(vdb).is_none() {
        return Ok(());
    }
    debug!(msg = "clearing admin intent");
    let patch = json!({
        "metadata": {
            "annotations": {
                ADMIN_INTENT_ANNOTATION: null,
            }
        }
    });
    api.patch(
        &vdb.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| Error::KubeError("failed to clear intent".to_string(), Box::new(e)))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pending_roundtrip() {
        let intent = IntentToken {
            action: "create_db".to_string(),
            token: "3e1f".to_string(),
            started_at: "2024-07-10T12:00:00Z".to_string(),
        };
        let mut vdb = VerticaDB::default();
        vdb.metadata.annotations = Some(
            [(
                ADMIN_INTENT_ANNOTATION.to_string(),
                serde_json::to_string(&intent).unwrap(),
            )]
            .into(),
        );
        assert_eq!(pending(&vdb), Some(intent));
    }

    #[test]
    fn test_pending_absent_or_garbage() {
        let vdb = VerticaDB::default();
        assert_eq!(pending(&vdb), None);

        let mut vdb = VerticaDB::default();
        vdb.metadata.annotations = Some(
            [(ADMIN_INTENT_ANNOTATION.to_string(), "{not json".to_string())].into(),
        );
        assert_eq!(pending(&vdb), None);
    }
}
