//! Defaulting webhook for VerticaDB: fills image, subcluster type, service
//! type and request size when omitted, as JSON patch operations on the raw
//! object.

use serde_json::{json, Value};

const DEFAULT_IMAGE: &str = "opentext/vertica-k8s:latest";
const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";
const DEFAULT_REQUEST_SIZE: &str = "500Gi";

/// Compute the JSON patch that fills omitted fields on the raw object.
/// Returns `None` when nothing has to change.
pub fn default_vdb(raw: &Value) -> Option<Value> {
    let mut ops = Vec::new();
    let spec = raw.get("spec")?;

    if spec.get("image").is_none() {
        ops.push(json!({"op": "add", "path": "/spec/image", "value": DEFAULT_IMAGE}));
    }

    if let Some(subclusters) = spec.get("subclusters").and_then(Value::as_array) {
        for (i, sc) in subclusters.iter().enumerate() {
            if sc.get("type").is_none() {
                ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/subclusters/{i}/type"),
                    "value": "primary",
                }));
            }
            if sc.get("serviceType").is_none() {
                ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/subclusters/{i}/serviceType"),
                    "value": DEFAULT_SERVICE_TYPE,
                }));
            }
        }
    }

    match spec.get("local") {
        None => {
            ops.push(json!({
                "op": "add",
                "path": "/spec/local",
                "value": {"requestSize": DEFAULT_REQUEST_SIZE},
            }));
        }
        Some(local) if local.get("requestSize").is_none() => {
            ops.push(json!({
                "op": "add",
                "path": "/spec/local/requestSize",
                "value": DEFAULT_REQUEST_SIZE,
            }));
        }
        Some(_) => {}
    }

    if ops.is_empty() {
        None
    } else {
        Some(Value::Array(ops))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_filled() {
        let raw = json!({
            "spec": {
                "communal": {"path": "s3://b/p"},
                "subclusters": [{"name": "main", "size": 3}],
            }
        });
        let patch = default_vdb(&raw).unwrap();
        let ops = patch.as_array().unwrap();
        assert!(ops.iter().any(|op| op["path"] == "/spec/image"));
        assert!(ops
            .iter()
            .any(|op| op["path"] == "/spec/subclusters/0/type" && op["value"] == "primary"));
        assert!(ops
            .iter()
            .any(|op| op["path"] == "/spec/subclusters/0/serviceType"));
        assert!(ops.iter().any(|op| op["path"] == "/spec/local"));
    }

    #[test]
    fn test_no_patch_when_complete() {
        let raw = json!({
            "spec": {
                "image": "opentext/vertica-k8s:24.3.0-0",
                "communal": {"path": "s3://b/p"},
                "local": {"requestSize": "100Gi"},
                "subclusters": [
                    {"name": "main", "size": 3, "type": "primary", "serviceType": "NodePort"},
                ],
            }
        });
        assert!(default_vdb(&raw).is_none());
    }

    #[test]
    fn test_partial_local_defaulted() {
        let raw = json!({
            "spec": {
                "image": "img",
                "communal": {"path": "s3://b/p"},
                "local": {"dataPath": "/fast"},
                "subclusters": [
                    {"name": "main", "size": 3, "type": "primary", "serviceType": "ClusterIP"},
                ],
            }
        });
        let patch = default_vdb(&raw).unwrap();
        assert_eq!(patch.as_array().unwrap().len(), 1);
        assert_eq!(patch[0]["path"], "/spec/local/requestSize");
    }
}
