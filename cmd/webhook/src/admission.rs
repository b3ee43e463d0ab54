use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize)]
pub struct AdmissionReview<T> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest<T>>,
    pub response: Option<AdmissionResponse>,
}

#[derive(Deserialize, Serialize)]
pub struct AdmissionRequest<T> {
    pub uid: String,
    pub operation: String,
    pub object: Option<T>,
    #[serde(rename = "oldObject")]
    pub old_object: Option<T>,
}

#[derive(Deserialize, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(rename = "patchType", skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    /// Base64 encoded JSON patch, set by the defaulter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Deserialize, Serialize)]
pub struct Status {
    pub message: String,
}

impl AdmissionResponse {
    pub fn allow(uid: String) -> Self {
        Self {
            uid,
            allowed: true,
            status: None,
            patch_type: None,
            patch: None,
        }
    }

    pub fn deny(uid: String, message: impl Into<String>) -> Self {
        Self {
            uid,
            allowed: false,
            status: Some(Status {
                message: message.into(),
            }),
            patch_type: None,
            patch: None,
        }
    }

    /// Allow with a JSON patch applying the defaults.
    pub fn allow_with_patch(uid: String, patch_ops: &serde_json::Value) -> Self {
        Self {
            uid,
            allowed: true,
            status: None,
            patch_type: Some("JSONPatch".to_string()),
            // safe unwrap: patch ops are always serializable
            patch: Some(STANDARD.encode(serde_json::to_vec(patch_ops).unwrap())),
        }
    }
}

impl<T> AdmissionReview<T> {
    pub fn response(self, response: AdmissionResponse) -> AdmissionReview<()> {
        AdmissionReview {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            request: None,
            response: Some(response),
        }
    }
}
