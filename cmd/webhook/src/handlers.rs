use crate::admission::{AdmissionResponse, AdmissionReview};
use crate::defaulter::default_vdb;
use crate::state::WebhookState;
use crate::validator::{validate_autoscaler, validate_vdb};

use vertiop_autoscaler::crd::VerticaAutoscaler;
use vertiop_operator::vdb::crd::VerticaDB;

use axum::extract::State;
use axum::response::Json;
use serde_json::Value;
use tracing::{debug, warn};

pub async fn validate_verticadb(
    Json(review): Json<AdmissionReview<VerticaDB>>,
) -> Json<AdmissionReview<()>> {
    let Some(request) = &review.request else {
        warn!(msg = "admission review without request");
        return Json(review.response(AdmissionResponse::deny(
            String::new(),
            "missing request",
        )));
    };
    let uid = request.uid.clone();
    let Some(vdb) = &request.object else {
        return Json(review.response(AdmissionResponse::deny(uid, "missing object")));
    };

    debug!(
        msg = "validating VerticaDB",
        operation = request.operation,
        name = vdb.metadata.name.as_deref().unwrap_or("")
    );
    let response = match validate_vdb(vdb, request.old_object.as_ref()) {
        Ok(()) => AdmissionResponse::allow(uid),
        Err(message) => AdmissionResponse::deny(uid, message),
    };
    Json(review.response(response))
}

/// Defaulting runs on the raw object so omitted fields are visible.
pub async fn mutate_verticadb(
    Json(review): Json<AdmissionReview<Value>>,
) -> Json<AdmissionReview<()>> {
    let Some(request) = &review.request else {
        return Json(review.response(AdmissionResponse::deny(
            String::new(),
            "missing request",
        )));
    };
    let uid = request.uid.clone();
    let Some(raw) = &request.object else {
        return Json(review.response(AdmissionResponse::deny(uid, "missing object")));
    };

    let response = match default_vdb(raw) {
        Some(patch) => AdmissionResponse::allow_with_patch(uid, &patch),
        None => AdmissionResponse::allow(uid),
    };
    Json(review.response(response))
}

pub async fn validate_verticaautoscaler(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<VerticaAutoscaler>>,
) -> Json<AdmissionReview<()>> {
    let Some(request) = &review.request else {
        return Json(review.response(AdmissionResponse::deny(
            String::new(),
            "missing request",
        )));
    };
    let uid = request.uid.clone();
    let Some(vas) = &request.object else {
        return Json(review.response(AdmissionResponse::deny(uid, "missing object")));
    };

    let response = match validate_autoscaler(vas, &state.autoscaler_store) {
        Ok(()) => AdmissionResponse::allow(uid),
        Err(message) => AdmissionResponse::deny(uid, message),
    };
    Json(review.response(response))
}
