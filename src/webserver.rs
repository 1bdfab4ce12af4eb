use crate::mutation::{AdmissionContext, MutationError, ResourceKind};
use crate::secret_store::SecretStore;
use crate::state::WebhookState;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use json_patch::Patch;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app<S: SecretStore + 'static>(state: Arc<WebhookState<S>>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/mutate", post(mutate_handler::<S>))
        .with_state(state)
}

async fn mutate_handler<S: SecretStore + 'static>(
    State(state): State<Arc<WebhookState<S>>>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> =
        match serde_json::from_slice::<AdmissionReview<DynamicObject>>(&body)
            .map_err(|e| e.to_string())
            .and_then(|review| review.try_into().map_err(|e| format!("{}", e)))
        {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to parse admission review");
                return Json(AdmissionResponse::invalid(e).into_review());
            }
        };

    Json(review_request(&state, &request).await.into_review())
}

async fn review_request<S: SecretStore>(
    state: &WebhookState<S>,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let context = match admission_context(request) {
        Ok(context) => context,
        Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
    };

    match state.mutator.mutate(&context).await {
        Ok(Some(patch)) if !patch.0.is_empty() => {
            info!(
                uid = %request.uid,
                namespace = %context.namespace,
                operations = patch.0.len(),
                "Patching pod"
            );
            admission_response(request, patch)
        }
        Ok(_) => AdmissionResponse::from(request),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Rejecting malformed pod");
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

/// Attaches the patch. A patch that cannot be serialized admits the pod unchanged.
fn admission_response(
    request: &AdmissionRequest<DynamicObject>,
    patch: Patch,
) -> AdmissionResponse {
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(
                uid = %request.uid,
                error = %e,
                "Failed to serialize patch, admitting pod unchanged"
            );
            AdmissionResponse::from(request)
        }
    }
}

fn admission_context(
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionContext, MutationError> {
    let object = request
        .object
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    Ok(AdmissionContext {
        namespace: request.namespace.clone().unwrap_or_default(),
        resource: ResourceKind {
            group: request.resource.group.clone(),
            version: request.resource.version.clone(),
            resource: request.resource.resource.clone(),
        },
        object,
        dry_run: request.dry_run,
    })
}
