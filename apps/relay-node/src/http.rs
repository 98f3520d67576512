use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use relay_dispatch::WebhookReconciler;
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, debug, info_span, warn};

#[derive(Clone)]
pub struct NodeState {
    pub reconciler: Arc<WebhookReconciler>,
}

#[derive(Serialize, Debug)]
pub struct Ack {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn build_router(state: NodeState) -> Router {
    Router::new()
        .route("/webhooks/{channel}/{external_id}", post(receive_webhook))
        .route("/healthz", get(healthz))
        .layer(Extension(Arc::new(state)))
}

/// Acknowledges the provider at once and reconciles in a background task.
#[debug_handler]
async fn receive_webhook(
    Path((channel, external_id)): Path<(String, String)>,
    Extension(state): Extension<Arc<NodeState>>,
    body: Bytes,
) -> (StatusCode, Json<Ack>) {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%channel, %external_id, error = %err, "webhook body is not json");
            return (
                StatusCode::BAD_REQUEST,
                Json(Ack {
                    ok: false,
                    error: Some(format!("invalid json: {err}")),
                }),
            );
        }
    };

    let span = info_span!("webhook_ingress", channel = %channel, external_id = %external_id);
    let reconciler = Arc::clone(&state.reconciler);
    tokio::spawn(
        async move {
            match reconciler.handle_raw(&channel, &external_id, &raw).await {
                Ok(outcome) => debug!(?outcome, "webhook reconciled"),
                Err(err) => warn!(error = %err, code = err.code(), "webhook reconcile failed"),
            }
        }
        .instrument(span),
    );

    (
        StatusCode::ACCEPTED,
        Json(Ack {
            ok: true,
            error: None,
        }),
    )
}

async fn healthz() -> Json<Ack> {
    Json(Ack {
        ok: true,
        error: None,
    })
}
