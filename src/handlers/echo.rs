use axum::Json;
use axum::extract::Request;
use tracing::instrument;

use crate::middleware::{RequestIdExt, ValidatedJson};
use crate::models::{EchoResponse, Principal, describe_user};

/// Fallback for every path without its own route.
///
/// Reports what the pipeline attached to the request: the caller, the request
/// ID and the cleaned JSON payload.
#[instrument(skip(request), fields(path = %request.uri().path()))]
pub async fn echo(request: Request) -> Json<EchoResponse> {
    Json(EchoResponse {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        user: describe_user(request.extensions().get::<Principal>()),
        request_id: request.request_id().map(str::to_string),
        payload: request
            .extensions()
            .get::<ValidatedJson>()
            .map(|ValidatedJson(v)| v.clone()),
    })
}
