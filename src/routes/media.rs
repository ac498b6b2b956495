use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::{error::AppError, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/media/:bucket/*key", get(serve_object))
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    sig: String,
}

/// Serves a stored object to anyone holding a valid, unexpired signed URL.
async fn serve_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response<Body>, AppError> {
    state.storage.signer().verify(
        &bucket,
        &key,
        query.expires,
        &query.sig,
        Utc::now().timestamp(),
    )?;

    let data = state.storage.read_object(&bucket, &key).await?;
    let mime = mime_guess::from_path(&key).first_or_octet_stream();
    debug!(bucket = %bucket, key = %key, bytes = data.len(), "serving object");

    Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CACHE_CONTROL, "private, max-age=3600")
        .body(Body::from(data))
        .map_err(|err| AppError::Other(err.into()))
}
