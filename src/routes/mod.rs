pub mod media;
pub mod public;
pub mod user;

#[cfg(test)]
mod test_app;

use axum::{extract::DefaultBodyLimit, middleware, Router};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{auth, state::AppState};

/// Room for form fields and multipart framing on top of the file size limit.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(public::router())
        .nest("/me", user::router())
        .merge(media::router())
        .nest_service("/static", ServeDir::new("static"))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::session_middleware,
        ))
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
