//! Router harness over a migrated SQLite file in a temp dir.

use axum::{
    body::{to_bytes, Body},
    http::{header, Request},
    response::Response,
    Router,
};
use tempfile::TempDir;
use tower::ServiceExt;

use super::create_router;
use crate::{
    auth::SESSION_COOKIE,
    config::AppConfig,
    db::{init_pool, run_migrations},
    state::AppState,
};

pub const BOUNDARY: &str = "tripmap-test-boundary";

pub struct TestApp {
    router: Router,
    _root: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::configured(|_| {}).await
    }

    pub async fn with_max_upload(max_upload_bytes: usize) -> Self {
        Self::configured(|config| config.max_upload_bytes = max_upload_bytes).await
    }

    async fn configured(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let root = TempDir::new().unwrap();
        let database_url = format!("sqlite://{}", root.path().join("app.sqlite").display());
        let mut config = AppConfig::local(database_url, root.path().join("storage"));
        tweak(&mut config);

        let db = init_pool(&config.database_url).await.unwrap();
        run_migrations(&db).await.unwrap();
        let state = AppState::new(config, db);
        state.storage.ensure_structure().await.unwrap();
        Self {
            router: create_router(state),
            _root: root,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::get(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    pub async fn post_form(&self, uri: &str, form: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        self.send(request.body(Body::from(form.to_string())).unwrap())
            .await
    }

    pub async fn post_multipart(&self, uri: &str, body: Vec<u8>, cookie: &str) -> Response {
        let request = Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::COOKIE, cookie)
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    /// Registers `username` and returns the `Cookie` header for its session.
    pub async fn register(&self, username: &str) -> String {
        let form = format!(
            "username={username}&email={username}%40example.org\
             &password=correct-horse&password_confirm=correct-horse"
        );
        let response = self.post_form("/register", &form, None).await;
        session_cookie(&response).expect("registration sets a session cookie")
    }
}

/// The `name=value` part of the session `Set-Cookie` header.
pub fn session_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{SESSION_COOKIE}=")))
        .and_then(|value| value.split(';').next())
        .map(str::to_string)
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn multipart_body(texts: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in texts {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (name, file_name, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}
