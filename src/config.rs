use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::error::AppError;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub cookie_secret: String,
    pub signing_secret: String,
    pub signed_url_ttl: Duration,
    pub mapy_cz_api_key: String,
    pub mapy_cz_base_url: String,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://tripmap.db".to_string());
        let listen_addr: SocketAddr = parse_var("APP_LISTEN_ADDR", "127.0.0.1:3000")?;

        let storage_root = env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("storage"));

        let cookie_secret = env::var("COOKIE_SECRET")
            .unwrap_or_else(|_| "change-me-trip-diary-cookie-secret".to_string());
        let signing_secret = env::var("SIGNING_SECRET").unwrap_or_else(|_| cookie_secret.clone());
        let ttl_secs: u64 = parse_var("SIGNED_URL_TTL_SECS", "3600")?;

        let mapy_cz_api_key = env::var("MAPY_CZ_API_KEY").unwrap_or_default();
        let mapy_cz_base_url = env::var("MAPY_CZ_BASE_URL")
            .unwrap_or_else(|_| "https://api.mapy.cz/v1".to_string());

        let max_upload_bytes = match env::var("MAX_UPLOAD_BYTES") {
            Ok(raw) => raw
                .parse()
                .map_err(|err| AppError::Config(format!("invalid MAX_UPLOAD_BYTES: {err}")))?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Self {
            database_url,
            listen_addr,
            storage_root,
            cookie_secret,
            signing_secret,
            signed_url_ttl: Duration::from_secs(ttl_secs),
            mapy_cz_api_key,
            mapy_cz_base_url,
            max_upload_bytes,
        })
    }

    /// Config for tests and tooling that never bind a socket.
    pub fn local(database_url: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            storage_root: storage_root.into(),
            cookie_secret: "local-cookie-secret-with-enough-entropy-for-key-derivation".into(),
            signing_secret: "local-signing-secret".into(),
            signed_url_ttl: Duration::from_secs(3600),
            mapy_cz_api_key: String::new(),
            mapy_cz_base_url: "https://api.mapy.cz/v1".into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|err| AppError::Config(format!("invalid {name}: {err}")))
}
