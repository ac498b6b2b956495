use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{session::Session, user::User},
    state::AppState,
};

pub const SESSION_COOKIE: &str = "tripmap_session";
pub const SESSION_DAYS: i64 = 30;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 32;
pub const PASSWORD_MIN: usize = 8;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: i64,
    pub uuid: String,
    pub username: String,
}

impl From<User> for AuthenticatedUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            uuid: user.uuid,
            username: user.username,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<AuthenticatedUser>);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthenticatedUser>().cloned()))
    }
}

impl CurrentUser {
    pub fn require_user(&self) -> Result<&AuthenticatedUser, AppError> {
        self.0.as_ref().ok_or(AppError::Unauthorized)
    }
}

pub async fn register_user(
    state: &AppState,
    username: &str,
    email: &str,
    password: &str,
) -> Result<AuthenticatedUser, AppError> {
    let username = validate_username(username)?;
    let email = validate_email(email)?;
    validate_password(password)?;

    let taken: Option<i64> =
        sqlx::query_scalar("SELECT id FROM users WHERE username = ? OR email = ? LIMIT 1")
            .bind(&username)
            .bind(&email)
            .fetch_optional(&state.db)
            .await?;
    if taken.is_some() {
        return Err(AppError::BadRequest(
            "That username or email is already registered".into(),
        ));
    }

    let password_hash = hash_password(password)?;
    let uuid = Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO users (uuid, username, email, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&uuid)
    .bind(&username)
    .bind(&email)
    .bind(&password_hash)
    .bind(Utc::now())
    .execute(&state.db)
    .await;

    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            return Err(AppError::BadRequest(
                "That username or email is already registered".into(),
            ));
        }
        Err(err) => return Err(err.into()),
    };

    info!(user = %username, "registered user");
    Ok(AuthenticatedUser { id, uuid, username })
}

/// Looks the user up by username or email and checks the password.
pub async fn authenticate_user(
    state: &AppState,
    identifier: &str,
    password: &str,
) -> Result<AuthenticatedUser, AppError> {
    let identifier = identifier.trim();
    if identifier.is_empty() || password.is_empty() {
        return Err(AppError::BadRequest(
            "Please enter your username and password".into(),
        ));
    }

    let user: Option<User> = sqlx::query_as(
        r#"
        SELECT id, uuid, username, email, password_hash, created_at, last_login_at
        FROM users
        WHERE username = ? OR email = lower(?)
        "#,
    )
    .bind(identifier)
    .bind(identifier)
    .fetch_optional(&state.db)
    .await?;

    let Some(user) = user else {
        debug!("login for unknown identifier");
        return Err(AppError::Unauthorized);
    };
    if !verify_password(password, &user.password_hash) {
        debug!(user = %user.username, "login with wrong password");
        return Err(AppError::Unauthorized);
    }

    sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(user.id)
        .execute(&state.db)
        .await?;

    Ok(user.into())
}

pub async fn create_session(state: &AppState, user_id: i64) -> Result<String, AppError> {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let session_id = hex::encode(raw);

    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, created_at, last_seen_at, expires_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&session_id)
    .bind(user_id)
    .bind(now)
    .bind(now)
    .bind(now + Duration::days(SESSION_DAYS))
    .execute(&state.db)
    .await?;

    Ok(session_id)
}

pub async fn destroy_session(state: &AppState, session_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(session_id)
        .execute(&state.db)
        .await?;
    Ok(())
}

/// Resolves a session token to its user. Expired sessions are removed.
pub async fn user_for_session(
    state: &AppState,
    session_id: &str,
) -> Result<Option<AuthenticatedUser>, AppError> {
    let session: Option<Session> = sqlx::query_as(
        "SELECT id, user_id, created_at, last_seen_at, expires_at FROM sessions WHERE id = ?",
    )
    .bind(session_id)
    .fetch_optional(&state.db)
    .await?;
    let Some(session) = session else {
        return Ok(None);
    };

    let now = Utc::now();
    if session.is_expired(now) {
        debug!(user_id = session.user_id, "session expired");
        destroy_session(state, &session.id).await?;
        return Ok(None);
    }

    sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE id = ?")
        .bind(now)
        .bind(&session.id)
        .execute(&state.db)
        .await?;

    let user: Option<User> = sqlx::query_as(
        "SELECT id, uuid, username, email, password_hash, created_at, last_login_at FROM users WHERE id = ?",
    )
    .bind(session.user_id)
    .fetch_optional(&state.db)
    .await?;
    Ok(user.map(AuthenticatedUser::from))
}

/// Places the session's user into request extensions for `CurrentUser`.
pub async fn session_middleware(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        match user_for_session(&state, cookie.value()).await {
            Ok(Some(user)) => {
                request.extensions_mut().insert(user);
            }
            Ok(None) => {}
            Err(err) => warn!("failed to resolve session: {err}"),
        }
    }
    next.run(request).await
}

pub fn apply_session_cookie(jar: PrivateCookieJar, session_id: &str) -> PrivateCookieJar {
    let cookie = Cookie::build((SESSION_COOKIE, session_id.to_owned()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();
    jar.add(cookie)
}

pub fn clear_session_cookie(jar: PrivateCookieJar) -> PrivateCookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::Other(anyhow!("password hashing failed: {err}")))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!("stored password hash is unreadable: {err}");
            false
        }
    }
}

pub fn validate_username(raw: &str) -> Result<String, AppError> {
    let username = raw.trim();
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(AppError::BadRequest(format!(
            "Username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(AppError::BadRequest(
            "Username must not contain spaces".into(),
        ));
    }
    Ok(username.to_string())
}

pub fn validate_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    let plausible = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !plausible {
        return Err(AppError::BadRequest("Please enter a valid email address".into()));
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < PASSWORD_MIN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {PASSWORD_MIN} characters"
        )));
    }
    Ok(())
}
