use std::ops::Add;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Extension;
use chrono::{DateTime, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::extract::Json;
use crate::models::{AuthSession, PublicUser, Role, UserData};
use crate::{breaks, proceeds, Error, Payload};

pub const MIN_PASSWORD_LEN: usize = 8;

/// The caller behind a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require(&self, roles: &[Role]) -> Result<(), Error> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "This action is not available to {:?} accounts",
                self.role
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl<B> FromRequest<B> for AuthUser
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(req.headers())
            .ok_or_else(|| Error::AuthenticationFailure {
                message: "Missing bearer token".to_string(),
            })?
            .to_string();
        let Extension(pg) = Extension::<PgPool>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "ExtensionError",
                message: format!("{:?}", err),
            })?;
        ensure_authenticated(&token, &pg).await
    }
}

pub async fn ensure_authenticated(token: &str, pg: &PgPool) -> Result<AuthUser, Error> {
    let session =
        sqlx::query_as::<_, AuthSession>("SELECT * FROM user_sessions WHERE token = $1 LIMIT 1")
            .bind(token)
            .fetch_optional(pg)
            .await?;

    let session = match session {
        Some(session) => session,
        None => {
            return Err(Error::AuthenticationFailure {
                message: "Invalid session".to_string(),
            })
        }
    };

    if Utc::now().gt(&session.expires_at) {
        sqlx::query("DELETE FROM user_sessions WHERE token = $1")
            .bind(token)
            .execute(pg)
            .await?;
        return Err(Error::AuthenticationFailure {
            message: "Session expired".to_string(),
        });
    }

    let user = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1 LIMIT 1")
        .bind(session.user_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::AuthenticationFailure {
            message: "Session belongs to a deleted user".to_string(),
        })?;

    Ok(AuthUser {
        id: user.id,
        email: user.email,
        name: user.name,
        role: user.role,
    })
}

fn new_session_token() -> String {
    let bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

pub fn validate_registration(body: &RegisterUser) -> Result<(), Error> {
    if body.email.trim().is_empty() || !body.email.contains('@') {
        return Err(Error::invalid("`email` must be a valid address"));
    }
    if body.name.trim().is_empty() {
        return Err(Error::invalid("`name` parameter was empty"));
    }
    if body.password.len() < MIN_PASSWORD_LEN {
        return Err(Error::MissingCredentials {
            message: format!(
                "Password must be at least {} characters long",
                MIN_PASSWORD_LEN
            ),
        });
    }
    if body.role == Some(Role::Admin) {
        return Err(Error::forbidden("Admin accounts cannot be self-registered"));
    }
    Ok(())
}

pub async fn register_user(
    Extension(pg): Extension<PgPool>,
    Json(body): Json<RegisterUser>,
) -> Payload<UserResponse> {
    validate_registration(&body)?;
    let email = body.email.trim().to_lowercase();

    let existing = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE email = $1 LIMIT 1")
        .bind(&email)
        .fetch_optional(&pg)
        .await?;
    if existing.is_some() {
        return breaks(Error::UserAlreadyExists {
            message: "User with provided email already exists!".to_string(),
        });
    }

    let password_hash = Pbkdf2
        .hash_password(body.password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string();

    let user = sqlx::query_as::<_, UserData>(
        "INSERT INTO users (id, email, name, role, password_hash, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&email)
    .bind(body.name.trim())
    .bind(body.role.unwrap_or(Role::Student))
    .bind(password_hash)
    .bind(Utc::now())
    .fetch_one(&pg)
    .await?;

    log::info!("registered {:?} account {}", user.role, user.id);
    proceeds(UserResponse { user: user.into() })
}

pub async fn login_user(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginUser>,
) -> Payload<LoggedInUser> {
    if login.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "`password` parameter was empty".to_string(),
        });
    }

    let user = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE email = $1 LIMIT 1")
        .bind(login.email.trim().to_lowercase())
        .fetch_optional(&pg)
        .await?;

    let user = if let Some(user) = user {
        user
    } else {
        return breaks(Error::AuthenticationFailure {
            message: "Invalid email or password".to_string(),
        });
    };
    let hash = PasswordHash::new(&user.password_hash)?;
    let matches = Pbkdf2
        .verify_password(login.password.as_bytes(), &hash)
        .is_ok();
    if !matches {
        return breaks(Error::AuthenticationFailure {
            message: "Invalid email or password".to_string(),
        });
    }

    let existing_session = sqlx::query_as::<_, AuthSession>(
        "SELECT * FROM user_sessions WHERE user_id = $1 AND expires_at > now() \
         ORDER BY expires_at DESC LIMIT 1",
    )
    .bind(user.id)
    .fetch_optional(&pg)
    .await?;

    if let Some(existing) = existing_session {
        // already authenticated
        return proceeds(LoggedInUser {
            token: existing.token,
            expires_at: existing.expires_at,
            user: user.into(),
        });
    }

    let token = new_session_token();
    let expires_at = Utc::now().add(config.session_ttl);
    let res = sqlx::query("INSERT INTO user_sessions (token, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(&token)
        .bind(user.id)
        .bind(expires_at)
        .execute(&pg)
        .await?;

    if res.rows_affected() < 1 {
        return breaks(Error::InternalError {
            kind: "DatabaseError",
            message: "Could not create session!".to_string(),
        });
    }

    proceeds(LoggedInUser {
        token,
        expires_at,
        user: user.into(),
    })
}

pub async fn logout_user(
    user: AuthUser,
    headers: HeaderMap,
    Extension(pg): Extension<PgPool>,
) -> Payload<LoggedOut> {
    let token = bearer_token(&headers).unwrap_or_default();
    let affected = sqlx::query("DELETE FROM user_sessions WHERE token = $1 AND user_id = $2")
        .bind(token)
        .bind(user.id)
        .execute(&pg)
        .await?;

    proceeds(LoggedOut {
        user_id: user.id,
        drop_success: affected.rows_affected() >= 1,
    })
}

pub async fn current_user(user: AuthUser, Extension(pg): Extension<PgPool>) -> Payload<UserResponse> {
    let data = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(user.id)
        .fetch_one(&pg)
        .await?;
    proceeds(UserResponse { user: data.into() })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedOut {
    pub user_id: Uuid,
    pub drop_success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedInUser {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: PublicUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub user: PublicUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginUser {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUser {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn registration(role: Option<Role>, password: &str) -> RegisterUser {
        RegisterUser {
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            password: password.to_string(),
            role,
        }
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn session_tokens_are_hex_sha256() {
        let token = new_session_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, new_session_token());
    }

    #[test]
    fn registration_rules() {
        assert!(validate_registration(&registration(None, "longenough")).is_ok());
        assert!(validate_registration(&registration(Some(Role::Tutor), "longenough")).is_ok());
        assert!(matches!(
            validate_registration(&registration(None, "short")),
            Err(Error::MissingCredentials { .. })
        ));
        assert!(matches!(
            validate_registration(&registration(Some(Role::Admin), "longenough")),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn role_guard() {
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: "t@example.com".to_string(),
            name: "T".to_string(),
            role: Role::Tutor,
        };
        assert!(user.require(&[Role::Tutor, Role::Admin]).is_ok());
        assert!(matches!(
            user.require(&[Role::Admin]),
            Err(Error::Forbidden { .. })
        ));
        assert!(!user.is_admin());
    }
}
