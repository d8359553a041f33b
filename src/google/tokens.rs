use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{needs_refresh, GoogleApiError, GoogleOAuth, TokenGrant};
use crate::models::UserData;
use crate::Error;

/// Where a user's Google tokens are kept.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_user(&self, user_id: Uuid) -> Result<UserData, Error>;
    async fn store_grant(&self, user_id: Uuid, grant: &TokenGrant) -> Result<(), Error>;
    async fn disconnect(&self, user_id: Uuid) -> Result<(), Error>;
}

/// Something that trades a refresh token for a new grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, GoogleApiError>;
}

#[async_trait]
impl TokenStore for PgPool {
    async fn load_user(&self, user_id: Uuid) -> Result<UserData, Error> {
        sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1 LIMIT 1")
            .bind(user_id)
            .fetch_optional(self)
            .await?
            .ok_or_else(|| Error::UserDoesNotExist {
                message: format!("User with id `{}` does not exist!", user_id),
            })
    }

    async fn store_grant(&self, user_id: Uuid, grant: &TokenGrant) -> Result<(), Error> {
        store_grant(self, user_id, grant).await
    }

    async fn disconnect(&self, user_id: Uuid) -> Result<(), Error> {
        disconnect(self, user_id).await
    }
}

#[async_trait]
impl TokenRefresher for GoogleOAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, GoogleApiError> {
        GoogleOAuth::refresh(self, refresh_token).await
    }
}

/// One lock per user, so refreshes for the same user run one at a time
/// while other users are not held up.
#[derive(Default)]
pub struct RefreshLocks {
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RefreshLocks {
    pub fn for_user(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id).or_default().clone()
    }
}

/// What to do with a user's stored tokens at a given moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStep {
    NotConnected,
    Use(String),
    Refresh(String),
    /// Stale access token and nothing to refresh it with.
    Revoked,
}

pub fn next_step(user: &UserData, now: DateTime<Utc>) -> TokenStep {
    if !user.google_calendar_connected {
        return TokenStep::NotConnected;
    }
    match (&user.google_access_token, needs_refresh(user.google_token_expiry, now)) {
        (Some(token), false) => TokenStep::Use(token.clone()),
        _ => match &user.google_refresh_token {
            Some(refresh_token) => TokenStep::Refresh(refresh_token.clone()),
            None => TokenStep::Revoked,
        },
    }
}

/// Valid access token for `user_id`, refreshing it first when it is stale.
pub async fn access_token_for(
    pg: &PgPool,
    oauth: &GoogleOAuth,
    user_id: Uuid,
) -> Result<String, Error> {
    access_token_with(pg, oauth, &oauth.refresh_locks, user_id).await
}

pub async fn access_token_with(
    store: &dyn TokenStore,
    refresher: &dyn TokenRefresher,
    locks: &RefreshLocks,
    user_id: Uuid,
) -> Result<String, Error> {
    let user = store.load_user(user_id).await?;
    match next_step(&user, Utc::now()) {
        TokenStep::NotConnected => return Err(GoogleApiError::NotConnected.into()),
        TokenStep::Use(token) => return Ok(token),
        TokenStep::Refresh(_) | TokenStep::Revoked => {}
    }

    let lock = locks.for_user(user_id);
    let _guard = lock.lock().await;
    // another request may have refreshed while we waited
    let user = store.load_user(user_id).await?;
    match next_step(&user, Utc::now()) {
        TokenStep::NotConnected => Err(GoogleApiError::NotConnected.into()),
        TokenStep::Use(token) => Ok(token),
        TokenStep::Revoked => {
            store.disconnect(user_id).await?;
            Err(GoogleApiError::AuthExpired.into())
        }
        TokenStep::Refresh(refresh_token) => match refresher.refresh(&refresh_token).await {
            Ok(grant) => {
                store.store_grant(user_id, &grant).await?;
                log::debug!("refreshed Google access token for user {}", user_id);
                Ok(grant.access_token)
            }
            Err(GoogleApiError::AuthExpired) => {
                log::warn!("Google refresh token for user {} was revoked", user_id);
                store.disconnect(user_id).await?;
                Err(GoogleApiError::AuthExpired.into())
            }
            Err(err) => Err(err.into()),
        },
    }
}

/// Like [`access_token_for`] but for best-effort callers: any failure is
/// logged and turned into `None`.
pub async fn try_access_token(pg: &PgPool, oauth: &GoogleOAuth, user_id: Uuid) -> Option<String> {
    match access_token_for(pg, oauth, user_id).await {
        Ok(token) => Some(token),
        Err(err) => {
            log::info!("no usable Google token for user {}: {:?}", user_id, err);
            None
        }
    }
}

/// Persists a grant. A grant without a refresh token keeps the stored one.
pub async fn store_grant(pg: &PgPool, user_id: Uuid, grant: &TokenGrant) -> Result<(), Error> {
    let res = sqlx::query(
        "UPDATE users SET google_access_token = $2, google_token_expiry = $3, \
         google_refresh_token = COALESCE($4, google_refresh_token), \
         google_calendar_connected = TRUE WHERE id = $1",
    )
    .bind(user_id)
    .bind(&grant.access_token)
    .bind(grant.expires_at)
    .bind(&grant.refresh_token)
    .execute(pg)
    .await?;

    if res.rows_affected() < 1 {
        return Err(Error::UserDoesNotExist {
            message: format!("User with id `{}` does not exist!", user_id),
        });
    }
    Ok(())
}

pub async fn disconnect(pg: &PgPool, user_id: Uuid) -> Result<(), Error> {
    sqlx::query(
        "UPDATE users SET google_access_token = NULL, google_refresh_token = NULL, \
         google_token_expiry = NULL, google_calendar_connected = FALSE WHERE id = $1",
    )
    .bind(user_id)
    .execute(pg)
    .await?;
    Ok(())
}
