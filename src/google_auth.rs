//! `/auth/google/*`: connecting a user's Google Calendar.

use std::ops::Add;
use std::sync::Arc;

use axum::response::Redirect;
use axum::Extension;
use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::extract::Query;
use crate::google::{tokens, Integrations};
use crate::models::UserData;
use crate::{proceeds, Payload};

/// How long a consent `state` stays redeemable.
pub const STATE_TTL_MINUTES: i64 = 10;

fn new_state() -> String {
    let bytes: [u8; 24] = thread_rng().gen();
    hex::encode(bytes)
}

pub async fn authorization_url(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
) -> Payload<AuthorizationUrl> {
    let state = new_state();
    let url = google.oauth.authorization_url(&state)?;

    sqlx::query("DELETE FROM google_oauth_states WHERE user_id = $1 OR expires_at < now()")
        .bind(user.id)
        .execute(&pg)
        .await?;
    sqlx::query("INSERT INTO google_oauth_states (state, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(&state)
        .bind(user.id)
        .bind(Utc::now().add(Duration::minutes(STATE_TTL_MINUTES)))
        .execute(&pg)
        .await?;

    proceeds(AuthorizationUrl { url })
}

/// Google redirects the browser here; we always answer with a redirect back
/// to the dashboard so the user never lands on raw JSON.
pub async fn oauth_callback(
    Query(params): Query<CallbackParams>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    Extension(config): Extension<Arc<Config>>,
) -> Redirect {
    match complete_consent(params, &pg, &google).await {
        Ok(user_id) => {
            log::info!("Google Calendar connected for user {}", user_id);
            Redirect::to(&config.dashboard_redirect("google=connected"))
        }
        Err(failure) => {
            log::warn!(
                "Google OAuth callback failed ({}): {}",
                failure.reason,
                failure.detail
            );
            Redirect::to(&config.dashboard_redirect(&failure.query()))
        }
    }
}

/// A failed consent: `reason` is a short code safe to show the browser,
/// `detail` only goes to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentFailure {
    pub reason: String,
    pub detail: String,
}

impl ConsentFailure {
    fn new(reason: &str, detail: impl std::fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Google's own `error` parameter. It arrives in the URL, so only a
    /// plain code such as `access_denied` is passed through.
    pub fn from_provider(error: &str) -> Self {
        let plain = !error.is_empty()
            && error.len() <= 40
            && error.bytes().all(|b| b.is_ascii_lowercase() || b == b'_');
        Self::new(if plain { error } else { "consent_failed" }, error)
    }

    pub fn query(&self) -> String {
        format!("google=error&reason={}", self.reason)
    }
}

async fn complete_consent(
    params: CallbackParams,
    pg: &PgPool,
    google: &Integrations,
) -> Result<Uuid, ConsentFailure> {
    if let Some(error) = params.error {
        return Err(ConsentFailure::from_provider(&error));
    }
    let (code, state) = match (params.code, params.state) {
        (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => (code, state),
        _ => {
            return Err(ConsentFailure::new(
                "missing_code",
                "callback without code or state",
            ))
        }
    };

    let user_id: Option<(Uuid,)> = sqlx::query_as(
        "DELETE FROM google_oauth_states WHERE state = $1 AND expires_at > now() RETURNING user_id",
    )
    .bind(&state)
    .fetch_optional(pg)
    .await
    .map_err(|err| ConsentFailure::new("database_error", err))?;
    let (user_id,) = user_id
        .ok_or_else(|| ConsentFailure::new("invalid_state", "unknown or expired state"))?;

    let grant = google
        .oauth
        .exchange_code(&code)
        .await
        .map_err(|err| ConsentFailure::new("exchange_failed", err))?;
    tokens::store_grant(pg, user_id, &grant)
        .await
        .map_err(|err| ConsentFailure::new("store_failed", format!("{:?}", err)))?;
    Ok(user_id)
}

pub async fn connection_status(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<ConnectionStatus> {
    let data = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(user.id)
        .fetch_one(&pg)
        .await?;
    proceeds(ConnectionStatus {
        connected: data.google_calendar_connected,
        expires_at: data.google_token_expiry,
    })
}

pub async fn disconnect(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<ConnectionStatus> {
    tokens::disconnect(&pg, user.id).await?;
    log::info!("Google Calendar disconnected for user {}", user.id);
    proceeds(ConnectionStatus {
        connected: false,
        expires_at: None,
    })
}

/// Explicit token check used by the dashboard before scheduling.
pub async fn refresh_token(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
) -> Payload<ConnectionStatus> {
    tokens::access_token_for(&pg, &google.oauth, user.id).await?;
    let data = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(user.id)
        .fetch_one(&pg)
        .await?;
    proceeds(ConnectionStatus {
        connected: data.google_calendar_connected,
        expires_at: data.google_token_expiry,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationUrl {
    pub url: String,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
}
