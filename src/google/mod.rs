//! Google OAuth2 and Calendar v3 over plain HTTP.
//!
//! - oauth: consent URL, code exchange, refresh grant
//! - calendar: event create/update/delete with a Meet conference
//! - tokens: stored-token freshness and refresh for a user

pub mod calendar;
pub mod oauth;
pub mod tokens;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

pub use calendar::{CalendarProvider, EventDraft, GoogleCalendar, PublishedEvent};
pub use oauth::{GoogleOAuth, TokenGrant};

/// Google collaborators shared by every handler through an `Extension`.
#[derive(Clone)]
pub struct Integrations {
    pub oauth: Arc<GoogleOAuth>,
    pub calendar: Arc<dyn CalendarProvider>,
}

pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar.events",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Tokens this close to expiry are treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Google Calendar is not connected")]
    NotConnected,
    #[error("Google OAuth is not configured")]
    NotConfigured,
    #[error("Token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
}

/// Whether a stored access token must be refreshed before use.
///
/// A missing expiry counts as expired.
pub fn needs_refresh(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        None => true,
        Some(expiry) => expiry <= now + Duration::seconds(EXPIRY_SKEW_SECS),
    }
}
