//! OAuth2 authorization-code flow against Google's endpoints.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use url::Url;

use super::tokens::RefreshLocks;
use super::{GoogleApiError, SCOPES};
use crate::config::GoogleConfig;

const AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens handed back by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Only present on the first exchange (or when Google rotates it).
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_grant(self, now: DateTime<Utc>) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + Duration::seconds(self.expires_in.unwrap_or(3600)),
        }
    }
}

pub struct GoogleOAuth {
    config: GoogleConfig,
    http: reqwest::Client,
    /// Serializes refreshes per user inside this process.
    pub(crate) refresh_locks: RefreshLocks,
}

impl GoogleOAuth {
    pub fn new(config: GoogleConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            refresh_locks: RefreshLocks::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.client_secret.is_empty()
    }

    /// Consent URL requesting offline access so a refresh token is issued.
    pub fn authorization_url(&self, state: &str) -> Result<String, GoogleApiError> {
        if !self.is_configured() {
            return Err(GoogleApiError::NotConfigured);
        }
        let mut url = Url::parse(AUTH_URI).map_err(|_| GoogleApiError::NotConfigured)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true")
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, GoogleApiError> {
        if !self.is_configured() {
            return Err(GoogleApiError::NotConfigured);
        }
        let resp = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GoogleApiError::ExchangeFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }
        let body: TokenResponse = resp.json().await?;
        Ok(body.into_grant(Utc::now()))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, GoogleApiError> {
        if !self.is_configured() {
            return Err(GoogleApiError::NotConfigured);
        }
        let resp = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_refresh_error(status.as_u16(), &body));
        }
        let body: TokenResponse = resp.json().await?;
        Ok(body.into_grant(Utc::now()))
    }
}

fn map_refresh_error(status: u16, body: &str) -> GoogleApiError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return GoogleApiError::AuthExpired;
    }
    GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
}
