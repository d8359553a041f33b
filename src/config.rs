use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;
use chrono::Duration;

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub frontend_url: String,
    pub google: GoogleConfig,
    pub session_ttl: Duration,
    pub max_session_minutes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let database_url = env::var("DATABASE_URL").context("`DATABASE_URL` must be set")?;
        let bind_addr = parse_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let frontend_url = env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let google = GoogleConfig {
            client_id: env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: env::var("GOOGLE_REDIRECT_URI").unwrap_or_else(|_| {
                format!("http://{}/auth/google/callback", bind_addr)
            }),
        };
        if google.client_id.is_empty() {
            log::warn!("GOOGLE_CLIENT_ID is not set, calendar integration will be unavailable");
        }

        Ok(Config {
            database_url,
            bind_addr,
            frontend_url,
            google,
            session_ttl: Duration::hours(parse_or("SESSION_TTL_HOURS", 48i64)?),
            max_session_minutes: parse_or("MAX_SESSION_MINUTES", 180i64)?,
        })
    }

    /// Where the OAuth callback sends the browser once it is done.
    pub fn dashboard_redirect(&self, query: &str) -> String {
        format!("{}/dashboard?{}", self.frontend_url, query)
    }
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("`{}` has an invalid value `{}`", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Config {
        Config {
            database_url: "postgres://localhost/scoresmart_test".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            frontend_url: "http://frontend.test".to_string(),
            google: GoogleConfig {
                client_id: "client.apps.googleusercontent.com".to_string(),
                client_secret: "secret".to_string(),
                redirect_uri: "http://api.test/auth/google/callback".to_string(),
            },
            session_ttl: Duration::hours(48),
            max_session_minutes: 180,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_redirect_appends_query() {
        let config = Config::for_tests();
        assert_eq!(
            config.dashboard_redirect("google=connected"),
            "http://frontend.test/dashboard?google=connected"
        );
    }
}
