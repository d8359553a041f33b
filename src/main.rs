pub mod admin;
pub mod auth;
pub mod config;
pub mod err;
pub mod extract;
pub mod google;
pub mod google_auth;
pub mod lifecycle;
pub mod materials;
pub mod models;
pub mod requests;
pub mod reviews;
pub mod sessions;
pub mod support;

use std::sync::Arc;

use anyhow::Context;
use axum::handler::Handler;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::err::{Error, Success};
use crate::google::{GoogleCalendar, GoogleOAuth, Integrations};

pub type Payload<T> = axum::response::Result<Json<Success<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Success::of(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Err(err)
}

pub fn router(pg: PgPool, config: Arc<Config>, google: Integrations) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register_user))
        .route("/auth/login", post(auth::login_user))
        .route("/auth/logout", post(auth::logout_user))
        .route("/auth/me", get(auth::current_user))
        .route("/auth/google/url", get(google_auth::authorization_url))
        .route("/auth/google/callback", get(google_auth::oauth_callback))
        .route("/auth/google/status", get(google_auth::connection_status))
        .route("/auth/google/refresh", post(google_auth::refresh_token))
        .route("/auth/google/disconnect", post(google_auth::disconnect))
        .route(
            "/smart-quad/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/smart-quad/sessions/:id", get(sessions::get_session))
        .route(
            "/smart-quad/sessions/:id/enroll",
            post(sessions::enroll).delete(sessions::unenroll),
        )
        .route("/smart-quad/sessions/:id/cancel", post(sessions::cancel_session))
        .route("/smart-quad/my-sessions", get(sessions::my_sessions))
        .route("/session-requests", post(requests::create_request))
        .route("/session-requests/mine", get(requests::my_requests))
        .route("/session-requests/:id/cancel", post(requests::cancel_own_request))
        .route("/admin/session-requests", get(requests::list_requests))
        .route("/admin/session-requests/:id/assign", post(requests::assign_request))
        .route("/admin/session-requests/:id/approve", post(requests::approve_request))
        .route("/admin/session-requests/:id/reject", post(requests::reject_request))
        .route("/admin/session-requests/:id/cancel", post(requests::admin_cancel_request))
        .route("/admin/session-requests/:id/complete", post(requests::complete_request))
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/:id/role", post(admin::change_role))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/support/tickets", get(support::all_tickets))
        .route("/admin/support/tickets/:id", post(support::update_ticket))
        .route(
            "/materials",
            get(materials::list_materials).post(materials::create_material),
        )
        .route("/materials/:id", delete(materials::delete_material))
        .route("/reviews", post(reviews::create_review))
        .route("/reviews/tutor/:id", get(reviews::tutor_reviews))
        .route("/reviews/:id", delete(reviews::delete_review))
        .route(
            "/support/tickets",
            get(support::my_tickets).post(support::open_ticket),
        )
        .fallback(err::handler404.into_service())
        .layer(Extension(pg))
        .layer(Extension(config))
        .layer(Extension(google))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Arc::new(Config::from_env()?);

    let pg = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Could not connect to the database")?;
    sqlx::migrate!("./migrations")
        .run(&pg)
        .await
        .context("Could not run database migrations")?;

    let google = Integrations {
        oauth: Arc::new(GoogleOAuth::new(config.google.clone())),
        calendar: Arc::new(GoogleCalendar::new()),
    };
    let app = router(pg, config.clone(), google);

    log::info!("Starting ScoreSmart HTTP Server on http://{}", config.bind_addr);
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use tower::ServiceExt;

    /// Router over a pool that never connects; only routes that answer
    /// before touching the database can be exercised here.
    fn app() -> Router {
        let config = Arc::new(Config::for_tests());
        let pg = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let google = Integrations {
            oauth: Arc::new(GoogleOAuth::new(config.google.clone())),
            calendar: Arc::new(GoogleCalendar::new()),
        };
        router(pg, config, google)
    }

    async fn send(request: Request<Body>) -> Response {
        app().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unknown_paths_answer_with_json_404() {
        let response = send(get("/does/not/exist")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "NotFound");
        assert_eq!(body["message"], "Invalid path: /does/not/exist");
    }

    #[tokio::test]
    async fn protected_routes_require_a_bearer_token() {
        for uri in ["/auth/me", "/smart-quad/my-sessions", "/admin/stats", "/materials"] {
            let response = send(get(uri)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
            let body = json_body(response).await;
            assert_eq!(body["error"], "AuthenticationFailure");
        }
    }

    #[tokio::test]
    async fn non_bearer_authorization_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/smart-quad/sessions")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_json_answers_with_invalid_payload() {
        let request = Request::builder()
            .method("POST")
            .uri("/auth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email": 5"#))
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "InvalidPayload");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn wrong_json_shape_answers_with_invalid_payload() {
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email": "a@b.test"}"#))
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "InvalidPayload");
    }

    #[tokio::test]
    async fn denied_consent_redirects_to_dashboard_with_error() {
        let response = send(get("/auth/google/callback?error=access_denied")).await;
        assert!(response.status().is_redirection());
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://frontend.test/dashboard?google=error&reason=access_denied"
        );
    }

    #[tokio::test]
    async fn unexpected_consent_errors_are_not_echoed() {
        let response = send(get("/auth/google/callback?error=%3Cb%3Eoops%3C%2Fb%3E")).await;
        assert!(response.status().is_redirection());
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://frontend.test/dashboard?google=error&reason=consent_failed"
        );
    }

    #[tokio::test]
    async fn callback_without_code_redirects_with_error() {
        let response = send(get("/auth/google/callback")).await;
        assert!(response.status().is_redirection());
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://frontend.test/dashboard?google=error&reason=missing_code"
        );
    }
}
