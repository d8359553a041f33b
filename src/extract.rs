//! Request extractors that reject with the crate's JSON [`Error`] instead of
//! axum's plain-text rejections.

use async_trait::async_trait;
use axum::body::HttpBody;
use axum::extract::{FromRequest, RequestParts};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::BoxError;
use serde::de::DeserializeOwned;

use crate::Error;

fn rejected(rejection: impl std::fmt::Display) -> Error {
    Error::invalid(rejection.to_string())
}

/// JSON request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Json<T>
where
    T: DeserializeOwned,
    B: HttpBody + Send,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req)
            .await
            .map_err(rejected)?;
        Ok(Json(value))
    }
}

/// JSON body that may be left out entirely. A request with no body and no
/// content type yields `None`; anything else has to parse.
#[derive(Debug, Clone, Default)]
pub struct OptionalJson<T>(pub Option<T>);

fn has_no_body<B>(req: &RequestParts<B>) -> bool {
    let headers = req.headers();
    let empty_length = match headers.get(CONTENT_LENGTH) {
        Some(length) => length.as_bytes() == b"0",
        None => true,
    };
    !headers.contains_key(CONTENT_TYPE) && empty_length
}

#[async_trait]
impl<T, B> FromRequest<B> for OptionalJson<T>
where
    T: DeserializeOwned,
    B: HttpBody + Send,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        if has_no_body(req) {
            return Ok(OptionalJson(None));
        }
        let Json(value) = Json::<T>::from_request(req).await?;
        Ok(OptionalJson(Some(value)))
    }
}

/// Typed path segments.
#[derive(Debug, Clone, Copy)]
pub struct Path<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Path<T>
where
    T: DeserializeOwned + Send,
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let axum::extract::Path(value) = axum::extract::Path::<T>::from_request(req)
            .await
            .map_err(rejected)?;
        Ok(Path(value))
    }
}

/// Query string parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Query<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Query<T>
where
    T: DeserializeOwned,
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) = axum::extract::Query::<T>::from_request(req)
            .await
            .map_err(rejected)?;
        Ok(Query(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use serde::Deserialize;
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct Note {
        text: String,
    }

    #[derive(Debug, Deserialize)]
    struct Filter {
        limit: Option<u32>,
    }

    fn parts(request: Request<Body>) -> RequestParts<Body> {
        RequestParts::new(request)
    }

    fn json_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn malformed_json_is_an_invalid_payload() {
        let mut req = parts(json_request(r#"{"text": 5"#));
        let err = Json::<Note>::from_request(&mut req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn json_without_content_type_is_an_invalid_payload() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(r#"{"text": "hi"}"#))
            .unwrap();
        let err = Json::<Note>::from_request(&mut parts(request))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn well_formed_json_is_extracted() {
        let Json(note) = Json::<Note>::from_request(&mut parts(json_request(r#"{"text": "hi"}"#)))
            .await
            .unwrap();
        assert_eq!(note.text, "hi");
    }

    #[tokio::test]
    async fn absent_optional_body_is_none() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let OptionalJson(note) = OptionalJson::<Note>::from_request(&mut parts(request))
            .await
            .unwrap();
        assert!(note.is_none());
    }

    #[tokio::test]
    async fn malformed_optional_body_is_rejected() {
        let err = OptionalJson::<Note>::from_request(&mut parts(json_request("{oops")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn present_optional_body_is_parsed() {
        let OptionalJson(note) =
            OptionalJson::<Note>::from_request(&mut parts(json_request(r#"{"text": "late"}"#)))
                .await
                .unwrap();
        assert_eq!(note.unwrap().text, "late");
    }

    #[tokio::test]
    async fn query_is_extracted() {
        let request = Request::builder()
            .uri("/?limit=3")
            .body(Body::empty())
            .unwrap();
        let Query(filter) = Query::<Filter>::from_request(&mut parts(request))
            .await
            .unwrap();
        assert_eq!(filter.limit, Some(3));
    }

    #[tokio::test]
    async fn bad_query_is_an_invalid_payload() {
        let request = Request::builder()
            .uri("/?limit=many")
            .body(Body::empty())
            .unwrap();
        let err = Query::<Filter>::from_request(&mut parts(request))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn routed_extractors_answer_with_json_errors() {
        let app = Router::new()
            .route(
                "/items/:id",
                get(|Path(id): Path<Uuid>| async move { id.to_string() }),
            )
            .route(
                "/notes",
                post(|Json(note): Json<Note>| async move { note.text }),
            );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/items/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "InvalidPayload");

        let notes = Request::builder()
            .method("POST")
            .uri("/notes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("[1, 2"))
            .unwrap();
        let response = app.oneshot(notes).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "InvalidPayload");
    }
}
