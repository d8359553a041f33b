use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

use crate::google::GoogleApiError;
use crate::lifecycle::TransitionError;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound { message: String },
    InvalidPayload { message: String },
    MissingCredentials { message: String },
    AuthenticationFailure { message: String },
    Forbidden { message: String },
    UserAlreadyExists { message: String },
    UserDoesNotExist { message: String },
    InvalidTransition { message: String },
    SessionFull { message: String },
    Conflict { message: String },
    CalendarNotConnected { message: String },
    UpstreamError { message: String },
    InternalError { kind: &'static str, message: String },
    Unknown { message: String },
}

impl Error {
    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Error {
        Error::Forbidden {
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } | Error::UserDoesNotExist { .. } => StatusCode::NOT_FOUND,
            Error::InvalidPayload { .. } | Error::MissingCredentials { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::AuthenticationFailure { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::UserAlreadyExists { .. }
            | Error::InvalidTransition { .. }
            | Error::SessionFull { .. }
            | Error::Conflict { .. }
            | Error::CalendarNotConnected { .. } => StatusCode::CONFLICT,
            Error::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            Error::InternalError { .. } | Error::Unknown { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{:?}", self);
        }
        (status, Json(self)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                message: "Requested row does not exist".to_string(),
            },
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                Self::Conflict {
                    message: db.message().to_string(),
                }
            }
            other => Self::InternalError {
                kind: "DatabaseError",
                message: other.to_string(),
            },
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::InternalError {
            kind: "PasswordHashError",
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InvalidPayload {
            message: id.to_string(),
        }
    }
}

impl From<TransitionError> for Error {
    fn from(err: TransitionError) -> Self {
        Self::InvalidTransition {
            message: err.to_string(),
        }
    }
}

impl From<GoogleApiError> for Error {
    fn from(err: GoogleApiError) -> Self {
        match err {
            GoogleApiError::AuthExpired => Self::CalendarNotConnected {
                message: "Google authorization expired or was revoked".to_string(),
            },
            GoogleApiError::NotConnected => Self::CalendarNotConnected {
                message: "Google Calendar is not connected".to_string(),
            },
            other => Self::UpstreamError {
                message: other.to_string(),
            },
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}
