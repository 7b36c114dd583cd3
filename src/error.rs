use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid HTTP signature: {0}")]
    SignatureFailure(String),

    #[error("invalid uri: {uri}")]
    InvalidUri { uri: String },

    #[error("invalid JSON from {uri}: {raw}")]
    InvalidJson { uri: String, raw: String },

    #[error("malformed webfinger resource: {resource}")]
    MalformedWebfingerResource { resource: String },

    #[error("malformed webfinger uri: {uri}")]
    MalformedWebfingerUri { uri: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    Conflict { what: String },

    #[error("unknown config key: {key}")]
    UnknownConfigKey { key: String },

    #[error("invalid value for config key {key}: {value}")]
    InvalidConfigValue { key: String, value: String },

    #[error("more than one row was modified")]
    TooManyRows,

    #[error("{message}")]
    StatusAndMessage {
        status: StatusCode,
        message: &'static str,
    },

    #[error("key error: {0}")]
    Key(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Postgres(#[from] postgres::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureFailure(reason.into())
    }

    pub fn key(reason: impl Into<String>) -> Self {
        Self::Key(reason.into())
    }

    fn status(&self) -> StatusCode {
        use Error::*;

        match self {
            MissingSignature
            | InvalidUri { .. }
            | InvalidJson { .. }
            | MalformedWebfingerResource { .. }
            | MalformedWebfingerUri { .. }
            | UnknownConfigKey { .. }
            | InvalidConfigValue { .. }
            | Conflict { .. }
            | Key(_) => StatusCode::BAD_REQUEST,

            SignatureFailure(_) => StatusCode::UNAUTHORIZED,
            NotFound { .. } => StatusCode::NOT_FOUND,
            StatusAndMessage { status, .. } => *status,

            TooManyRows | Sqlite(_) | Postgres(_) | Redis(_) | Io(_) | Yaml(_) | Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs rather than the response body
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error=%self, "internal server error");
            "internal server error".to_owned()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
