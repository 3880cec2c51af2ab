use etude_core::Response;
use etude_pool::PoolError;
use thiserror::Error;
use tracing::{error, warn};

use crate::store::StoreError;

/// Everything a route handler can fail with.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Store unavailable: {0}")]
    Unavailable(PoolError<StoreError>),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PoolError<StoreError>> for AppError {
    fn from(e: PoolError<StoreError>) -> Self {
        match e {
            PoolError::Backend(inner) => AppError::Store(inner),
            other => AppError::Unavailable(other),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Store(StoreError::UserExists(_)) => 400,
            AppError::Unauthorized => 401,
            AppError::NotFound => 404,
            AppError::Unavailable(_) => 503,
            AppError::Store(_) | AppError::Hash(_) | AppError::Json(_) => 500,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            500 => error!(error = %self, "request failed"),
            503 => warn!(error = %self, "store unavailable"),
            _ => {}
        }
        let message = match &self {
            AppError::BadRequest(msg) => (*msg).to_string(),
            AppError::Store(StoreError::UserExists(_)) => "Register Failed!".to_string(),
            AppError::Unauthorized => "Login Failed!".to_string(),
            AppError::NotFound => "Not Found".to_string(),
            AppError::Unavailable(_) => "Service Unavailable".to_string(),
            _ => "Internal Server Error".to_string(),
        };
        Response::error(status, message)
    }
}

pub type AppResult<T> = Result<T, AppError>;
