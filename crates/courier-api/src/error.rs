use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use courier_types::api::{ErrorBody, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(StoreError),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Store contract failures travel inside `anyhow::Error`; everything else is internal.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<StoreError>() {
            Some(store) => Self::Store(store.clone()),
            None => Self::Internal(e),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Store(StoreError::Unauthorized(_)) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(StoreError::NotFound(_)) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Store(
                StoreError::Unauthorized(m)
                | StoreError::NotFound(m)
                | StoreError::Invalid(m)
                | StoreError::Unavailable(m),
            ) => m.clone(),
            Self::Forbidden(m) | Self::NotFound(m) => m.clone(),
            Self::Internal(e) => {
                error!("Request failed: {:#}", e);
                "Server error".into()
            }
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_survive_anyhow() {
        let wrapped: anyhow::Error = StoreError::NotFound("receiver not found".into()).into();
        let api = ApiError::from(wrapped);
        assert_eq!(api.status(), StatusCode::NOT_FOUND);

        let api = ApiError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn contract_failures_map_to_status_codes() {
        let cases = [
            (StoreError::Unauthorized("x".into()), StatusCode::FORBIDDEN),
            (StoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StoreError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
