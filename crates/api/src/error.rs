use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use index::StoreError;
use ingest::ReadError;
use pipeline::{IngestError, QueryError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Ingest(IngestError::Busy) => StatusCode::CONFLICT,
            Self::Ingest(IngestError::Read(ReadError::Io { .. })) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Ingest(IngestError::Read(_) | IngestError::NoText(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Ingest(IngestError::Store(_) | IngestError::Index(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Query(QueryError::NotReady) => StatusCode::CONFLICT,
            Self::Query(QueryError::EmptyQuestion) => StatusCode::BAD_REQUEST,
            Self::Query(QueryError::Planning(_) | QueryError::Execution { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Query(QueryError::Synthesis(_)) => StatusCode::BAD_GATEWAY,
            Self::Query(QueryError::Store(_) | QueryError::Index(_)) | Self::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), %message, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), %message, "request rejected");
        }

        let generated_query = match &self {
            Self::Query(e) => e.generated_query().map(str::to_string),
            _ => None,
        };

        let body = Json(json!({
            "error": {
                "status": status.as_u16(),
                "message": message,
                "generated_query": generated_query,
            }
        }));
        (status, body).into_response()
    }
}
