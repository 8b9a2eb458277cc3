use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

use symlookup_service::symbolication::SymbolicationError;

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: err.into(),
        }
    }
}

impl From<SymbolicationError> for ResponseError {
    fn from(err: SymbolicationError) -> Self {
        let status = match err {
            SymbolicationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SymbolicationError::StoreUnavailable(_) | SymbolicationError::Overloaded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
