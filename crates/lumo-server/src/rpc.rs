use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

use lumo_core::contract::{ErrorCode, RpcError, Validate, ValidationError};
use lumo_core::errors::GatewayError;
use lumo_store::StoreError;

/// A procedure failure, rendered as the common error envelope with the
/// matching HTTP status.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub RpcError);

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        self.0.code
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self(e.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self(RpcError::not_found()),
            other => {
                // Storage detail stays in the log; clients get the generic message.
                tracing::error!(error = %other, "store failure");
                Self(RpcError::new(ErrorCode::InternalError))
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(gateway_rpc_error(&e))
    }
}

/// The envelope a client sees for an upstream failure.
pub fn gateway_rpc_error(e: &GatewayError) -> RpcError {
    RpcError::with_message(e.error_code(), e.to_string())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

/// Decode and validate a procedure input. An empty body reads as `{}`.
pub fn parse_input<T>(body: &[u8]) -> Result<T, ApiError>
where
    T: DeserializeOwned + Validate,
{
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    let input: T = serde_json::from_slice(body)
        .map_err(|e| RpcError::bad_request(format!("Invalid input: {e}")))?;
    input.validate()?;
    Ok(input)
}

pub fn to_output<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|e| ApiError(RpcError::internal(format!("Failed to encode output: {e}"))))
}
