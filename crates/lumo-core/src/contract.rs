//! Procedure table, common errors and input validation shared by the
//! server and the client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors every procedure may raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    BadRequest,
    InternalError,
}

impl ErrorCode {
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::BadRequest => "Bad Request",
            Self::InternalError => "Internal Server Error",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::InternalError => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::BadRequest => "BAD_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope returned by every procedure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// An error carrying the code's default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            data: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_found() -> Self {
        Self::new(ErrorCode::NotFound)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InternalError, message)
    }
}

impl From<ValidationError> for RpcError {
    fn from(e: ValidationError) -> Self {
        let data = serde_json::json!({ "field": e.field, "issue": e.message });
        Self::new(ErrorCode::BadRequest).with_data(data)
    }
}

/// Every procedure the server exposes, keyed by its wire path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Procedure {
    HealthCheck,
    ItemList,
    ItemGet,
    ItemCreate,
    ItemUpdate,
    ItemDelete,
    ChatStream,
}

impl Procedure {
    pub const ALL: [Procedure; 7] = [
        Self::HealthCheck,
        Self::ItemList,
        Self::ItemGet,
        Self::ItemCreate,
        Self::ItemUpdate,
        Self::ItemDelete,
        Self::ChatStream,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::HealthCheck => "healthCheck",
            Self::ItemList => "item.list",
            Self::ItemGet => "item.get",
            Self::ItemCreate => "item.create",
            Self::ItemUpdate => "item.update",
            Self::ItemDelete => "item.delete",
            Self::ChatStream => "chat.stream",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Procedure {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.path() == s)
            .ok_or_else(|| RpcError::with_message(ErrorCode::NotFound, format!("Procedure not found: {s}")))
    }
}

/// A schema violation on a procedure input.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Input schema check, run by the server before dispatch and by the client before sending.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Check a string's length in characters against inclusive bounds.
pub fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < min {
        return Err(ValidationError::new(
            field,
            format!("must be at least {min} characters"),
        ));
    }
    if len > max {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
    Ok(())
}

pub fn check_positive(field: &str, value: i64) -> Result<(), ValidationError> {
    if value <= 0 {
        return Err(ValidationError::new(field, "must be a positive integer"));
    }
    Ok(())
}
