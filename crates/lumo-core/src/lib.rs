pub mod chat;
pub mod contract;
pub mod errors;
pub mod ids;
pub mod item;
pub mod provider;
pub mod security;
pub mod sse;
pub mod stream;

pub use contract::{ErrorCode, Procedure, RpcError, Validate, ValidationError};
pub use errors::GatewayError;
