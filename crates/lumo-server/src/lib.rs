pub mod config;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use config::ServerConfig;
pub use handlers::HandlerState;
pub use rpc::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
