pub mod chat_store;
pub mod client;
pub mod settings;
pub mod transport;

pub use chat_store::{ChatState, ChatStatus, ChatStore};
pub use client::{ClientError, RpcClient, DEFAULT_SERVER_URL};
pub use settings::ChatSettings;
pub use transport::{ChatEventStream, ChatTransport};
