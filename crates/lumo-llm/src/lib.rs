pub mod provider;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use provider::{OpenAiProvider, DEFAULT_BASE_URL};
