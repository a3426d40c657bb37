pub mod database;
pub mod error;
pub mod items;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use items::ItemRepo;
