pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod settings;
pub mod store;

pub use database::{Database, DatabaseCell};
pub use error::StoreError;
pub use sessions::SessionRepo;
pub use settings::SettingsRepo;
pub use store::{wait_until_ready, SessionStore};
