// Database module for the model metadata store
// Provides SQLite persistence for known models and the chosen flag

pub mod manager;
pub mod migrations;
pub mod models;
pub mod model_repo;

pub use manager::DatabaseManager;
pub use models::*;
