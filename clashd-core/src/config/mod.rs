//! Application configuration

pub mod core_api;
pub mod loader;
pub mod schema;
pub mod validator;

pub use core_api::CoreApi;
pub use loader::ConfigLoader;
pub use schema::{AppConfig, LoggingConfig, MihomoConfig};
pub use validator::ConfigValidator;
