pub mod app_config;
pub mod database;
pub mod engine;
pub mod observability;
pub mod runtime;

pub use app_config::*;
pub use database::*;
pub use engine::*;
pub use observability::*;
pub use runtime::*;
