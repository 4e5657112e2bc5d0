pub mod cleanup_service;
pub mod database;
pub mod memory;
pub mod observability;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::{run_migrations, DatabaseManager};
pub use memory::InMemoryStore;
pub use observability::{MetricsCollector, StructuredLogger};
