pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::QueueError;
pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{JobStore, JobStoreOptions};
