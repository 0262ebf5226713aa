pub mod config;
pub mod dashboard;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{JobError, Result};
