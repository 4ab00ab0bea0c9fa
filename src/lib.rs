pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{FarmError, Result};
