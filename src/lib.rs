pub mod config;
pub mod desk;
pub mod error;
pub mod routing;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use error::{BuckError, Result};
