pub mod error;

pub use error::{BoxError, Error, ErrorKind, Result};
pub use error::{
    ApiError, BrokerError, ConfigError, ReprocessError, ScaleError, SchedulerError, StorageError,
};
