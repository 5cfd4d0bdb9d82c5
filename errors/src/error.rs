use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Broker,
    /// Ack/extend on a lease the broker no longer holds. Benign under
    /// crash-recovery: the message expired and was re-leased or removed.
    MessageGone,
    Worker,
    Scale,
    Reprocess,
    Config,
    Api,
    Scheduler,
    Storage,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Broker => write!(f, "broker"),
            ErrorKind::MessageGone => write!(f, "message gone"),
            ErrorKind::Worker => write!(f, "worker"),
            ErrorKind::Scale => write!(f, "scale"),
            ErrorKind::Reprocess => write!(f, "reprocess"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Api => write!(f, "api"),
            ErrorKind::Scheduler => write!(f, "scheduler"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Serialization => write!(f, "serialization"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_broker(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Broker)
    }

    pub fn is_message_gone(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::MessageGone)
    }

    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Config)
    }

    pub fn is_reprocess(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Reprocess)
    }

    pub fn is_connect(&self) -> bool {
        if let Some(source) = &self.inner.source {
            let msg = source.to_string().to_lowercase();
            msg.contains("connect") || msg.contains("connection")
        } else {
            false
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("conveyor::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error::new(ErrorKind::Broker, Some(err))
    }
}

impl From<ScaleError> for Error {
    fn from(err: ScaleError) -> Self {
        Error::new(ErrorKind::Scale, Some(err))
    }
}

impl From<ReprocessError> for Error {
    fn from(err: ReprocessError) -> Self {
        Error::new(ErrorKind::Reprocess, Some(err))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::new(ErrorKind::Storage, Some(err))
    }
}

impl From<SchedulerError> for Error {
    fn from(err: SchedulerError) -> Self {
        Error::new(ErrorKind::Scheduler, Some(err))
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::new(ErrorKind::Api, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("enqueue failed: {0}")]
    EnqueueFailed(#[source] BoxError),
    #[error("lease failed: {0}")]
    LeaseFailed(#[source] BoxError),
    #[error("consumer group create failed: {0}")]
    GroupCreateFailed(#[source] BoxError),
    #[error("dead letter store failed: {0}")]
    DeadLetterFailed(#[source] BoxError),
    #[error("broker operation failed: {0}")]
    OperationFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("invalid scale rule for stage {stage}: {reason}")]
    InvalidRule { stage: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("item enumeration failed: {0}")]
    EnumerationFailed(#[source] BoxError),
    #[error("enqueued {queued} of {planned} items before failure")]
    PartialEnqueue {
        queued: usize,
        planned: usize,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    ReadFailed(#[source] BoxError),
    #[error("config parse failed: {0}")]
    ParseFailed(#[source] BoxError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("read failed: {0}")]
    ReadFailed(#[source] BoxError),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidSchedule(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bind failed: {0}")]
    BindFailed(#[source] BoxError),
    #[error("server failed: {0}")]
    ServerFailed(#[source] BoxError),
}

impl Error {
    pub fn message_gone(id: &str) -> Self {
        Error::with_message::<BoxError>(
            ErrorKind::MessageGone,
            format!("message {id} is no longer leased"),
            None,
        )
    }

    pub fn broker_connection() -> Self {
        Error::from(BrokerError::ConnectionFailed)
    }

    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Error::from(ConfigError::Invalid(reason.into()))
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Error::with_message::<BoxError>(ErrorKind::Worker, message.into(), None)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::from(StorageError::ReadFailed(Box::new(err))),
            std::io::ErrorKind::ConnectionRefused => Error::broker_connection(),
            _ => Error::new(ErrorKind::Storage, Some(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, Some(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::broker_connection();
        assert!(err.is_broker());
        assert!(err.is_connect());
    }

    #[test]
    fn test_error_display() {
        let err = Error::config_invalid("activation_threshold must be >= 1");
        assert_eq!(
            err.to_string(),
            "config error: invalid config: activation_threshold must be >= 1"
        );
    }

    #[test]
    fn test_error_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_partial_enqueue_reports_progress() {
        let err = Error::from(ReprocessError::PartialEnqueue {
            queued: 2,
            planned: 4,
            source: Box::new(Error::broker_connection()),
        });
        assert!(err.is_reprocess());
        assert!(err.to_string().contains("enqueued 2 of 4 items"));
    }

    #[test]
    fn test_message_gone_kind() {
        let err = Error::message_gone("0191c2f3");
        assert!(err.is_message_gone());
        assert!(!err.is_broker());
        assert!(err.to_string().contains("no longer leased"));
    }
}
