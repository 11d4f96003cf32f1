use axum::http::StatusCode;
use thiserror::Error;

/// Broker-facing failures. `recoverable()` decides whether the session loop
/// re-enters the backoff/reconnect cycle or gives up.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection lost")]
    ConnectionLost,
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("broker authentication failed")]
    AuthFailed,
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("broker pool exhausted")]
    PoolExhausted,
}

impl BrokerError {
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionLost
                | BrokerError::BrokerUnavailable(_)
                | BrokerError::PublishFailed(_)
        )
    }
}

/// Datastore failures. Everything except a constraint violation is retried
/// by the batch writer up to its configured attempt count.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("deadlock detected")]
    Deadlock,
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("datastore timeout")]
    Timeout,
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn retryable(&self) -> bool {
        !matches!(self, PersistenceError::ConstraintViolation(_))
    }

    /// Map a driver error onto the taxonomy. SQLSTATE 40P01 is a Postgres
    /// deadlock, class 23 is an integrity constraint violation.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => PersistenceError::Timeout,
            sqlx::Error::Database(db) => {
                let code = db.code().unwrap_or_default();
                if code == "40P01" || code == "40001" {
                    PersistenceError::Deadlock
                } else if code.starts_with("23") {
                    PersistenceError::ConstraintViolation(db.message().to_string())
                } else {
                    PersistenceError::Unavailable(db.message().to_string())
                }
            }
            _ => PersistenceError::Unavailable(err.to_string()),
        }
    }
}

/// Partition lifecycle failures (§ admin surface maps these onto HTTP).
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition not found: {0}")]
    NotFound(String),
    #[error("partition already exists: {0}")]
    AlreadyExists(String),
    #[error("partition creation failed: {0}")]
    CreationFailed(String),
    #[error("partition drop failed: {0}")]
    DropFailed(String),
    #[error("invalid partition name: {0}")]
    InvalidName(String),
    #[error("partition too recent to drop: {0}")]
    TooRecent(String),
    #[error("insufficient privileges: {0}")]
    Permission(String),
    #[error("partition info error: {0}")]
    InfoError(String),
}

impl PartitionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PartitionError::NotFound(_) => StatusCode::NOT_FOUND,
            PartitionError::AlreadyExists(_) => StatusCode::CONFLICT,
            PartitionError::InvalidName(_) | PartitionError::TooRecent(_) => {
                StatusCode::BAD_REQUEST
            }
            PartitionError::Permission(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Bad inbound payloads or bad request parameters. Never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unparseable timestamp: {0:?}")]
    BadTimestamp(String),
    #[error("unparseable numeric field {field}: {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("empty payload")]
    EmptyPayload,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Broadcast failures never propagate; they only feed the error counter.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("session closed")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_recoverable_set() {
        assert!(BrokerError::ConnectionLost.recoverable());
        assert!(BrokerError::BrokerUnavailable("dns".into()).recoverable());
        assert!(BrokerError::PublishFailed("io".into()).recoverable());
        assert!(!BrokerError::AuthFailed.recoverable());
        assert!(!BrokerError::SubscribeFailed("denied".into()).recoverable());
        assert!(!BrokerError::PoolExhausted.recoverable());
    }

    #[test]
    fn constraint_violations_are_not_retried() {
        assert!(!PersistenceError::ConstraintViolation("dup imei".into()).retryable());
        assert!(PersistenceError::Deadlock.retryable());
        assert!(PersistenceError::Timeout.retryable());
        assert!(PersistenceError::Unavailable("down".into()).retryable());
    }

    #[test]
    fn partition_error_status_mapping() {
        assert_eq!(
            PartitionError::NotFound("p_202501".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PartitionError::InvalidName("drop table".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PartitionError::TooRecent("p_202507".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
