use thiserror::Error;

use crate::worker::registry::TargetError;

#[derive(Error, Debug)]
pub enum BuckError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invocation of {target} failed: {reason}")]
    InvocationFailure { target: String, reason: String },

    #[error("Target raised: {0}")]
    Target(#[from] TargetError),

    #[error("Invalid execution context: {0}")]
    InvalidContext(String),

    #[error("Delivery to {target} failed: wrote {written} of {expected} bytes")]
    DeliveryFailure {
        target: String,
        written: usize,
        expected: usize,
    },

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Socket setup failed for {addr}: {reason}")]
    SocketSetupFailure { addr: String, reason: String },

    #[error("No supervisor reachable ({0} desks tried)")]
    UnreachableSupervisor(usize),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Invalid desk spec: {0}")]
    InvalidDeskSpec(String),

    #[error("Invalid client signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BuckError {
    /// Exit status a worker process reports when it dies on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuckError::MalformedFrame(_)
            | BuckError::Serialization(_)
            | BuckError::MessageTooLarge { .. } => 65,
            BuckError::Io(_) | BuckError::DeliveryFailure { .. } => 74,
            _ => 70,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_severity() {
        assert_eq!(BuckError::MalformedFrame("x".into()).exit_code(), 65);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(BuckError::Io(io).exit_code(), 74);
        assert_eq!(BuckError::Worker("spawn".into()).exit_code(), 70);
    }

    #[test]
    fn delivery_failure_message_names_byte_counts() {
        let err = BuckError::DeliveryFailure {
            target: "127.0.0.1:7390".into(),
            written: 3,
            expected: 10,
        };
        assert_eq!(
            err.to_string(),
            "Delivery to 127.0.0.1:7390 failed: wrote 3 of 10 bytes"
        );
    }
}
