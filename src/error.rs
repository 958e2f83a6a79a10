use std::io;

use thiserror::Error;

use crate::net::NetError;

/// Failure of one scan attempt, or of the whole failover sequence.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("request line does not fit the send buffer: {0}")]
    BufferOverflow(&'static str),
    #[error("retry limit exceeded after {attempts} attempts, last error: {last}")]
    RetryLimitExceeded {
        attempts: usize,
        last: Box<ScanError>,
    },
    #[error("no upstream configured")]
    NoUpstream,
}

impl ScanError {
    pub fn transport(context: &'static str, source: io::Error) -> Self {
        ScanError::Transport { context, source }
    }

    pub fn net(context: &'static str, err: NetError) -> Self {
        match err {
            NetError::Timeout => ScanError::Timeout(context),
            NetError::Connect(source) | NetError::Socket(source) => {
                ScanError::Transport { context, source }
            }
        }
    }

    /// Whether another attempt (possibly against another upstream) makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::Timeout(_) | ScanError::Transport { .. } | ScanError::Protocol(_)
        )
    }

    /// Whether the failure counts against the upstream's health.
    pub fn blames_upstream(&self) -> bool {
        !matches!(
            self,
            ScanError::BufferOverflow(_)
                | ScanError::NoUpstream
                | ScanError::RetryLimitExceeded { .. }
        )
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
