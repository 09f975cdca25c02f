//! Crate-wide error types.

/// Failures talking to the mail retrieval account.
///
/// Every variant is non-fatal to the scheduler: a failed cycle is logged
/// and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    #[error("IMAP authentication failed: {0}")]
    Auth(String),

    #[error("unexpected IMAP response: {0}")]
    Protocol(String),

    #[error("IMAP operation timed out: {0}")]
    Timeout(String),
}

/// Main error type for the mail core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to parse message: {0}")]
    Parse(String),

    /// The address is registered but its mailbox has expired and not yet
    /// been swept. The address frees up once the retention sweep runs.
    #[error("mailbox address '{0}' is already taken")]
    Conflict(String),

    #[error("mailbox '{0}' not found")]
    MailboxNotFound(String),

    #[error("invalid mailbox address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error represents the expected "address occupied" outcome
    /// of a create call, as opposed to a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
