use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, SmuxError>`.
pub type Result<T> = std::result::Result<T, SmuxError>;

/// Error types for the smux library.
///
/// `SmuxError` covers transport failures, protocol violations detected on
/// the wire, and the expected per-call outcomes of stream I/O (end of
/// stream, timeouts).
#[derive(Debug, Error)]
pub enum SmuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid protocol version: {0}")]
    InvalidProtocol(u8),

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame exceeds receive buffer: {size} bytes (max: {max})")]
    MaxReceiveBuffer { size: usize, max: usize },

    #[error("Broken pipe")]
    ClosedPipe,

    #[error("Stream ID space exhausted, session is going away")]
    GoAway,

    #[error("End of stream")]
    Eof,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl SmuxError {
    /// Returns true when the failed operation may be retried on the same
    /// session or stream.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SmuxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            SmuxError::ReadTimeout | SmuxError::WriteTimeout | SmuxError::Timeout => true,
            SmuxError::Eof => true,
            SmuxError::ClosedPipe
            | SmuxError::GoAway
            | SmuxError::InvalidProtocol(_)
            | SmuxError::InvalidCommand(_)
            | SmuxError::Config(_)
            | SmuxError::ProtocolViolation(_) => false,
            SmuxError::FrameTooLarge { .. }
            | SmuxError::MaxReceiveBuffer { .. }
            | SmuxError::InvalidStreamId(_) => false,
        }
    }

    /// Errors that mean the peer broke the wire protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SmuxError::InvalidProtocol(_)
                | SmuxError::InvalidCommand(_)
                | SmuxError::MaxReceiveBuffer { .. }
                | SmuxError::ProtocolViolation(_)
        )
    }
}

impl From<SmuxError> for io::Error {
    fn from(err: SmuxError) -> Self {
        if let SmuxError::Io(e) = err {
            return e;
        }
        let kind = match &err {
            SmuxError::Io(e) => e.kind(),
            SmuxError::ClosedPipe | SmuxError::GoAway => io::ErrorKind::BrokenPipe,
            SmuxError::Eof => io::ErrorKind::UnexpectedEof,
            SmuxError::ReadTimeout | SmuxError::WriteTimeout | SmuxError::Timeout => {
                io::ErrorKind::TimedOut
            }
            SmuxError::Config(_) => io::ErrorKind::InvalidInput,
            SmuxError::InvalidProtocol(_)
            | SmuxError::InvalidCommand(_)
            | SmuxError::FrameTooLarge { .. }
            | SmuxError::MaxReceiveBuffer { .. }
            | SmuxError::InvalidStreamId(_)
            | SmuxError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
