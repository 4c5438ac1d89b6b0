//! Error types used throughout the library

use std::fmt::{Display, Formatter};

/// Errors that occur while parsing a frame off a byte stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    /// CRC-16 validation failed (received, expected)
    CrcMismatch(u16, u16),
    /// LRC validation failed (received, expected)
    LrcMismatch(u8, u8),
    /// ASCII frame contained a character that is not a hexadecimal digit
    BadHexDigit(u8),
    /// ASCII frame contained an odd number of hexadecimal digits
    OddHexCount(usize),
    /// ASCII frame CR was not followed by LF
    MissingLineFeed(u8),
    /// frame is too short to contain a unit id, function code and checksum
    FrameTooShort(usize),
    /// frame length exceeds the maximum allowed size (actual, maximum)
    FrameTooBig(usize, usize),
    /// received a function code for which the body length cannot be inferred
    UnknownFunctionCode(u8),
    /// received an MBAP header with the length field set to zero
    MbapLengthZero,
    /// received an MBAP header with a length that exceeds the maximum (actual, maximum)
    MbapLengthTooBig(usize, usize),
    /// received an MBAP header with a non-Modbus protocol id
    UnknownProtocolId(u16),
    /// exceeded the configured number of discarded frames without finding a valid one
    DiscardLimit(usize),
}

impl FrameParseError {
    /// corrupt frames on checksum-protected framings can be discarded and
    /// scanning resumed, whereas a malformed MBAP header means the stream
    /// itself is desynchronized
    pub(crate) fn is_recoverable(self) -> bool {
        match self {
            FrameParseError::CrcMismatch(_, _)
            | FrameParseError::LrcMismatch(_, _)
            | FrameParseError::BadHexDigit(_)
            | FrameParseError::OddHexCount(_)
            | FrameParseError::MissingLineFeed(_)
            | FrameParseError::FrameTooShort(_)
            | FrameParseError::UnknownFunctionCode(_) => true,
            FrameParseError::FrameTooBig(_, _)
            | FrameParseError::MbapLengthZero
            | FrameParseError::MbapLengthTooBig(_, _)
            | FrameParseError::UnknownProtocolId(_)
            | FrameParseError::DiscardLimit(_) => false,
        }
    }
}

impl std::error::Error for FrameParseError {}

impl Display for FrameParseError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FrameParseError::CrcMismatch(received, expected) => write!(
                f,
                "CRC mismatch: received {received:#06X}, expected {expected:#06X}"
            ),
            FrameParseError::LrcMismatch(received, expected) => write!(
                f,
                "LRC mismatch: received {received:#04X}, expected {expected:#04X}"
            ),
            FrameParseError::BadHexDigit(value) => {
                write!(f, "received non-hexadecimal character: {value:#04X}")
            }
            FrameParseError::OddHexCount(count) => {
                write!(f, "received an odd number of hexadecimal digits: {count}")
            }
            FrameParseError::MissingLineFeed(value) => {
                write!(f, "expected LF after CR, received {value:#04X}")
            }
            FrameParseError::FrameTooShort(size) => {
                write!(f, "frame of {size} bytes is too short to be valid")
            }
            FrameParseError::FrameTooBig(size, max) => write!(
                f,
                "frame length of {size} exceeds the maximum allowed length of {max}"
            ),
            FrameParseError::UnknownFunctionCode(value) => {
                write!(f, "received unknown function code: {value:#04X}")
            }
            FrameParseError::MbapLengthZero => {
                f.write_str("received MBAP header with the length field set to zero")
            }
            FrameParseError::MbapLengthTooBig(size, max) => write!(
                f,
                "received MBAP header with length ({size}) that exceeds the maximum allowed size ({max})"
            ),
            FrameParseError::UnknownProtocolId(id) => {
                write!(f, "received MBAP header with non-Modbus protocol id: {id}")
            }
            FrameParseError::DiscardLimit(count) => {
                write!(f, "discarded {count} corrupt frames without finding a valid one")
            }
        }
    }
}

/// Errors that indicate bugs in the library itself, e.g. a formatter
/// overrunning its buffer. These are never expected to occur.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// attempted to write beyond the end of a buffer (requested, remaining)
    InsufficientWriteSpace(usize, usize),
    /// attempted to read more bytes than buffered (requested, remaining)
    InsufficientBytesForRead(usize, usize),
    /// cursor seek exceeded the bounds of the underlying buffer
    BadSeekOperation,
}

impl std::error::Error for InternalError {}

impl Display for InternalError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            InternalError::InsufficientWriteSpace(requested, remaining) => write!(
                f,
                "attempted to write {requested} bytes with {remaining} bytes remaining"
            ),
            InternalError::InsufficientBytesForRead(requested, remaining) => write!(
                f,
                "attempted to read {requested} bytes with only {remaining} remaining"
            ),
            InternalError::BadSeekOperation => {
                f.write_str("cursor seek operation exceeded the bounds of the underlying buffer")
            }
        }
    }
}

/// Errors that can occur during a single request/response exchange
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// the underlying stream failed or was closed
    Io(std::io::ErrorKind),
    /// a frame could not be parsed off the stream
    BadFrame(FrameParseError),
    /// no response was received within the configured timeout
    ResponseTimeout,
    /// no connection exists to the remote endpoint
    NoConnection,
    /// a bug in the library itself
    Internal(InternalError),
}

impl RequestError {
    /// timeouts and broken streams are worth retrying with the identical
    /// request, everything else is not
    pub(crate) fn is_retryable(self) -> bool {
        matches!(
            self,
            RequestError::ResponseTimeout | RequestError::Io(_) | RequestError::NoConnection
        )
    }
}

impl std::error::Error for RequestError {}

impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            RequestError::Io(kind) => write!(f, "I/O error: {kind:?}"),
            RequestError::BadFrame(err) => write!(f, "framing error: {err}"),
            RequestError::ResponseTimeout => {
                f.write_str("timeout occurred before receiving a response")
            }
            RequestError::NoConnection => f.write_str("no connection exists to the remote endpoint"),
            RequestError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<FrameParseError> for RequestError {
    fn from(err: FrameParseError) -> Self {
        RequestError::BadFrame(err)
    }
}

impl From<InternalError> for RequestError {
    fn from(err: InternalError) -> Self {
        RequestError::Internal(err)
    }
}

/// Errors raised when validating serial parameters or endpoint configuration.
/// These are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// parity string was not one of none/even/odd/mark/space
    BadParity(String),
    /// stop bits string was not one of 1/1.5/2
    BadStopBits(String),
    /// flow control string was not a recognized token
    BadFlowControl(String),
    /// data bits value was not in 5..=8
    BadDataBits(u8),
    /// encoding string was not one of ascii/rtu
    BadEncoding(String),
    /// baud rate must be non-zero
    BadBaudRate(u32),
    /// serial endpoints require a device path
    EmptyDevicePath,
    /// the parameter parsed but the serial driver cannot express it
    Unsupported(&'static str),
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ConfigError::BadParity(value) => write!(f, "invalid parity: {value:?}"),
            ConfigError::BadStopBits(value) => write!(f, "invalid stop bits: {value:?}"),
            ConfigError::BadFlowControl(value) => write!(f, "invalid flow control: {value:?}"),
            ConfigError::BadDataBits(value) => write!(f, "invalid data bits: {value}"),
            ConfigError::BadEncoding(value) => write!(f, "invalid serial encoding: {value:?}"),
            ConfigError::BadBaudRate(value) => write!(f, "invalid baud rate: {value}"),
            ConfigError::EmptyDevicePath => f.write_str("serial device path is empty"),
            ConfigError::Unsupported(what) => {
                write!(f, "parameter not supported by the serial driver: {what}")
            }
        }
    }
}

/// Errors raised when binding a listener to a physical endpoint.
/// These are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// the underlying bind failed, e.g. the port is already in use
    Unavailable(std::io::ErrorKind),
    /// the endpoint parameters are invalid
    Config(ConfigError),
}

impl std::error::Error for EndpointError {}

impl Display for EndpointError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            EndpointError::Unavailable(kind) => write!(f, "endpoint unavailable: {kind:?}"),
            EndpointError::Config(err) => write!(f, "invalid endpoint configuration: {err}"),
        }
    }
}

impl From<std::io::Error> for EndpointError {
    fn from(err: std::io::Error) -> Self {
        EndpointError::Unavailable(err.kind())
    }
}

impl From<ConfigError> for EndpointError {
    fn from(err: ConfigError) -> Self {
        EndpointError::Config(err)
    }
}

/// Final outcome of a failed transaction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// every send attempt failed, wrapping the error of the last attempt
    Failed {
        /// number of times the request was transmitted
        attempts: usize,
        /// the error that failed the final attempt
        source: RequestError,
    },
    /// the transaction was aborted by a non-retryable error
    Aborted(RequestError),
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::Failed { source, .. } => Some(source),
            TransactionError::Aborted(source) => Some(source),
        }
    }
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            TransactionError::Failed { attempts, source } => {
                write!(f, "transaction failed after {attempts} attempts: {source}")
            }
            TransactionError::Aborted(source) => write!(f, "transaction aborted: {source}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_parse_errors_are_recoverable() {
        assert!(FrameParseError::CrcMismatch(1, 2).is_recoverable());
        assert!(FrameParseError::LrcMismatch(1, 2).is_recoverable());
        assert!(FrameParseError::BadHexDigit(b'G').is_recoverable());
    }

    #[test]
    fn mbap_errors_are_not_recoverable() {
        assert!(!FrameParseError::MbapLengthZero.is_recoverable());
        assert!(!FrameParseError::UnknownProtocolId(0xCAFE).is_recoverable());
    }
}
