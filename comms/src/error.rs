use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommsError {
    /// The endpoint was terminated, either explicitly or after a fatal
    /// transport error; no further operation can succeed.
    Terminated,
    /// The peer closed its end of the channel.
    PeerDisconnected,
    OsOperationFailed {
        description: &'static str,
        os_code: i64,
    },
    LengthOutOfBounds {
        length: usize,
    },
    TagMismatch {
        expected: u32,
        received: u32,
    },
    LengthMismatch {
        expected: usize,
        received: usize,
    },
    BufferTooSmall {
        needed: usize,
        capacity: usize,
    },
    ShortTransfer {
        transferred: usize,
        requested: usize,
    },
    /// An FD or credentials frame arrived without its ancillary payload.
    MissingAncillaryData,
    UnexpectedAncillaryData {
        level: i32,
        kind: i32,
    },
    /// recv_creds() was called on a socket without SO_PASSCRED enabled.
    CredentialPassingDisabled,
    InvalidStringPayload,
    Serialization {
        description: String,
    },
    InvalidCommsFdVariable {
        value: String,
    },
}

impl Display for CommsError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            CommsError::Terminated => write!(f, "endpoint is terminated"),
            CommsError::PeerDisconnected => write!(f, "peer closed the connection"),
            CommsError::OsOperationFailed {
                description,
                os_code,
            } => write!(f, "{} failed with error {}", description, os_code),
            CommsError::LengthOutOfBounds { length } => {
                write!(f, "frame length {} exceeds the maximum message size", length)
            }
            CommsError::TagMismatch { expected, received } => write!(
                f,
                "expected frame tag {:#010x}, received {:#010x}",
                expected, received
            ),
            CommsError::LengthMismatch { expected, received } => write!(
                f,
                "expected frame length {}, received {}",
                expected, received
            ),
            CommsError::BufferTooSmall { needed, capacity } => write!(
                f,
                "frame value of {} bytes does not fit buffer of {} bytes",
                needed, capacity
            ),
            CommsError::ShortTransfer {
                transferred,
                requested,
            } => write!(
                f,
                "transferred only {} of {} requested bytes",
                transferred, requested
            ),
            CommsError::MissingAncillaryData => {
                write!(f, "no ancillary payload attached to the frame")
            }
            CommsError::UnexpectedAncillaryData { level, kind } => write!(
                f,
                "unexpected ancillary data (level {}, type {})",
                level, kind
            ),
            CommsError::CredentialPassingDisabled => {
                write!(f, "SO_PASSCRED is not enabled on this socket")
            }
            CommsError::InvalidStringPayload => write!(f, "string frame is not valid UTF-8"),
            CommsError::Serialization { description } => {
                write!(f, "serialization failed: {}", description)
            }
            CommsError::InvalidCommsFdVariable { value } => {
                write!(f, "cannot parse comms descriptor override {:?}", value)
            }
        }
    }
}
