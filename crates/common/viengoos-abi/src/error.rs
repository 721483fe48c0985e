use core::convert::TryFrom;
use core::fmt;

/// Errors returned by kernel and capability server operations.
///
/// Every variant has a stable non zero code; RPC replies carry the code
/// in their first word, with zero meaning success.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u64)]
pub enum Error {
    /// A malformed argument: bad address, bad guard or subpage, index out
    /// of range, undecodable message.
    InvalidArgument = 1,
    /// The capability is dead or the address designates nothing.
    NoObject = 2,
    /// A live capability of the wrong type for the operation.
    WrongType = 3,
    /// The operation needs rights the capability does not grant.
    PermissionDenied = 4,
    /// Quota or storage is exhausted. Retrying later may succeed.
    OutOfResources = 5,
    /// A non-blocking operation could not complete immediately.
    WouldBlock = 6,
    /// A blocked operation was aborted.
    Interrupted = 7,
    /// Unknown method for this object.
    NotSupported = 8,
    /// The object's content was discarded and has not been acknowledged.
    Discarded = 9,
    /// The data does not fit the destination.
    Overflow = 10,
    /// An error code this side does not know.
    Unknown = 0xffff,
}

/// Result type used throughout.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Decode a reply code. Zero is success and maps to `None`.
    pub fn from_code(code: u64) -> Option<Error> {
        match code {
            0 => None,
            code => Some(Error::try_from(code).unwrap_or(Error::Unknown)),
        }
    }
}

impl TryFrom<u64> for Error {
    type Error = ();

    fn try_from(value: u64) -> core::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Error::InvalidArgument,
            2 => Error::NoObject,
            3 => Error::WrongType,
            4 => Error::PermissionDenied,
            5 => Error::OutOfResources,
            6 => Error::WouldBlock,
            7 => Error::Interrupted,
            8 => Error::NotSupported,
            9 => Error::Discarded,
            10 => Error::Overflow,
            0xffff => Error::Unknown,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NoObject => "no such object",
            Error::WrongType => "wrong object type",
            Error::PermissionDenied => "permission denied",
            Error::OutOfResources => "out of resources",
            Error::WouldBlock => "operation would block",
            Error::Interrupted => "operation interrupted",
            Error::NotSupported => "operation not supported",
            Error::Discarded => "object content discarded",
            Error::Overflow => "message too large",
            Error::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}
