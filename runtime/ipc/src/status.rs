//! Status codes returned across the service boundary

use core::fmt;

/// Outcome of a service request
///
/// Every request yields exactly one status. Internal failures never cross
/// the boundary as faults; they are translated into one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Status {
    /// The request was carried out
    Success = 0,
    /// The request or one of its arguments was invalid
    InvalidArgument = 1,
    /// A resource needed for the request is exhausted or missing
    ResourceUnavailable = 2,
    /// The service hit a fault or a protocol violation
    InternalFault = 3,
}

impl Status {
    /// Wire encoding
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Decode a wire value
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Status::Success),
            1 => Some(Status::InvalidArgument),
            2 => Some(Status::ResourceUnavailable),
            3 => Some(Status::InternalFault),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::InvalidArgument => "invalid argument",
            Status::ResourceUnavailable => "resource unavailable",
            Status::InternalFault => "internal fault",
        };
        f.write_str(name)
    }
}
