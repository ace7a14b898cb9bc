//! PC/SC status codes, card states and reader state flags.
//!
//! Values follow the PC/SC lite numbering so that hosts can hand them to code written against
//! `winscard.h` without translation.

use std::fmt::{Display, Formatter};

use bitflags::bitflags;

/// A PC/SC status code, as returned by every operation of the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(i64)]
pub enum Status {
    /// `SCARD_S_SUCCESS`
    Success = 0x0000_0000,

    /// `SCARD_E_INVALID_HANDLE`
    InvalidHandle = 0x8010_0003,

    /// `SCARD_E_INVALID_PARAMETER`
    InvalidParameter = 0x8010_0004,

    /// `SCARD_E_NO_MEMORY`
    NoMemory = 0x8010_0006,

    /// `SCARD_F_WAITED_TOO_LONG`
    WaitedTooLong = 0x8010_0007,

    /// `SCARD_E_INSUFFICIENT_BUFFER`
    InsufficientBuffer = 0x8010_0008,

    /// `SCARD_E_UNKNOWN_READER`
    UnknownReader = 0x8010_0009,

    /// `SCARD_E_NO_SMARTCARD`
    NoSmartcard = 0x8010_000C,

    /// `SCARD_E_READER_UNAVAILABLE`
    ReaderUnavailable = 0x8010_0017,

    /// `SCARD_E_NO_SERVICE`
    NoService = 0x8010_001D,

    /// `SCARD_E_NO_READERS_AVAILABLE`
    NoReadersAvailable = 0x8010_002E,
}

impl Status {
    const ALL: [Status; 11] = [
        Status::Success,
        Status::InvalidHandle,
        Status::InvalidParameter,
        Status::NoMemory,
        Status::WaitedTooLong,
        Status::InsufficientBuffer,
        Status::UnknownReader,
        Status::NoSmartcard,
        Status::ReaderUnavailable,
        Status::NoService,
        Status::NoReadersAvailable,
    ];

    /// The numeric code.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Looks up the status for a numeric code.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// A human-readable description, prefixed with the PC/SC constant name.
    pub fn message(self) -> &'static str {
        use Status::*;

        match self {
            Success => "SCARD_S_SUCCESS: No error was encountered.",
            InvalidHandle => "SCARD_E_INVALID_HANDLE: The supplied handle was invalid.",
            InvalidParameter => {
                "SCARD_E_INVALID_PARAMETER: One or more of the supplied parameters could not be properly interpreted."
            }
            NoMemory => "SCARD_E_NO_MEMORY: Not enough memory available to complete this command.",
            WaitedTooLong => "SCARD_F_WAITED_TOO_LONG: An internal consistency timer has expired.",
            InsufficientBuffer => {
                "SCARD_E_INSUFFICIENT_BUFFER: The data buffer to receive returned data is too small for the returned data."
            }
            UnknownReader => "SCARD_E_UNKNOWN_READER: The specified reader name is not recognized.",
            NoSmartcard => {
                "SCARD_E_NO_SMARTCARD: The operation requires a Smart Card, but no Smart Card is currently in the device."
            }
            ReaderUnavailable => {
                "SCARD_E_READER_UNAVAILABLE: The specified reader is not currently available for use."
            }
            NoService => "SCARD_E_NO_SERVICE: The Smart card resource manager is not running.",
            NoReadersAvailable => "SCARD_E_NO_READERS_AVAILABLE: Cannot find a smart card reader.",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#010X})", self.message(), self.code())
    }
}

impl From<Status> for i64 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

/// Describes a status code, or `None` if the code is not one the layer produces.
pub fn stringify(code: i64) -> Option<&'static str> {
    Status::from_code(code).map(Status::message)
}

/// The state of the card as reported by `SCardStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(i32)]
pub enum CardState {
    /// `SCARD_ABSENT`: no key is connected.
    Absent = 0x0002,

    /// `SCARD_SWALLOWED`: the key is connected but no session is open.
    Swallowed = 0x0008,

    /// `SCARD_SPECIFIC`: a session is open and ready for APDUs.
    Specific = 0x0040,
}

impl CardState {
    pub fn code(self) -> i32 {
        self as i32
    }
}

bitflags! {
    /// Reader state flags, as reported by `SCardGetStatusChange`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct StatusChange: i64 {
        const UNAWARE = 0x0000;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
    }
}

/// The protocol of an established connection. YubiKeys always speak T=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u32)]
pub enum Protocol {
    T1 = 0x0002,
}

impl Protocol {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(0, Status::Success.code());
        assert_eq!(0x8010000C, Status::NoSmartcard.code());
        assert_eq!(0x80100017, i64::from(Status::ReaderUnavailable));
        assert_eq!(Some(Status::WaitedTooLong), Status::from_code(0x80100007));
        assert_eq!(None, Status::from_code(0x80100001));
    }

    #[test]
    fn test_stringify() {
        for status in Status::ALL {
            let message = stringify(status.code()).unwrap();
            assert!(message.starts_with("SCARD_"));
        }

        assert_eq!(None, stringify(-1));
        assert_eq!(
            Some("SCARD_E_NO_READERS_AVAILABLE: Cannot find a smart card reader."),
            stringify(0x8010002E),
        );
    }

    #[test]
    fn test_status_change_flags() {
        let flags = StatusChange::PRESENT | StatusChange::CHANGED;

        assert_eq!(0x22, flags.bits());
        assert!(flags.contains(StatusChange::PRESENT));
        assert!(!flags.contains(StatusChange::EMPTY));
        assert_eq!(StatusChange::UNAWARE, StatusChange::empty());
    }

    #[test]
    fn test_status_change_keeps_unknown_bits() {
        // The event counter of pcsc-lite lives in the upper 16 bits.
        let flags = StatusChange::from_bits_retain(0x0001_0022);

        assert_eq!(0x0001_0022, flags.bits());
        assert!(flags.contains(StatusChange::PRESENT | StatusChange::CHANGED));
        assert_eq!(None, StatusChange::from_bits(0x0001_0022));
    }
}
