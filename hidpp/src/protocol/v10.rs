//! Implements functionality specific to HID++1.0.
//!
//! HID++1.0 is register based: a request reads or writes a short (3 byte) or
//! long (16 byte) register identified by its address. Receivers still speak
//! HID++1.0 exclusively.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Represents a globally defined sub ID of a HID++1.0 message.
///
/// This enum only includes sub IDs that are defined globally across all
/// devices. Receivers define additional sub IDs for their notifications, see
/// [`crate::receiver::event`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum SubId {
    /// Used to set a 3-byte register value. Answered with a message of the
    /// same type or [`Self::Error`].
    SetRegister = 0x80,

    /// Used to retrieve a 3-byte register value.
    GetRegister = 0x81,

    /// Used to set a 16-byte register value.
    SetLongRegister = 0x82,

    /// Used to retrieve a 16-byte register value.
    GetLongRegister = 0x83,

    /// Marks an error reply. The error code can be mapped using
    /// [`ErrorCode::try_from`].
    Error = 0x8f,
}

impl SubId {
    /// Picks the register access sub ID for a read or write of a short or long
    /// register.
    pub fn register_access(write: bool, long: bool) -> Self {
        match (write, long) {
            (true, false) => Self::SetRegister,
            (false, false) => Self::GetRegister,
            (true, true) => Self::SetLongRegister,
            (false, true) => Self::GetLongRegister,
        }
    }
}

/// Represents the type of an error a HID++1.0 device returns as part of a
/// message with the [`SubId::Error`] type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,

    /// The sub ID of a sent message is invalid. HID++1.0 devices answer a
    /// HID++2.0 root ping with this.
    InvalidSubId = 0x01,

    InvalidAddress = 0x02,

    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    /// The receiver indicates that too many devices are connected to it.
    TooManyDevices = 0x05,

    AlreadyExists = 0x06,

    /// The receiver is currently handling a downstream (to device) message and
    /// cannot process a second one.
    Busy = 0x07,

    /// There is no device paired at the addressed device index.
    UnknownDevice = 0x08,

    /// The addressed device is paired but currently disconnected, usually
    /// because it went to sleep. It reconnects once the user interacts with it.
    ResourceError = 0x09,

    RequestUnavailable = 0x0a,

    InvalidParamValue = 0x0b,

    WrongPinCode = 0x0c,
}

/// An error reported by a HID++1.0 device.
///
/// Unknown codes are kept as-is so that callers can still log them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
#[error("HID++1.0 error {code:#04x} ({:?})", self.kind())]
pub struct Hidpp10Error {
    pub code: u8,
}

impl Hidpp10Error {
    pub fn new(code: u8) -> Self {
        Self { code }
    }

    /// Maps the raw code to a known [`ErrorCode`].
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.code).ok()
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == u8::from(code)
    }
}

impl From<ErrorCode> for Hidpp10Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_unknown_codes() {
        let err = Hidpp10Error::new(0x42);
        assert_eq!(err.kind(), None);
        assert!(err.to_string().contains("0x42"));
    }

    #[test]
    fn picks_register_sub_ids() {
        assert_eq!(SubId::register_access(false, true), SubId::GetLongRegister);
        assert_eq!(SubId::register_access(true, false), SubId::SetRegister);
    }
}
