//! Implements functionality specific to HID++2.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Represents the type of an error a HID++2.0 device returns in an error
/// reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0x00,
    Unknown = 0x01,
    InvalidArgument = 0x02,
    OutOfRange = 0x03,
    HardwareError = 0x04,
    LogitechInternal = 0x05,

    /// The feature index of the request is not part of the feature table.
    InvalidFeatureIndex = 0x06,

    InvalidFunctionId = 0x07,
    Busy = 0x08,
    Unsupported = 0x09,
}

/// An error reported by a HID++2.0 device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
#[error("HID++2.0 error {code:#04x} ({:?})", self.kind())]
pub struct Hidpp20Error {
    pub code: u8,
}

impl Hidpp20Error {
    pub fn new(code: u8) -> Self {
        Self { code }
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.code).ok()
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == u8::from(code)
    }
}

impl From<ErrorCode> for Hidpp20Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code.into())
    }
}
