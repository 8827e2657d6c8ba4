//! Implements the fixed-layout HID++ report framing.
//!
//! Every HID++ message starts with a 4 byte header:
//!
//! | byte | HID++1.0             | HID++2.0                        |
//! |------|----------------------|---------------------------------|
//! | 0    | report ID            | report ID                       |
//! | 1    | device index         | device index                    |
//! | 2    | sub ID               | feature index                   |
//! | 3    | register address     | function (hi) / software ID (lo) |
//!
//! followed by 3 (short) or 16 (long) bytes of parameters.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::nibble::U4;

/// The report ID of a short HID++ report.
pub const SHORT_REPORT_ID: u8 = 0x10;

/// The report ID of a long HID++ report.
pub const LONG_REPORT_ID: u8 = 0x11;

/// The total size of a short report, including the report ID.
pub const SHORT_REPORT_LENGTH: usize = 7;

/// The total size of a long report, including the report ID.
pub const LONG_REPORT_LENGTH: usize = 20;

/// The size of the header every report starts with.
pub const HEADER_LENGTH: usize = 4;

/// The size of the parameter region of a short report.
pub const SHORT_PARAMS_LENGTH: usize = SHORT_REPORT_LENGTH - HEADER_LENGTH;

/// The size of the parameter region of a long report.
pub const LONG_PARAMS_LENGTH: usize = LONG_REPORT_LENGTH - HEADER_LENGTH;

/// The device index addressing the receiver or a device connected directly
/// via Bluetooth.
pub const DEFAULT_DEVICE_INDEX: u8 = 0xff;

/// The device index some corded (USB) devices answer on.
pub const CORDED_DEVICE_INDEX: u8 = 0x00;

/// The sub ID of a HID++1.0 error reply.
pub const HIDPP10_ERROR_SUB_ID: u8 = 0x8f;

/// The feature index of a HID++2.0 error reply.
pub const HIDPP20_ERROR_FEATURE_INDEX: u8 = 0xff;

const OFFSET_TYPE: usize = 0;
const OFFSET_DEVICE_INDEX: usize = 1;
const OFFSET_SUB_ID: usize = 2;
const OFFSET_ADDRESS: usize = 3;

/// The two framings a HID++ report can have.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum ReportKind {
    /// 7 bytes in total, 3 bytes of parameters.
    Short = SHORT_REPORT_ID,

    /// 20 bytes in total, 16 bytes of parameters.
    Long = LONG_REPORT_ID,
}

impl ReportKind {
    /// The total length of a report of this kind.
    pub const fn len(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
        }
    }

    /// The length of the parameter region of a report of this kind.
    pub const fn params_len(self) -> usize {
        self.len() - HEADER_LENGTH
    }
}

/// A single HID++ report.
///
/// The buffer always has room for a long report; [`Report::as_bytes`] only
/// exposes the part that belongs to the current [`ReportKind`]. Bytes past the
/// canonical length are kept zeroed so that widening a short report never
/// leaks stale data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Report {
    kind: ReportKind,
    data: [u8; LONG_REPORT_LENGTH],
}

impl Report {
    /// Builds an empty HID++1.0 style report.
    pub fn new(kind: ReportKind, device_index: u8, sub_id: u8, address: u8) -> Self {
        let mut data = [0u8; LONG_REPORT_LENGTH];
        data[OFFSET_TYPE] = kind.into();
        data[OFFSET_DEVICE_INDEX] = device_index;
        data[OFFSET_SUB_ID] = sub_id;
        data[OFFSET_ADDRESS] = address;

        Self { kind, data }
    }

    /// Builds an empty HID++2.0 style report.
    pub fn new_v20(
        kind: ReportKind,
        device_index: u8,
        feature_index: u8,
        function: U4,
        software_id: U4,
    ) -> Self {
        Self::new(
            kind,
            device_index,
            feature_index,
            U4::combine(function, software_id),
        )
    }

    /// Decodes a report from raw bytes.
    ///
    /// Over-long input is truncated and short input zero-extended to the
    /// canonical length of the kind announced in the first byte. The kernel
    /// may hand out reports longer than what the descriptor announces, so this
    /// is not considered an error.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ReportError> {
        let Some(&id) = raw.first() else {
            return Err(ReportError::Empty);
        };
        let kind = ReportKind::try_from(id).map_err(|_| ReportError::InvalidReportKind(id))?;

        let mut data = [0u8; LONG_REPORT_LENGTH];
        let len = raw.len().min(kind.len());
        data[..len].copy_from_slice(&raw[..len]);

        Ok(Self { kind, data })
    }

    /// The framing of the report.
    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Changes the framing of the report.
    ///
    /// Converting a long report to a short one drops all parameters past the
    /// third. Converting a short report to a long one zero-extends it.
    pub fn set_kind(&mut self, kind: ReportKind) {
        if kind == self.kind {
            return;
        }

        self.data[OFFSET_TYPE] = kind.into();
        if kind == ReportKind::Short {
            self.data[SHORT_REPORT_LENGTH..].fill(0);
        }
        self.kind = kind;
    }

    /// The raw bytes of the report, exactly [`ReportKind::len`] long.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.kind.len()]
    }

    pub fn device_index(&self) -> u8 {
        self.data[OFFSET_DEVICE_INDEX]
    }

    pub fn set_device_index(&mut self, device_index: u8) {
        self.data[OFFSET_DEVICE_INDEX] = device_index;
    }

    /// The HID++1.0 sub ID. Shares its byte with [`Self::feature_index`].
    pub fn sub_id(&self) -> u8 {
        self.data[OFFSET_SUB_ID]
    }

    /// The HID++1.0 register address. Shares its byte with the HID++2.0
    /// function and software IDs.
    pub fn address(&self) -> u8 {
        self.data[OFFSET_ADDRESS]
    }

    /// The HID++2.0 feature index.
    pub fn feature_index(&self) -> u8 {
        self.data[OFFSET_SUB_ID]
    }

    /// The HID++2.0 function ID.
    pub fn function(&self) -> U4 {
        U4::from_hi(self.data[OFFSET_ADDRESS])
    }

    /// The HID++2.0 software ID.
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.data[OFFSET_ADDRESS])
    }

    pub fn set_software_id(&mut self, software_id: U4) {
        self.data[OFFSET_ADDRESS] = U4::combine(self.function(), software_id);
    }

    /// The parameter region, 3 or 16 bytes depending on the kind.
    pub fn params(&self) -> &[u8] {
        &self.data[HEADER_LENGTH..self.kind.len()]
    }

    pub fn params_mut(&mut self) -> &mut [u8] {
        let len = self.kind.len();
        &mut self.data[HEADER_LENGTH..len]
    }

    /// Copies `params` into the parameter region. Anything not fitting the
    /// current kind is dropped.
    pub fn set_params(&mut self, params: &[u8]) {
        let region = self.params_mut();
        let len = params.len().min(region.len());
        region[..len].copy_from_slice(&params[..len]);
    }

    /// Returns the parameters widened to the length of a long report.
    pub fn extend_params(&self) -> [u8; LONG_PARAMS_LENGTH] {
        let mut params = [0u8; LONG_PARAMS_LENGTH];
        params.copy_from_slice(&self.data[HEADER_LENGTH..]);
        params
    }

    /// Checks whether this is a HID++1.0 error reply.
    pub fn hidpp10_error(&self) -> Option<ErrorReport10> {
        if self.kind != ReportKind::Short || self.sub_id() != HIDPP10_ERROR_SUB_ID {
            return None;
        }

        let params = self.params();
        Some(ErrorReport10 {
            device_index: self.device_index(),
            sub_id: self.address(),
            address: params[0],
            code: params[1],
        })
    }

    /// Checks whether this is a HID++2.0 error reply.
    pub fn hidpp20_error(&self) -> Option<ErrorReport20> {
        if self.kind != ReportKind::Long || self.feature_index() != HIDPP20_ERROR_FEATURE_INDEX {
            return None;
        }

        let params = self.params();
        let (function, software_id) = U4::split(params[0]);
        Some(ErrorReport20 {
            device_index: self.device_index(),
            feature_index: self.address(),
            function,
            software_id,
            code: params[1],
        })
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Report({:?}", self.kind)?;
        for byte in &self.as_bytes()[1..] {
            write!(f, " {byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// The decoded body of a HID++1.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ErrorReport10 {
    pub device_index: u8,

    /// The sub ID of the request that failed.
    pub sub_id: u8,

    /// The register address of the request that failed.
    pub address: u8,

    /// The raw error code, see [`crate::protocol::v10::ErrorCode`].
    pub code: u8,
}

/// The decoded body of a HID++2.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ErrorReport20 {
    pub device_index: u8,

    /// The feature index of the request that failed.
    pub feature_index: u8,

    pub function: U4,

    pub software_id: U4,

    /// The raw error code, see [`crate::protocol::v20::ErrorCode`].
    pub code: u8,
}

/// Represents an error that occurred when decoding a report.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ReportError {
    /// The buffer did not contain a single byte.
    #[error("the report is empty")]
    Empty,

    /// The first byte is not one of the HID++ report IDs.
    #[error("{0:#04x} is not a HID++ report ID")]
    InvalidReportKind(u8),
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn kind_strategy() -> impl Strategy<Value = ReportKind> {
        prop_oneof![Just(ReportKind::Short), Just(ReportKind::Long)]
    }

    proptest! {
        #[test]
        fn decode_keeps_header_fields(
            kind in kind_strategy(),
            device_index: u8,
            feature_index: u8,
            function in 0u8..16,
            software_id in 0u8..16,
            params in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut report = Report::new_v20(
                kind,
                device_index,
                feature_index,
                U4::from_lo(function),
                U4::from_lo(software_id),
            );
            report.set_params(&params);

            let decoded = Report::from_bytes(report.as_bytes()).unwrap();
            prop_assert_eq!(decoded.kind(), kind);
            prop_assert_eq!(decoded.device_index(), device_index);
            prop_assert_eq!(decoded.feature_index(), feature_index);
            prop_assert_eq!(decoded.function().to_lo(), function);
            prop_assert_eq!(decoded.software_id().to_lo(), software_id);

            let kept = params.len().min(kind.params_len());
            prop_assert_eq!(&decoded.params()[..kept], &params[..kept]);
            prop_assert!(decoded.params()[kept..].iter().all(|&b| b == 0));
        }

        #[test]
        fn decode_normalizes_length(kind in kind_strategy(), extra in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut raw = vec![u8::from(kind)];
            raw.extend_from_slice(&extra);

            let decoded = Report::from_bytes(&raw).unwrap();
            prop_assert_eq!(decoded.as_bytes().len(), kind.len());
        }
    }

    #[test]
    fn rejects_unknown_report_ids() {
        assert_eq!(
            Report::from_bytes(&[0x12, 0xff, 0x00]),
            Err(ReportError::InvalidReportKind(0x12))
        );
        assert_eq!(Report::from_bytes(&[]), Err(ReportError::Empty));
    }

    #[test]
    fn long_to_short_truncates() {
        let mut report = Report::new(ReportKind::Long, 0x01, 0x83, 0xb5);
        report.set_params(&[1, 2, 3, 4, 5, 6]);
        report.set_kind(ReportKind::Short);

        assert_eq!(report.as_bytes(), &[0x10, 0x01, 0x83, 0xb5, 1, 2, 3]);

        report.set_kind(ReportKind::Long);
        assert_eq!(&report.params()[..6], &[1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn detects_hidpp10_errors() {
        let report =
            Report::from_bytes(&[0x10, 0x02, 0x8f, 0x81, 0xb5, 0x09, 0x00]).unwrap();

        assert_eq!(
            report.hidpp10_error(),
            Some(ErrorReport10 {
                device_index: 0x02,
                sub_id: 0x81,
                address: 0xb5,
                code: 0x09,
            })
        );
        assert_eq!(report.hidpp20_error(), None);
    }

    #[test]
    fn detects_hidpp20_errors() {
        let mut raw = [0u8; LONG_REPORT_LENGTH];
        raw[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x04, 0x12, 0x06]);
        let report = Report::from_bytes(&raw).unwrap();

        assert_eq!(
            report.hidpp20_error(),
            Some(ErrorReport20 {
                device_index: 0x01,
                feature_index: 0x04,
                function: U4::from_lo(0x1),
                software_id: U4::from_lo(0x2),
                code: 0x06,
            })
        );
        assert_eq!(report.hidpp10_error(), None);
    }

    #[test]
    fn short_reports_are_never_hidpp20_errors() {
        let report = Report::from_bytes(&[0x10, 0x01, 0xff, 0x04, 0x12, 0x06, 0x00]).unwrap();
        assert_eq!(report.hidpp20_error(), None);
    }
}
