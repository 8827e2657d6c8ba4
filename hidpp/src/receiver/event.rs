//! Parses the HID++1.0 notifications a receiver sends about its devices and
//! about pairing.
//!
//! All notifications are short or long reports whose sub ID identifies the
//! notification. The payload starts at the address byte (byte 3).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::report::{DEFAULT_DEVICE_INDEX, Report, SHORT_REPORT_ID};

/// Sub IDs of the receiver notifications.
pub mod sub_id {
    pub const DEVICE_DISCONNECTION: u8 = 0x40;
    pub const DEVICE_CONNECTION: u8 = 0x41;
    pub const PAIRING_LOCK: u8 = 0x4a;
    pub const PASSKEY_REQUEST: u8 = 0x4d;
    pub const PASSKEY_PRESSED: u8 = 0x4e;
    pub const DISCOVERY: u8 = 0x4f;
    pub const DISCOVERY_STATUS: u8 = 0x53;
    pub const PAIRING_STATUS: u8 = 0x54;
}

/// The length of the payload buffer. Long reports carry 17 bytes after the
/// sub ID.
const PAYLOAD_LENGTH: usize = 17;

/// Represents the kind of a device paired with a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum DeviceKind {
    Unknown = 0x00,
    Keyboard = 0x01,
    Mouse = 0x02,
    Numpad = 0x03,
    Presenter = 0x04,
    Remote = 0x07,
    Trackball = 0x08,
    Touchpad = 0x09,
    Tablet = 0x0a,
    Gamepad = 0x0b,
    Joystick = 0x0c,
    Headset = 0x0d,
}

impl DeviceKind {
    /// Maps the lower nibble of a kind byte, unknown values becoming
    /// [`Self::Unknown`].
    pub fn from_nibble(raw: u8) -> Self {
        Self::try_from(raw & 0x0f).unwrap_or(Self::Unknown)
    }
}

/// A device connected to, or lost the link to, a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceConnection {
    /// The slot of the device, used as its device index.
    pub index: u8,
    pub kind: DeviceKind,
    pub encrypted: bool,

    /// Cleared when the link was lost, usually because the device went to
    /// sleep.
    pub online: bool,

    /// The wireless product ID.
    pub wpid: u16,
}

/// The announcement of a device ready to pair, found during discovery.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiscoveredDevice {
    /// Running sequence number of discovery notifications.
    pub counter: u16,
    pub kind: DeviceKind,
    pub wpid: u16,

    /// The address to pass to the pairing request.
    pub address: [u8; 6],

    /// The length of the name delivered in following chunks.
    pub name_length: u8,

    /// The authentication methods the device supports.
    pub authentication: u8,
}

/// A chunk of the name of a discovered device.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiscoveredName {
    pub counter: u16,
    pub chunk: Vec<u8>,
}

/// Represents a notification sent by a receiver.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub enum ReceiverEvent {
    DeviceConnection(DeviceConnection),

    /// The device in the slot was unpaired.
    DeviceDisconnection { index: u8 },

    DiscoveredDevice(DiscoveredDevice),
    DiscoveredName(DiscoveredName),

    /// Discovery was started or stopped. `error` is 0 unless discovery was
    /// aborted.
    DiscoveryStatus { discovering: bool, error: u8 },

    /// The pairing process started or ended. Once ended, `error` is 0 and
    /// `slot` holds the new slot on success.
    PairingStatus {
        pairing: bool,
        error: u8,
        address: [u8; 6],
        slot: Option<u8>,
    },

    /// The pairing lock of a Unifying receiver opened or closed.
    PairingLock { open: bool, error: u8 },

    /// The passkey the user has to enter on the device being paired.
    ///
    /// For mice the passkey is a number whose least significant bits are the
    /// sequence of left (`0`) and right (`1`) clicks to perform.
    PasskeyRequest { address: [u8; 6], passkey: String },

    /// The user pressed a key while entering the passkey.
    PasskeyPressed { address: [u8; 6], press_type: u8 },
}

impl ReceiverEvent {
    /// Whether a raw report may be a receiver notification.
    pub fn matches(raw: &[u8]) -> bool {
        let (Some(&device_index), Some(&sub_id)) = (raw.get(1), raw.get(2)) else {
            return false;
        };

        match sub_id {
            sub_id::DEVICE_CONNECTION | sub_id::DEVICE_DISCONNECTION => {
                raw[0] == SHORT_REPORT_ID && (1..=6).contains(&device_index)
            },
            sub_id::PAIRING_LOCK
            | sub_id::PASSKEY_REQUEST
            | sub_id::PASSKEY_PRESSED
            | sub_id::DISCOVERY
            | sub_id::DISCOVERY_STATUS
            | sub_id::PAIRING_STATUS => device_index == DEFAULT_DEVICE_INDEX,
            _ => false,
        }
    }

    /// Parses a notification. Returns [`None`] for reports that are no
    /// notification or that are malformed.
    pub fn parse(report: &Report) -> Option<Self> {
        if !Self::matches(report.as_bytes()) {
            return None;
        }

        let mut payload = [0u8; PAYLOAD_LENGTH];
        let raw = &report.as_bytes()[3..];
        payload[..raw.len()].copy_from_slice(raw);

        let address = |start: usize| -> [u8; 6] {
            let mut address = [0u8; 6];
            address.copy_from_slice(&payload[start..start + 6]);
            address
        };
        let counter = u16::from(payload[0]) + u16::from(payload[1]) * 256;

        Some(match report.sub_id() {
            sub_id::DEVICE_CONNECTION => Self::DeviceConnection(DeviceConnection {
                index: report.device_index(),
                kind: DeviceKind::from_nibble(payload[1]),
                encrypted: payload[1] & (1 << 5) != 0,
                online: payload[1] & (1 << 6) == 0,
                wpid: u16::from_le_bytes([payload[2], payload[3]]),
            }),
            sub_id::DEVICE_DISCONNECTION => Self::DeviceDisconnection {
                index: report.device_index(),
            },
            sub_id::DISCOVERY => match payload[2] {
                0 => Self::DiscoveredDevice(DiscoveredDevice {
                    counter,
                    kind: DeviceKind::from_nibble(payload[4]),
                    wpid: u16::from_le_bytes([payload[5], payload[6]]),
                    address: address(7),
                    name_length: payload[13],
                    authentication: payload[15],
                }),
                1 => {
                    let end = (4 + payload[3] as usize).min(PAYLOAD_LENGTH);
                    Self::DiscoveredName(DiscoveredName {
                        counter,
                        chunk: payload[4..end].to_vec(),
                    })
                },
                _ => return None,
            },
            sub_id::DISCOVERY_STATUS => Self::DiscoveryStatus {
                discovering: payload[0] == 0x00,
                error: payload[1],
            },
            sub_id::PAIRING_STATUS => Self::PairingStatus {
                pairing: payload[0] == 0x01,
                error: payload[1],
                address: address(2),
                slot: Some(payload[8]).filter(|&slot| slot != 0),
            },
            sub_id::PAIRING_LOCK => Self::PairingLock {
                open: payload[0] & 0x01 != 0,
                error: payload[1],
            },
            sub_id::PASSKEY_REQUEST => Self::PasskeyRequest {
                passkey: String::from_utf8_lossy(&payload[1..=6]).into_owned(),
                address: address(7),
            },
            sub_id::PASSKEY_PRESSED => Self::PasskeyPressed {
                press_type: payload[0],
                address: address(1),
            },
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Option<ReceiverEvent> {
        ReceiverEvent::parse(&Report::from_bytes(raw).unwrap())
    }

    #[test]
    fn parses_connections() {
        let event = parse(&[0x10, 0x02, 0x41, 0x10, 0x42, 0x34, 0x40]).unwrap();

        assert_eq!(
            event,
            ReceiverEvent::DeviceConnection(DeviceConnection {
                index: 0x02,
                kind: DeviceKind::Mouse,
                encrypted: false,
                online: false,
                wpid: 0x4034,
            })
        );
    }

    #[test]
    fn parses_discovery() {
        let mut raw = [0u8; 20];
        raw[..3].copy_from_slice(&[0x11, 0xff, 0x4f]);
        raw[3..=5].copy_from_slice(&[0x07, 0x00, 0x00]);
        raw[7] = 0x02;
        raw[8..=9].copy_from_slice(&[0x34, 0x40]);
        raw[10..=15].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        raw[16] = 9;
        raw[18] = 0x0a;

        let ReceiverEvent::DiscoveredDevice(device) = parse(&raw).unwrap() else {
            panic!("not a discovered device");
        };
        assert_eq!(device.counter, 7);
        assert_eq!(device.kind, DeviceKind::Mouse);
        assert_eq!(device.wpid, 0x4034);
        assert_eq!(device.address, [1, 2, 3, 4, 5, 6]);
        assert_eq!(device.name_length, 9);
        assert_eq!(device.authentication, 0x0a);
    }

    #[test]
    fn ignores_reports_of_devices() {
        // A HID++2.0 reply from a device with feature index 0x41
        assert!(parse(&[0x10, 0xff, 0x41, 0x12, 0x00, 0x00, 0x00]).is_none());
        assert!(parse(&[0x10, 0x01, 0x4f, 0x00, 0x00, 0x00, 0x00]).is_none());
        assert!(parse(&[0x10, 0xff, 0x81, 0x02, 0x00, 0x00, 0x00]).is_none());

        // A long HID++2.0 report of a child whose feature index is 0x41
        let mut long = [0u8; 20];
        long[..4].copy_from_slice(&[0x11, 0x01, 0x41, 0x12]);
        assert!(!ReceiverEvent::matches(&long));
        assert!(parse(&long).is_none());
    }
}
