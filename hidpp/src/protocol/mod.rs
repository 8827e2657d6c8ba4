//! Implements the protocol-specific parts of HID++.

use std::fmt;

use tracing::debug;

use crate::{
    nibble::U4,
    report::{Report, ReportKind},
    transport::{TransactError, Transport},
};

pub mod v10;
pub mod v20;

/// The feature index of the root feature, present on every HID++2.0 device.
const ROOT_FEATURE_INDEX: u8 = 0x00;

/// The function of the root feature echoing its third parameter byte.
const ROOT_PING_FUNCTION: U4 = U4::from_lo(0x1);

/// The amount of pings a HID++2.0 device has to answer before it is
/// considered stable.
const STABILITY_PINGS: usize = 3;

/// Represents the protocol version a device supports.
///
/// HID++1.0 devices are pinned to `1.0`. For HID++2.0 devices, the two values
/// are the protocol number and target software fields of the ping reply.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };

    pub fn is_v20(&self) -> bool {
        self.major >= 2
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn ping_request(ping_byte: u8) -> Report {
    let mut report = Report::new_v20(
        ReportKind::Short,
        0,
        ROOT_FEATURE_INDEX,
        ROOT_PING_FUNCTION,
        U4::default(),
    );
    report.set_params(&[0x00, 0x00, ping_byte]);
    report
}

/// Determines the protocol version of the device a transport is bound to.
///
/// A HID++2.0 ping is sent to the root feature. HID++2.0 devices answer with
/// their version, HID++1.0 devices with an "invalid sub ID" error. Some
/// HID++1.0 devices instead echo the request verbatim, which is treated as
/// version 1.0 as well.
pub fn determine_version(transport: &Transport) -> Result<ProtocolVersion, TransactError> {
    let request = ping_request(rand::random());

    match transport.transact20(request) {
        Ok(response) if response.params() == request.params() => {
            debug!(
                device_index = transport.device_index(),
                "ping was echoed, assuming HID++1.0"
            );
            Ok(ProtocolVersion::V1_0)
        },
        Ok(response) => {
            let params = response.params();
            Ok(ProtocolVersion {
                major: params[0],
                minor: params[1],
            })
        },
        Err(TransactError::Hidpp10(err)) if err.is(v10::ErrorCode::InvalidSubId) => {
            Ok(ProtocolVersion::V1_0)
        },
        Err(err) => Err(err),
    }
}

/// Checks whether a HID++2.0 device reliably answers requests.
///
/// Sends pings with distinct random payloads and requires each to be echoed
/// exactly. Returns `Ok(false)` on the first mismatch.
pub fn check_stability(transport: &Transport) -> Result<bool, TransactError> {
    let mut rng = rand::rng();

    for ping_byte in rand::seq::index::sample(&mut rng, 256, STABILITY_PINGS) {
        let ping_byte = ping_byte as u8;
        let response = transport.transact20(ping_request(ping_byte))?;

        if response.params()[2] != ping_byte {
            debug!(
                device_index = transport.device_index(),
                expected = ping_byte,
                got = response.params()[2],
                "ping answered with the wrong payload"
            );
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::mock,
        options::Options,
        transport::tests::{reply, v10_error},
    };

    fn transport(responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Transport {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(responder);
        Transport::new(channel, 0x01, &Options::default())
    }

    #[test]
    fn reads_hidpp20_versions() {
        let transport = transport(|request| vec![reply(request, &[0x04, 0x05, request[6]])]);

        assert_eq!(
            determine_version(&transport).unwrap(),
            ProtocolVersion { major: 4, minor: 5 }
        );
    }

    #[test]
    fn invalid_sub_id_means_hidpp10() {
        let transport = transport(|request| vec![v10_error(request, v10::ErrorCode::InvalidSubId)]);

        assert_eq!(determine_version(&transport).unwrap(), ProtocolVersion::V1_0);
    }

    #[test]
    fn echoed_ping_means_hidpp10() {
        let transport = transport(|request| vec![request.to_vec()]);

        assert_eq!(determine_version(&transport).unwrap(), ProtocolVersion::V1_0);
    }

    #[test]
    fn other_hidpp10_errors_are_propagated() {
        let transport = transport(|request| vec![v10_error(request, v10::ErrorCode::ResourceError)]);

        assert!(matches!(
            determine_version(&transport),
            Err(TransactError::Hidpp10(err)) if err.is(v10::ErrorCode::ResourceError)
        ));
    }

    #[test]
    fn stable_devices_echo_every_ping() {
        let transport = transport(|request| vec![reply(request, &[0x04, 0x02, request[6]])]);
        assert!(check_stability(&transport).unwrap());
    }

    #[test]
    fn wrong_payloads_are_unstable() {
        let transport =
            transport(|request| vec![reply(request, &[0x04, 0x02, request[6].wrapping_add(1)])]);
        assert!(!check_stability(&transport).unwrap());
    }
}
