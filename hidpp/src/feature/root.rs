//! Implements the Root feature (ID `0x0000`) that every HID++2.0 device
//! supports, and the feature index resolution built on it.

use std::sync::Arc;

use super::{CreatableFeature, Feature, FeatureError, FeatureType};
use crate::{
    device::Device,
    nibble::U4,
    protocol::{ProtocolVersion, v20},
    transport::TransactError,
};

/// Root always lives at index 0.
pub const ROOT_FEATURE_INDEX: u8 = 0x00;

/// Looks up a feature in the feature table of a device.
///
/// Returns `Ok(None)` if the device does not have the feature.
pub fn get_feature(device: &Device, id: u16) -> Result<Option<FeatureInformation>, FeatureError> {
    if id == RootFeature::ID {
        return Ok(Some(FeatureInformation {
            index: ROOT_FEATURE_INDEX,
            typ: FeatureType::default(),
            version: 0,
        }));
    }

    let [hi, lo] = id.to_be_bytes();
    let payload = match device.transact(ROOT_FEATURE_INDEX, U4::from_lo(0), &[hi, lo, 0x00]) {
        Ok(payload) => payload,
        Err(TransactError::Hidpp20(err)) if err.is(v20::ErrorCode::InvalidFeatureIndex) => {
            return Ok(None);
        },
        Err(err) => return Err(err.into()),
    };

    if payload[0] == 0 {
        return Ok(None);
    }

    Ok(Some(FeatureInformation {
        index: payload[0],
        typ: FeatureType::from(payload[1]),
        version: payload[2],
    }))
}

/// Resolves a feature ID to its index in the feature table of a device.
pub fn resolve(device: &Device, id: u16) -> Result<u8, FeatureError> {
    get_feature(device, id)?
        .map(|info| info.index)
        .ok_or(FeatureError::Unsupported(id))
}

/// Implements the `Root` / `0x0000` feature.
#[derive(Clone, Debug)]
pub struct RootFeature {
    device: Arc<Device>,
}

impl CreatableFeature for RootFeature {
    const ID: u16 = 0x0000;

    fn attach(device: Arc<Device>, _: u8) -> Result<Self, FeatureError> {
        Ok(Self { device })
    }
}

impl Feature for RootFeature {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        ROOT_FEATURE_INDEX
    }
}

impl RootFeature {
    /// Retrieves information about a specific feature ID, including its index
    /// in the feature table, its type and its version.
    pub fn get_feature(&self, id: u16) -> Result<Option<FeatureInformation>, FeatureError> {
        get_feature(&self.device, id)
    }

    /// Pings the device with an arbitrary data byte. The device will respond
    /// with the same data if communication succeeds.
    pub fn ping(&self, data: u8) -> Result<u8, FeatureError> {
        let payload = self
            .device
            .transact(ROOT_FEATURE_INDEX, U4::from_lo(1), &[0x00, 0x00, data])?;
        Ok(payload[2])
    }

    /// Retrieves the protocol version, which the same ping function reports.
    pub fn get_version(&self) -> Result<ProtocolVersion, FeatureError> {
        let payload = self
            .device
            .transact(ROOT_FEATURE_INDEX, U4::from_lo(1), &[0x00, 0x00, 0x00])?;
        Ok(ProtocolVersion {
            major: payload[0],
            minor: payload[1],
        })
    }
}

/// Represents information about a specific feature as returned by
/// [`RootFeature::get_feature`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FeatureInformation {
    /// The index of the feature in the feature table.
    /// This is used for invocations of functions of that feature.
    pub index: u8,

    /// The type of the feature.
    pub typ: FeatureType,

    /// The latest supported version of the feature.
    pub version: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::mock,
        device::{
            DeviceHint,
            tests::{context, hidpp20_mouse},
        },
        transport::tests::v20_error,
    };

    #[test]
    fn missing_features_are_unsupported() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(hidpp20_mouse(&[(0x2201, 0x03)], "MX Test"));
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();

        assert_eq!(resolve(&device, 0x2201).unwrap(), 0x03);
        assert_eq!(resolve(&device, 0x0000).unwrap(), 0x00);
        assert!(matches!(
            resolve(&device, 0x2110),
            Err(FeatureError::Unsupported(0x2110))
        ));
    }

    #[test]
    fn invalid_feature_index_errors_are_unsupported() {
        let (channel, state) = mock::channel(0xc548);
        let mut mouse = hidpp20_mouse(&[], "MX Test");
        state.respond_with(move |request| {
            if request[2] == 0x00 && request[3] >> 4 == 0 {
                vec![v20_error(request, v20::ErrorCode::InvalidFeatureIndex)]
            } else {
                mouse(request)
            }
        });
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();

        assert!(get_feature(&device, 0x1814).unwrap().is_none());
    }

    #[test]
    fn pings_echo_their_payload() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(hidpp20_mouse(&[], "MX Test"));
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();
        let root = device.get_feature::<RootFeature>().unwrap();

        assert_eq!(root.ping(0x42).unwrap(), 0x42);
        assert_eq!(root.get_version().unwrap(), ProtocolVersion { major: 4, minor: 2 });
    }
}
