//! Implements the `DeviceTypeAndName` / `0x0005` feature.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{CreatableFeature, Feature, FeatureError};
use crate::{device::Device, nibble::U4};

/// Reads the marketing name and type of a device.
#[derive(Clone, Debug)]
pub struct DeviceName {
    device: Arc<Device>,
    index: u8,
}

impl CreatableFeature for DeviceName {
    const ID: u16 = 0x0005;

    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError> {
        Ok(Self { device, index })
    }
}

impl Feature for DeviceName {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        self.index
    }
}

impl DeviceName {
    /// Retrieves the amount of characters in the marketing name of the device.
    pub fn name_length(&self) -> Result<u8, FeatureError> {
        Ok(self.device.transact(self.index, U4::from_lo(0), &[])?[0])
    }

    /// Retrieves a chunk of the marketing name, starting at `offset`.
    ///
    /// Depending on the report kinds the channel supports, the chunk holds at
    /// most 3 or 16 characters. Trailing bytes past the end of the name are
    /// zero.
    pub fn name_chunk(&self, offset: u8) -> Result<[u8; 16], FeatureError> {
        Ok(self.device.transact(self.index, U4::from_lo(1), &[offset])?)
    }

    /// Retrieves the whole marketing name.
    pub fn name(&self) -> Result<String, FeatureError> {
        let length = self.name_length()? as usize;
        let mut name = Vec::with_capacity(length);

        while name.len() < length {
            let chunk = self.name_chunk(name.len() as u8)?;
            let take = chunk
                .iter()
                .take(length - name.len())
                .take_while(|&&byte| byte != 0)
                .count();
            if take == 0 {
                break;
            }
            name.extend_from_slice(&chunk[..take]);
        }

        String::from_utf8(name).map_err(|_| FeatureError::UnsupportedResponse)
    }

    pub fn device_type(&self) -> Result<DeviceType, FeatureError> {
        let payload = self.device.transact(self.index, U4::from_lo(2), &[])?;
        DeviceType::try_from(payload[0]).map_err(|_| FeatureError::UnsupportedResponse)
    }
}

/// Represents the marketing type of a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum DeviceType {
    Keyboard = 0,
    RemoteControl = 1,
    Numpad = 2,
    Mouse = 3,
    Trackpad = 4,
    Trackball = 5,
    Presenter = 6,
    Receiver = 7,
    Headset = 8,
    Webcam = 9,
    SteeringWheel = 10,
    Joystick = 11,
    Gamepad = 12,
    Dock = 13,
    Speaker = 14,
    Microphone = 15,
    IlluminationLight = 16,
    ProgrammableController = 17,
    CarSimPedals = 18,
    Adapter = 19,
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
    };

    #[test]
    fn reads_names_in_chunks() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(hidpp20_mouse(&[(0x0005, 0x01)], "MX Master 3S"));
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();

        let feature = device.get_feature::<DeviceName>().unwrap();
        assert_eq!(feature.name_length().unwrap(), 12);
        assert_eq!(feature.name().unwrap(), "MX Master 3S");
    }
}
