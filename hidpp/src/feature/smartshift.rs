//! Implements the SmartShift features controlling the ratchet of the scroll
//! wheel: `SmartShiftWheel` / `0x2110` and `SmartShiftWheelEnhanced` /
//! `0x2111`.
//!
//! Both share the same status layout but expose it through different
//! functions. The variant is picked once when attaching; afterwards callers
//! use a single client no matter which one the device has.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;

use super::{CreatableFeature, Feature, FeatureError};
use crate::{device::Device, nibble::U4};

/// The ID of the legacy variant.
pub const SMARTSHIFT_ID: u16 = 0x2110;

/// The ID of the enhanced variant supporting a tunable torque.
pub const SMARTSHIFT_ENHANCED_ID: u16 = 0x2111;

/// Which variant of SmartShift a device implements, and what it can do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SmartShiftCapabilities {
    pub enhanced: bool,

    /// Whether the force needed to disengage the ratchet can be set.
    pub tunable_torque: bool,

    pub default_torque: u8,
}

impl SmartShiftCapabilities {
    const LEGACY: Self = Self {
        enhanced: false,
        tunable_torque: false,
        default_torque: 0,
    };

    fn get_status(&self) -> U4 {
        U4::from_lo(if self.enhanced { 1 } else { 0 })
    }

    fn set_status(&self) -> U4 {
        U4::from_lo(if self.enhanced { 2 } else { 1 })
    }
}

/// Controls the SmartShift ratchet of a mouse wheel.
#[derive(Clone, Debug)]
pub struct SmartShift {
    device: Arc<Device>,
    index: u8,
    capabilities: SmartShiftCapabilities,
}

impl CreatableFeature for SmartShift {
    /// The legacy ID. [`Device::get_feature`] resolves this one, prefer
    /// [`SmartShift::attach_any`] to pick the enhanced variant when present.
    const ID: u16 = SMARTSHIFT_ID;

    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError> {
        Ok(Self {
            device,
            index,
            capabilities: SmartShiftCapabilities::LEGACY,
        })
    }
}

impl Feature for SmartShift {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        self.index
    }
}

impl SmartShift {
    /// Attaches to the enhanced variant if the device has it, else to the
    /// legacy one.
    pub fn attach_any(device: &Arc<Device>) -> Result<Self, FeatureError> {
        match device.feature_index(SMARTSHIFT_ENHANCED_ID) {
            Ok(index) => {
                let payload = device.transact(index, U4::from_lo(0), &[])?;
                let capabilities = SmartShiftCapabilities {
                    enhanced: true,
                    tunable_torque: payload[0] & 0x01 != 0,
                    default_torque: payload[2],
                };
                debug!(name = %device.name(), ?capabilities, "using enhanced SmartShift");

                Ok(Self {
                    device: Arc::clone(device),
                    index,
                    capabilities,
                })
            },
            Err(FeatureError::Unsupported(_)) => device.get_feature::<Self>(),
            Err(err) => Err(err),
        }
    }

    pub fn capabilities(&self) -> SmartShiftCapabilities {
        self.capabilities
    }

    /// Retrieves the current ratchet state.
    ///
    /// [`SmartShiftStatus::wheel_mode`] only reflects the value set by
    /// software or the mode button, not whether the wheel is currently
    /// disengaged automatically.
    pub fn status(&self) -> Result<SmartShiftStatus, FeatureError> {
        let payload = self
            .device
            .transact(self.index, self.capabilities.get_status(), &[])?;

        Ok(SmartShiftStatus {
            wheel_mode: WheelMode::try_from(payload[0])
                .map_err(|_| FeatureError::UnsupportedResponse)?,
            auto_disengage: payload[1],
            torque: if self.capabilities.enhanced {
                payload[2]
            } else {
                0
            },
        })
    }

    /// Changes the ratchet state. Values left at [`None`] keep their current
    /// setting.
    ///
    /// `auto_disengage` is the wheel speed in quarter turns per second at
    /// which the ratchet disengages, `0xff` keeps it engaged permanently. The
    /// torque is ignored by the legacy variant.
    pub fn set_status(
        &self,
        wheel_mode: Option<WheelMode>,
        auto_disengage: Option<u8>,
        torque: Option<u8>,
    ) -> Result<(), FeatureError> {
        let mut params = vec![
            wheel_mode.map_or(0, u8::from),
            auto_disengage.unwrap_or(0),
        ];
        if self.capabilities.enhanced {
            params.push(torque.filter(|_| self.capabilities.tunable_torque).unwrap_or(0));
        } else {
            // The third byte is the default auto disengage value here.
            params.push(0);
        }

        self.device
            .transact(self.index, self.capabilities.set_status(), &params)?;
        Ok(())
    }
}

/// The ratchet state of the scroll wheel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SmartShiftStatus {
    pub wheel_mode: WheelMode,

    /// Quarter turns per second it takes to disengage the ratchet. `0xff`
    /// keeps it engaged.
    pub auto_disengage: u8,

    /// The force needed to disengage the ratchet. Always 0 on the legacy
    /// variant.
    pub torque: u8,
}

/// Represents the ratchet mode of the scroll wheel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[non_exhaustive]
#[repr(u8)]
pub enum WheelMode {
    Freespin = 1,
    Ratchet = 2,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        channel::mock,
        device::{
            DeviceHint,
            tests::{context, hidpp20_mouse},
        },
        transport::tests::reply,
    };

    fn mouse_with(features: &'static [(u16, u8)]) -> (Arc<Device>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (channel, state) = mock::channel(0xc548);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mouse = hidpp20_mouse(features, "MX Test");

        state.respond_with({
            let seen = Arc::clone(&seen);
            move |request| match request[2] {
                0x06 => {
                    seen.lock().unwrap().push(request.to_vec());
                    let params = match request[3] >> 4 {
                        // Enhanced capabilities: tunable torque, default 50
                        0 if features.iter().any(|f| f.0 == SMARTSHIFT_ENHANCED_ID) => {
                            vec![0x01, 0x00, 0x32]
                        },
                        0 | 1 => vec![0x02, 0x0a, 0x1e],
                        _ => vec![],
                    };
                    vec![reply(request, &params)]
                },
                _ => mouse(request),
            }
        });

        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();
        (device, seen)
    }

    #[test]
    fn prefers_the_enhanced_variant() {
        let (device, seen) = mouse_with(&[(0x2110, 0x05), (0x2111, 0x06)]);
        let smartshift = SmartShift::attach_any(&device).unwrap();

        assert!(smartshift.capabilities().enhanced);
        assert!(smartshift.capabilities().tunable_torque);
        assert_eq!(smartshift.capabilities().default_torque, 0x32);

        let status = smartshift.status().unwrap();
        assert_eq!(status.wheel_mode, WheelMode::Ratchet);
        assert_eq!(status.torque, 0x1e);

        smartshift
            .set_status(Some(WheelMode::Freespin), None, Some(0x20))
            .unwrap();
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last[3] >> 4, 2);
        assert_eq!(&last[4..7], &[0x01, 0x00, 0x20]);
    }

    #[test]
    fn falls_back_to_the_legacy_variant() {
        let (device, _seen) = mouse_with(&[(0x2110, 0x06)]);
        let smartshift = SmartShift::attach_any(&device).unwrap();

        assert!(!smartshift.capabilities().enhanced);
        let status = smartshift.status().unwrap();
        assert_eq!(status.auto_disengage, 0x0a);
        assert_eq!(status.torque, 0);
    }
}
