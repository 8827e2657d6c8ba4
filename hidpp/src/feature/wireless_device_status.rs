//! Implements the `WirelessDeviceStatus` / `0x1d4b` feature.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{CreatableFeature, Feature, FeatureError};
use crate::{channel::HandlerHandle, device::Device, nibble::U4};

/// Delivers the status broadcast a wireless device sends when it
/// (re)connects to the host.
#[derive(Clone, Debug)]
pub struct WirelessDeviceStatus {
    device: Arc<Device>,
    index: u8,
}

impl CreatableFeature for WirelessDeviceStatus {
    const ID: u16 = 0x1d4b;

    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError> {
        Ok(Self { device, index })
    }
}

impl Feature for WirelessDeviceStatus {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        self.index
    }
}

impl WirelessDeviceStatus {
    /// Registers a callback for status broadcasts. The callback runs on the
    /// reader thread.
    pub fn listen(
        &self,
        callback: impl Fn(StatusBroadcast) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.device.subscribe_feature(self.index, move |report| {
            if report.function() != U4::from_lo(0) {
                return;
            }

            let params = report.params();
            callback(StatusBroadcast {
                status: params[0],
                request: params[1],
                reason: params[2],
            });
        })
    }
}

/// A status broadcast. Unknown values are kept raw.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatusBroadcast {
    pub status: u8,
    pub request: u8,
    pub reason: u8,
}

impl StatusBroadcast {
    pub fn status(&self) -> Option<Status> {
        Status::try_from(self.status).ok()
    }

    pub fn request(&self) -> Option<Request> {
        Request::try_from(self.request).ok()
    }

    pub fn reason(&self) -> Option<Reason> {
        Reason::try_from(self.reason).ok()
    }

    /// Whether the device lost its settings and wants them applied again.
    pub fn reconfiguration_required(&self) -> bool {
        self.request() == Some(Request::SoftwareReconfigurationNeeded)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Status {
    Unknown = 0x00,
    Reconnection = 0x01,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Request {
    NoRequest = 0x00,
    SoftwareReconfigurationNeeded = 0x01,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Reason {
    Unknown = 0x00,
    PowerSwitchActivated = 0x01,
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;
    use crate::{
        channel::mock,
        device::{
            DeviceHint,
            tests::{context, hidpp20_mouse},
        },
    };

    #[test]
    fn reconnection_triggers_wakeup_hooks() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(hidpp20_mouse(&[(0x1d4b, 0x07)], "MX Test"));
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();

        let (sender, receiver) = mpsc::channel();
        device.add_wakeup_hook(move |device| {
            let _ = sender.send(device.name());
        });
        device.sleep();

        state.inject(&[0x10, 0x01, 0x07, 0x00, 0x01, 0x01, 0x01]);

        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(1)).unwrap(),
            "Mock c548"
        );
    }

    #[test]
    fn decodes_broadcasts() {
        let broadcast = StatusBroadcast {
            status: 0x01,
            request: 0x00,
            reason: 0x07,
        };

        assert_eq!(broadcast.status(), Some(Status::Reconnection));
        assert!(!broadcast.reconfiguration_required());
        assert_eq!(broadcast.reason(), None);
    }
}
