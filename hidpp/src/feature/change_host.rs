//! Implements the `ChangeHost` / `0x1814` feature.

use std::sync::Arc;

use super::{CreatableFeature, Feature, FeatureError};
use crate::{device::Device, nibble::U4};

/// Switches a multi-host device between its hosts.
#[derive(Clone, Debug)]
pub struct ChangeHost {
    device: Arc<Device>,
    index: u8,
}

impl CreatableFeature for ChangeHost {
    const ID: u16 = 0x1814;

    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError> {
        Ok(Self { device, index })
    }
}

impl Feature for ChangeHost {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        self.index
    }
}

/// The host slots of a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HostInfo {
    pub host_count: u8,

    /// Zero based.
    pub current_host: u8,
}

impl ChangeHost {
    pub fn host_info(&self) -> Result<HostInfo, FeatureError> {
        let payload = self.device.transact(self.index, U4::from_lo(0), &[])?;
        Ok(HostInfo {
            host_count: payload[0],
            current_host: payload[1],
        })
    }

    /// Switches to another host.
    ///
    /// The device disconnects right away and never replies, so the request is
    /// sent without waiting.
    pub fn set_host(&self, host: u8) -> Result<(), FeatureError> {
        let info = self.host_info()?;
        if host >= info.host_count {
            return Err(FeatureError::UnsupportedResponse);
        }
        if host == info.current_host {
            return Ok(());
        }

        self.device
            .transact_no_response(self.index, U4::from_lo(1), &[host])?;
        Ok(())
    }
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
        transport::tests::reply,
    };

    #[test]
    fn switches_hosts_without_waiting() {
        let (channel, state) = mock::channel(0xc548);
        let mut mouse = hidpp20_mouse(&[(0x1814, 0x0b)], "MX Test");
        state.respond_with(move |request| match (request[2], request[3] >> 4) {
            (0x0b, 0) => vec![reply(request, &[0x03, 0x00])],
            // Switching hosts is never answered.
            (0x0b, 1) => Vec::new(),
            _ => mouse(request),
        });
        let device = Device::new(&context(), channel, 0x01, DeviceHint::default()).unwrap();
        let change_host = device.get_feature::<ChangeHost>().unwrap();

        change_host.set_host(2).unwrap();

        let last = state.writes().last().cloned().unwrap();
        assert_eq!(&last[..5], &[0x10, 0x01, 0x0b, 0x1f, 0x02]);

        assert!(matches!(
            change_host.set_host(5),
            Err(FeatureError::UnsupportedResponse)
        ));
    }
}
