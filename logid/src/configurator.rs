//! Applies the configured settings to devices as they appear and every time
//! they wake up.

use std::sync::Arc;

use logid_hidpp::{
    device::{Device, DeviceState},
    feature::{
        self,
        FeatureError,
        adjustable_dpi::AdjustableDpi,
        smartshift::{SmartShift, WheelMode},
    },
    listener::DeviceListener,
    receiver::{Receiver, pairing::PairingOutcome},
};
use tracing::{debug, info, warn};

use crate::config::{Config, DeviceSettings};

pub struct Configurator {
    config: Arc<Config>,
}

impl Configurator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl DeviceListener for Configurator {
    fn device_added(&self, device: &Arc<Device>) {
        let Some(settings) = self.config.device(&device.name()).cloned() else {
            debug!(name = %device.name(), "no settings for device");
            return;
        };
        let settings = Arc::new(settings);

        device.add_wakeup_hook({
            let settings = Arc::clone(&settings);
            move |device| apply(device, &settings)
        });

        let target = Arc::clone(device);
        device
            .context()
            .pool()
            .execute(move || apply(&target, &settings));
    }

    fn device_removed(&self, device: &Arc<Device>) {
        info!(name = %device.name(), "device gone");
    }

    fn state_changed(&self, device: &Arc<Device>, state: DeviceState) {
        debug!(name = %device.name(), ?state, "device state changed");
    }

    fn receiver_added(&self, receiver: &Arc<Receiver>) {
        info!(kind = ?receiver.kind(), path = %receiver.device().channel().info().path.display(), "receiver added");
    }

    fn pairing_passkey(&self, _receiver: &Receiver, passkey: &str) {
        info!(passkey, "enter the passkey on the device to pair");
    }

    fn pairing_finished(&self, _receiver: &Receiver, outcome: PairingOutcome) {
        info!(?outcome, "pairing finished");
    }
}

/// Applies `settings` to a device. Runs on the worker pool.
fn apply(device: &Arc<Device>, settings: &DeviceSettings) {
    if let Some(dpi) = settings.dpi
        && let Some(feature) = feature::attach::<AdjustableDpi>(device)
    {
        report(device, "dpi", set_dpi(&feature, dpi));
    }

    if let Some(smartshift) = settings.smartshift {
        let result = SmartShift::attach_any(device).and_then(|feature| {
            feature.set_status(
                Some(if smartshift.on {
                    WheelMode::Ratchet
                } else {
                    WheelMode::Freespin
                }),
                smartshift.threshold,
                smartshift.torque,
            )
        });
        report(device, "smartshift", result);
    }
}

fn set_dpi(feature: &AdjustableDpi, dpi: u16) -> Result<(), FeatureError> {
    let value = feature.dpi_list(0)?.closest(dpi).unwrap_or(dpi);
    feature.set_dpi(0, value)
}

fn report(device: &Device, setting: &str, result: Result<(), FeatureError>) {
    match result {
        Ok(()) => debug!(name = %device.name(), setting, "applied setting"),
        Err(FeatureError::Unsupported(_)) => {
            debug!(name = %device.name(), setting, "setting not supported by device");
        },
        Err(err) => warn!(name = %device.name(), setting, %err, "could not apply setting"),
    }
}
