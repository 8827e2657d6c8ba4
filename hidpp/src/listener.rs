//! The interface through which the core reports devices to the rest of the
//! application.

use std::sync::Arc;

use crate::{
    device::{Device, DeviceState},
    receiver::{Receiver, pairing::PairingOutcome},
};

/// Receives notifications about devices and receivers.
///
/// Every method has an empty default implementation. Methods are called from
/// worker threads and, for pairing prompts and state changes, from the reader
/// thread of a channel, so implementations must return quickly and must not
/// run transactions directly.
pub trait DeviceListener: Send + Sync {
    /// A device was probed and is ready to be configured.
    fn device_added(&self, _device: &Arc<Device>) {}

    /// A device was unplugged or unpaired. Its session is closed.
    fn device_removed(&self, _device: &Arc<Device>) {}

    fn state_changed(&self, _device: &Arc<Device>, _state: DeviceState) {}

    fn receiver_added(&self, _receiver: &Arc<Receiver>) {}

    fn receiver_removed(&self, _receiver: &Arc<Receiver>) {}

    /// The user has to enter `passkey` on the device being paired.
    fn pairing_passkey(&self, _receiver: &Receiver, _passkey: &str) {}

    fn pairing_finished(&self, _receiver: &Receiver, _outcome: PairingOutcome) {}
}

/// A listener ignoring every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl DeviceListener for NoopListener {}
