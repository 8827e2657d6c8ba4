//! Implements the session with a wireless receiver, including pairing.
//!
//! A [`Receiver`] is a [`Device`] at index `0xff` plus one child session per
//! paired device, keyed by slot 1 to 6. Children are only created after the
//! receiver announced a connection in the slot and are destroyed as soon as
//! it announces the disconnection.
//!
//! Bolt receivers discover devices before pairing and authenticate them with a
//! passkey. Unifying, Nano and Lightspeed receivers open a pairing lock
//! instead and pair the first device that connects. The registers both
//! families use differ, see [`register`].

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    channel::{HandlerHandle, RawChannel},
    context::Context,
    device::{Device, DeviceError, DeviceHint, DeviceState},
    listener::DeviceListener,
    report::{DEFAULT_DEVICE_INDEX, LONG_PARAMS_LENGTH, LONG_REPORT_ID, Report, SHORT_REPORT_ID},
    transport::TransactError,
};

pub mod event;
pub mod pairing;

use event::{DeviceConnection, DeviceKind, ReceiverEvent};
use pairing::{PairRequest, PairState, Pairing, PairingAction, PairingOutcome};

/// The index to use when communicating with the receiver itself.
pub const RECEIVER_DEVICE_INDEX: u8 = DEFAULT_DEVICE_INDEX;

/// Lets the receiver pick a free slot for a new pairing.
pub const AUTO_SLOT: u8 = 0x00;

/// The error code reported in a [`PairingOutcome`] when the pairing request
/// itself could not be sent.
pub const PAIR_REQUEST_FAILED: u8 = 0xff;

/// The HID++1.0 registers of receivers.
pub mod register {
    /// Enables notifications about wireless devices and software presence.
    pub const NOTIFICATIONS: u8 = 0x00;

    /// Reads the amount of paired devices. Writing `0x02` triggers a
    /// connection notification for every paired device.
    pub const CONNECTIONS: u8 = 0x02;

    /// Opens and closes the pairing lock (not on Bolt).
    pub const PAIRING_LOCK: u8 = 0xb2;

    /// Pairing information and codenames, addressed by sub-register.
    pub const RECEIVER_INFO: u8 = 0xb5;

    /// Starts and stops discovery (Bolt).
    pub const DISCOVERY: u8 = 0xc0;

    /// Pairs and unpairs devices (Bolt).
    pub const BOLT_PAIRING: u8 = 0xc1;
}

/// The families of receivers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub enum ReceiverKind {
    Bolt,
    Unifying,
    Nano,
    Lightspeed,
}

impl ReceiverKind {
    /// Identifies a receiver by its USB product ID.
    pub fn from_product_id(product_id: u16) -> Option<Self> {
        match product_id {
            0xc548 => Some(Self::Bolt),
            0xc52b | 0xc532 => Some(Self::Unifying),
            0xc52f | 0xc531 | 0xc534 | 0xc535 => Some(Self::Nano),
            0xc539 | 0xc53a | 0xc53d | 0xc53f | 0xc541 | 0xc545 | 0xc547 => {
                Some(Self::Lightspeed)
            },
            _ => None,
        }
    }

    /// Whether the receiver uses the Bolt register layout.
    pub fn is_bolt(self) -> bool {
        self == Self::Bolt
    }
}

/// What a receiver stores about a paired device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PairingInformation {
    /// The wireless product ID.
    pub wpid: u16,
    pub kind: DeviceKind,
}

enum Slot {
    /// A session is being probed. Other connection notifications for the slot
    /// are ignored meanwhile.
    Probing,

    /// The device did not answer. Holds the one-shot handler waiting for the
    /// next report from the slot.
    Deferred(HandlerHandle),

    Ready(Arc<Device>),
}

/// Represents a wireless receiver and the devices paired with it.
pub struct Receiver {
    device: Arc<Device>,
    kind: ReceiverKind,
    listener: Arc<dyn DeviceListener>,
    slots: Mutex<HashMap<u8, Slot>>,
    pairing: Mutex<Pairing>,

    /// Keeps the notification handler registered.
    events: Mutex<Option<HandlerHandle>>,
}

impl Receiver {
    /// Probes the receiver on a channel and starts listening for its
    /// notifications.
    ///
    /// Fails with [`ReceiverError::UnknownReceiver`] if the product ID of the
    /// node is not a known receiver. Call [`Self::start`] afterwards to
    /// enumerate the paired devices.
    pub fn new(
        context: &Arc<Context>,
        channel: Arc<RawChannel>,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<Arc<Self>, ReceiverError> {
        let kind = ReceiverKind::from_product_id(channel.info().product_id)
            .ok_or(ReceiverError::UnknownReceiver)?;
        let device = Device::new(context, channel, RECEIVER_DEVICE_INDEX, DeviceHint::default())?;

        let receiver = Arc::new(Self {
            device,
            kind,
            listener,
            slots: Mutex::new(HashMap::new()),
            pairing: Mutex::new(Pairing::default()),
            events: Mutex::new(None),
        });

        let weak = Arc::downgrade(&receiver);
        let handle = receiver
            .device
            .channel()
            .subscribe(ReceiverEvent::matches, move |raw| {
                let Some(receiver) = weak.upgrade() else {
                    return;
                };
                let Some(event) = Report::from_bytes(raw)
                    .ok()
                    .and_then(|report| ReceiverEvent::parse(&report))
                else {
                    return;
                };

                receiver.handle_event(event);
            });
        *receiver
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(path = %receiver.device.channel().info().path.display(), ?kind, "receiver ready");
        Ok(receiver)
    }

    /// Enables notifications and lets the receiver announce every paired
    /// device. Children are attached as the announcements arrive.
    pub fn start(&self) -> Result<(), ReceiverError> {
        self.device
            .set_register(register::NOTIFICATIONS, &[0x00, 0x09, 0x00], false)?;
        self.device
            .set_register(register::CONNECTIONS, &[0x02, 0x00, 0x00], false)?;
        Ok(())
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn kind(&self) -> ReceiverKind {
        self.kind
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<u8, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pairing(&self) -> MutexGuard<'_, Pairing> {
        self.pairing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The sessions of all attached devices, ordered by slot.
    pub fn children(&self) -> Vec<Arc<Device>> {
        let slots = self.lock_slots();
        let mut children = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(device) => Some(Arc::clone(device)),
                _ => None,
            })
            .collect::<Vec<_>>();
        children.sort_by_key(|device| device.device_index());
        children
    }

    pub fn child(&self, index: u8) -> Option<Arc<Device>> {
        match self.lock_slots().get(&index) {
            Some(Slot::Ready(device)) => Some(Arc::clone(device)),
            _ => None,
        }
    }

    /// Runs on the reader thread.
    fn handle_event(self: &Arc<Self>, event: ReceiverEvent) {
        debug!(?event, "receiver notification");

        match &event {
            ReceiverEvent::DeviceConnection(connection) => self.handle_connection(*connection),
            ReceiverEvent::DeviceDisconnection { index } => self.detach(*index),
            _ => (),
        }

        let action = self.lock_pairing().handle(&event);
        match action {
            Some(PairingAction::Pair(request)) => {
                let receiver = Arc::clone(self);
                self.device
                    .context()
                    .pool()
                    .execute(move || receiver.pair_discovered(request));
            },
            Some(PairingAction::Passkey(passkey)) => {
                self.listener.pairing_passkey(self, &passkey);
            },
            Some(PairingAction::Finished(outcome)) => {
                info!(?outcome, "pairing finished");
                self.listener.pairing_finished(self, outcome);
            },
            None => (),
        }
    }

    fn handle_connection(self: &Arc<Self>, connection: DeviceConnection) {
        let index = connection.index;
        let mut slots = self.lock_slots();

        match slots.get(&index) {
            Some(Slot::Ready(device)) => {
                let device = Arc::clone(device);
                drop(slots);

                if !connection.online {
                    device.sleep();
                    self.listener.state_changed(&device, DeviceState::Asleep);
                } else if device.state() == DeviceState::Asleep {
                    let listener = Arc::clone(&self.listener);
                    self.device.context().pool().execute(move || {
                        match device.wakeup() {
                            Ok(()) => listener.state_changed(&device, DeviceState::Ready),
                            Err(err) => warn!(name = %device.name(), %err, "could not wake up device"),
                        }
                    });
                }
            },
            // The deferred handler sees this report as well.
            Some(Slot::Probing | Slot::Deferred(_)) => (),
            None => {
                slots.insert(index, Slot::Probing);
                drop(slots);

                let receiver = Arc::clone(self);
                self.device
                    .context()
                    .pool()
                    .execute(move || receiver.attach(index, Some(connection.wpid)));
            },
        }
    }

    /// Probes the device in a slot. Runs on the worker pool.
    fn attach(self: &Arc<Self>, index: u8, wpid: Option<u16>) {
        let name = match self.codename(index) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(err) => {
                debug!(index, %err, "could not read codename");
                None
            },
        };
        let product_id = wpid.or_else(|| self.pairing_information(index).ok().map(|info| info.wpid));

        let result = Device::new(
            self.device.context(),
            Arc::clone(self.device.channel()),
            index,
            DeviceHint { product_id, name },
        );

        match result {
            Ok(device) => {
                let mut slots = self.lock_slots();
                if !matches!(slots.get(&index), Some(Slot::Probing)) {
                    drop(slots);
                    debug!(index, "slot was released while probing");
                    device.close();
                    return;
                }
                slots.insert(index, Slot::Ready(Arc::clone(&device)));
                drop(slots);

                self.listener.device_added(&device);
            },
            Err(DeviceError::NotReady) => self.defer(index),
            Err(err) => {
                warn!(index, %err, "could not attach paired device");
                let released = {
                    let mut slots = self.lock_slots();
                    match slots.get(&index) {
                        Some(Slot::Probing) => slots.remove(&index),
                        _ => None,
                    }
                };
                drop(released);
            },
        }
    }

    /// Waits for the next report from a slot before probing it again.
    fn defer(self: &Arc<Self>, index: u8) {
        let weak = Arc::downgrade(self);
        let handle = self.device.channel().subscribe(
            move |raw| {
                matches!(raw.first(), Some(&(SHORT_REPORT_ID | LONG_REPORT_ID)))
                    && raw.get(1) == Some(&index)
            },
            move |_| {
                if let Some(receiver) = weak.upgrade() {
                    receiver.retry_deferred(index);
                }
            },
        );

        let mut slots = self.lock_slots();
        if matches!(slots.get(&index), Some(Slot::Probing)) {
            debug!(index, "device not ready, waiting for it to talk");
            slots.insert(index, Slot::Deferred(handle));
        } else {
            drop(slots);
            drop(handle);
        }
    }

    /// Runs on the reader thread.
    fn retry_deferred(self: &Arc<Self>, index: u8) {
        let previous = {
            let mut slots = self.lock_slots();
            match slots.get(&index) {
                Some(Slot::Deferred(_)) => slots.insert(index, Slot::Probing),
                _ => return,
            }
        };
        // Unregisters the one-shot handler currently running.
        drop(previous);

        let receiver = Arc::clone(self);
        self.device
            .context()
            .pool()
            .execute(move || receiver.attach(index, None));
    }

    /// Destroys the session in a slot. Runs on the reader thread.
    fn detach(&self, index: u8) {
        let slot = self.lock_slots().remove(&index);

        if let Some(Slot::Ready(device)) = slot {
            info!(index, name = %device.name(), "device unpaired");
            device.close();
            self.listener.device_removed(&device);
        }
    }

    /// Closes the receiver and every child session.
    pub fn close(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let slots = std::mem::take(&mut *self.lock_slots());
        for slot in slots.into_values() {
            if let Slot::Ready(device) = slot {
                device.close();
                self.listener.device_removed(&device);
            }
        }

        self.device.close();
    }

    pub fn pair_state(&self) -> PairState {
        self.lock_pairing().state()
    }

    /// Starts looking for devices to pair for `timeout` seconds (`0` picks the
    /// receiver's default).
    ///
    /// Bolt receivers start discovery and pair the first device found
    /// automatically. Other receivers open their pairing lock.
    pub fn start_pair(&self, timeout: u8) -> Result<(), ReceiverError> {
        let state = if self.kind.is_bolt() {
            PairState::Discovering
        } else {
            PairState::Pairing
        };

        {
            let mut pairing = self.lock_pairing();
            if pairing.state() != PairState::NotPairing {
                return Err(ReceiverError::PairingInProgress);
            }
            pairing.begin(state);
        }

        let result = if self.kind.is_bolt() {
            self.device
                .set_register(register::DISCOVERY, &[timeout, 0x01, 0x00], false)
        } else {
            self.device
                .set_register(register::PAIRING_LOCK, &[0x01, 0x00, timeout], false)
        };

        if let Err(err) = result {
            self.lock_pairing().reset();
            return Err(err.into());
        }

        info!(kind = ?self.kind, ?state, "pairing started");
        Ok(())
    }

    /// Cancels discovery or pairing.
    pub fn stop_pair(&self) -> Result<(), ReceiverError> {
        let state = {
            let mut pairing = self.lock_pairing();
            let state = pairing.state();
            pairing.reset();
            state
        };

        match (self.kind.is_bolt(), state) {
            (_, PairState::NotPairing) => return Ok(()),
            (true, PairState::Discovering) => {
                self.device
                    .set_register(register::DISCOVERY, &[0x00, 0x02, 0x00], false)?;
            },
            (true, _) => {
                self.device
                    .set_register(register::BOLT_PAIRING, &[0x02], true)?;
            },
            (false, _) => {
                self.device
                    .set_register(register::PAIRING_LOCK, &[0x02, 0x00, 0x00], false)?;
            },
        }

        info!(?state, "pairing cancelled");
        Ok(())
    }

    fn pair_discovered(&self, request: PairRequest) {
        info!(name = %request.name, wpid = format_args!("{:#06x}", request.wpid), "pairing discovered device");

        if let Err(err) = self.pair(
            AUTO_SLOT,
            request.address,
            request.authentication,
            request.entropy,
        ) {
            warn!(%err, "pairing request failed");
            self.lock_pairing().reset();

            let code = match err {
                ReceiverError::Transact(TransactError::Hidpp10(err)) => err.code,
                _ => PAIR_REQUEST_FAILED,
            };
            self.listener.pairing_finished(self, PairingOutcome {
                error: Some(code),
                slot: None,
            });
        }
    }

    /// Asks a Bolt receiver to pair a discovered device.
    ///
    /// `entropy` is the amount of clicks or key presses the passkey consists
    /// of.
    pub fn pair(
        &self,
        slot: u8,
        address: [u8; 6],
        authentication: u8,
        entropy: u8,
    ) -> Result<(), ReceiverError> {
        let mut params = [0u8; LONG_PARAMS_LENGTH];
        params[0] = 0x01;
        params[1] = slot;
        params[2..=7].copy_from_slice(&address);
        params[8] = authentication;
        params[9] = entropy;

        self.device
            .set_register(register::BOLT_PAIRING, &params, true)?;
        Ok(())
    }

    /// Removes the pairing in a slot. The receiver announces the
    /// disconnection afterwards.
    pub fn unpair(&self, index: u8) -> Result<(), ReceiverError> {
        if self.kind.is_bolt() {
            self.device
                .set_register(register::BOLT_PAIRING, &[0x03, index], true)?;
        } else {
            self.device
                .set_register(register::PAIRING_LOCK, &[0x03, index, 0x00], false)?;
        }
        Ok(())
    }

    /// Reads what the receiver stores about the device in a slot.
    pub fn pairing_information(&self, index: u8) -> Result<PairingInformation, ReceiverError> {
        if self.kind.is_bolt() {
            let response = self.device.get_register(
                register::RECEIVER_INFO,
                &[0x50 + (index & 0x0f), 0x00, 0x00],
                true,
            )?;

            Ok(PairingInformation {
                wpid: u16::from_le_bytes([response[2], response[3]]),
                kind: DeviceKind::from_nibble(response[1]),
            })
        } else {
            let response = self.device.get_register(
                register::RECEIVER_INFO,
                &[0x20 + legacy_slot(index)?, 0x00, 0x00],
                true,
            )?;

            Ok(PairingInformation {
                wpid: u16::from_be_bytes([response[3], response[4]]),
                kind: DeviceKind::from_nibble(response[7]),
            })
        }
    }

    /// Reads the codename the receiver stores for the device in a slot.
    pub fn codename(&self, index: u8) -> Result<String, ReceiverError> {
        let (response, start) = if self.kind.is_bolt() {
            let response = self.device.get_register(
                register::RECEIVER_INFO,
                &[0x60 + (index & 0x0f), 0x01, 0x00],
                true,
            )?;
            (response, 2)
        } else {
            let response = self.device.get_register(
                register::RECEIVER_INFO,
                &[0x40 + legacy_slot(index)?, 0x00, 0x00],
                true,
            )?;
            (response, 1)
        };

        let length = response[start] as usize;
        let name = response
            .get(start + 1..start + 1 + length)
            .ok_or(ReceiverError::UnsupportedResponse)?;
        String::from_utf8(name.to_vec()).map_err(|_| ReceiverError::UnsupportedResponse)
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("path", &self.device.channel().info().path)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Non-Bolt receivers number their info sub-registers from 0.
fn legacy_slot(index: u8) -> Result<u8, ReceiverError> {
    match index {
        1..=6 => Ok(index - 1),
        _ => Err(ReceiverError::UnsupportedResponse),
    }
}

/// Represents an error returned by a receiver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReceiverError {
    /// Indicates that no supported receiver could be identified on a HID++
    /// channel.
    #[error("no (supported) receiver could be found")]
    UnknownReceiver,

    #[error("the receiver could not be probed")]
    Device(#[from] DeviceError),

    #[error("a transaction with the receiver failed")]
    Transact(#[from] TransactError),

    #[error("pairing is already in progress")]
    PairingInProgress,

    /// The receiver answered with data that could not be interpreted.
    #[error("the receiver returned an unsupported response")]
    UnsupportedResponse,
}
