//! Implements the session with a single HID++ device.
//!
//! A [`Device`] is created by probing a device index on a channel: the
//! protocol version is determined, HID++2.0 devices have to pass a stability
//! check, and the device is identified. Only then feature clients can be
//! attached. A session does not survive the loss of its channel.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelError, HandlerHandle, RawChannel},
    context::Context,
    feature::{
        CreatableFeature,
        FeatureError,
        device_name::DeviceName,
        root,
        wireless_device_status::WirelessDeviceStatus,
    },
    nibble::U4,
    protocol::{
        self,
        ProtocolVersion,
        v10::{self, SubId},
    },
    report::{LONG_PARAMS_LENGTH, Report, ReportKind, SHORT_PARAMS_LENGTH},
    transport::{TransactError, Transport},
};

/// A callback run after a device woke up, e.g. to re-apply its configuration.
pub type WakeupHook = Arc<dyn Fn(&Arc<Device>) + Send + Sync>;

/// The lifecycle state of a [`Device`] after probing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceState {
    /// The device answers requests.
    Ready,

    /// The device lost its link, usually to save power. Transactions fail
    /// with [`TransactError::Asleep`] until [`Device::wakeup`] succeeded.
    Asleep,

    /// The session was closed explicitly. This is final. A lost channel does
    /// not close the session, its transactions time out instead.
    Closed,
}

/// What is already known about a device before probing it.
///
/// Receivers learn the product ID from the connection notification and may
/// know the name from their pairing registers.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct DeviceHint {
    pub product_id: Option<u16>,
    pub name: Option<String>,
}

/// Represents a single HID++ device reachable through a [`RawChannel`].
pub struct Device {
    context: Arc<Context>,
    transport: Transport,

    /// The supported protocol version reported by the device.
    version: ProtocolVersion,

    name: RwLock<String>,
    product_id: u16,

    /// Feature ID to feature index. Entries are written once and never
    /// invalidated.
    features: Mutex<HashMap<u16, u8>>,

    state: Mutex<DeviceState>,
    wakeup_hooks: Mutex<Vec<WakeupHook>>,

    /// Keeps the wireless status listener registered, if the device has one.
    status_listener: Mutex<Option<HandlerHandle>>,
}

impl Device {
    /// Opens a hidraw node and probes the device at `device_index`.
    pub fn open(
        context: &Arc<Context>,
        path: impl AsRef<Path>,
        device_index: u8,
    ) -> Result<Arc<Self>, DeviceError> {
        let channel = RawChannel::open(path)?;
        Self::new(context, channel, device_index, DeviceHint::default())
    }

    /// Probes the device at `device_index` of a channel.
    ///
    /// Returns [`DeviceError::NotReady`] if the device did not answer or failed
    /// the stability check, in which case probing may be retried later.
    pub fn new(
        context: &Arc<Context>,
        channel: Arc<RawChannel>,
        device_index: u8,
        hint: DeviceHint,
    ) -> Result<Arc<Self>, DeviceError> {
        let transport = Transport::new(Arc::clone(&channel), device_index, context.options());

        let version = protocol::determine_version(&transport)
            .map_err(|err| probe_error(device_index, err))?;
        debug!(path = %channel.info().path.display(), device_index, %version, "determined protocol version");

        if version.is_v20() {
            match protocol::check_stability(&transport) {
                Ok(true) => (),
                Ok(false) => return Err(DeviceError::NotReady),
                Err(err) => {
                    debug!(device_index, %err, "stability check failed");
                    return Err(DeviceError::NotReady);
                },
            }
        }

        let name = hint.name.unwrap_or_else(|| channel.info().name.clone());
        let product_id = hint.product_id.unwrap_or(channel.info().product_id);

        let device = Arc::new(Self {
            context: Arc::clone(context),
            transport,
            version,
            name: RwLock::new(name),
            product_id,
            features: Mutex::new(HashMap::new()),
            state: Mutex::new(DeviceState::Ready),
            wakeup_hooks: Mutex::new(Vec::new()),
            status_listener: Mutex::new(None),
        });

        if version.is_v20() {
            device.identify();
            device.listen_for_status();
        }

        info!(
            path = %channel.info().path.display(),
            device_index,
            %version,
            name = %device.name(),
            product_id = format_args!("{product_id:#06x}"),
            "device ready"
        );

        Ok(device)
    }

    /// Replaces the fallback name with the marketing name, if the device
    /// exposes it.
    fn identify(self: &Arc<Self>) {
        let name = self
            .get_feature::<DeviceName>()
            .and_then(|feature| feature.name());

        match name {
            Ok(name) if !name.is_empty() => {
                *self.name.write().unwrap_or_else(PoisonError::into_inner) = name;
            },
            Ok(_) => (),
            Err(FeatureError::Unsupported(_)) => (),
            Err(err) => debug!(%err, "could not read device name, keeping fallback"),
        }
    }

    fn listen_for_status(self: &Arc<Self>) {
        let Ok(feature) = self.get_feature::<WirelessDeviceStatus>() else {
            return;
        };

        let device = Arc::downgrade(self);
        let handle = feature.listen(move |event| {
            if !event.reconfiguration_required() {
                return;
            }
            if let Some(device) = Weak::upgrade(&device) {
                debug!(name = %device.name(), "device requested reconfiguration");
                device.schedule_wakeup();
            }
        });

        *self.lock_status_listener() = Some(handle);
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status_listener(&self) -> MutexGuard<'_, Option<HandlerHandle>> {
        self.status_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn channel(&self) -> &Arc<RawChannel> {
        self.transport.channel()
    }

    pub fn device_index(&self) -> u8 {
        self.transport.device_index()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn state(&self) -> DeviceState {
        *self.lock_state()
    }

    fn check_ready(&self) -> Result<(), TransactError> {
        match self.state() {
            DeviceState::Ready => Ok(()),
            DeviceState::Asleep => Err(TransactError::Asleep),
            DeviceState::Closed => Err(TransactError::Closed),
        }
    }

    fn request(&self, feature_index: u8, function: U4, params: &[u8]) -> Report {
        let kind = if params.len() <= SHORT_PARAMS_LENGTH {
            ReportKind::Short
        } else {
            ReportKind::Long
        };

        let mut report = Report::new_v20(
            kind,
            self.device_index(),
            feature_index,
            function,
            U4::default(),
        );
        report.set_params(&params[..params.len().min(LONG_PARAMS_LENGTH)]);
        report
    }

    /// Calls a HID++2.0 feature function and returns the parameters of the
    /// reply, widened to 16 bytes.
    pub fn transact(
        &self,
        feature_index: u8,
        function: U4,
        params: &[u8],
    ) -> Result<[u8; LONG_PARAMS_LENGTH], TransactError> {
        self.check_ready()?;
        let response = self
            .transport
            .transact20(self.request(feature_index, function, params))?;
        Ok(response.extend_params())
    }

    /// Calls a HID++2.0 feature function that does not reply, such as
    /// switching to another host.
    pub fn transact_no_response(
        &self,
        feature_index: u8,
        function: U4,
        params: &[u8],
    ) -> Result<(), TransactError> {
        self.check_ready()?;
        self.transport
            .send_no_response(self.request(feature_index, function, params))
    }

    fn access_register(
        &self,
        sub_id: SubId,
        address: u8,
        params: &[u8],
    ) -> Result<[u8; LONG_PARAMS_LENGTH], TransactError> {
        self.check_ready()?;

        let kind = match sub_id {
            SubId::SetLongRegister => ReportKind::Long,
            _ => ReportKind::Short,
        };
        let mut report = Report::new(kind, self.device_index(), sub_id.into(), address);
        report.set_params(params);

        Ok(self.transport.transact10(report)?.extend_params())
    }

    /// Reads a HID++1.0 register. `params` select a sub-register on some
    /// registers and are usually empty.
    pub fn get_register(
        &self,
        address: u8,
        params: &[u8],
        long: bool,
    ) -> Result<[u8; LONG_PARAMS_LENGTH], TransactError> {
        self.access_register(SubId::register_access(false, long), address, params)
    }

    /// Writes a HID++1.0 register and returns the parameters of the reply.
    pub fn set_register(
        &self,
        address: u8,
        params: &[u8],
        long: bool,
    ) -> Result<[u8; LONG_PARAMS_LENGTH], TransactError> {
        self.access_register(SubId::register_access(true, long), address, params)
    }

    /// Registers an event handler for reports of this device accepted by
    /// `predicate`.
    ///
    /// Handlers run on the reader thread of the channel and must not block on
    /// transactions. Hand such work to [`Context::pool`].
    pub fn subscribe(
        &self,
        predicate: impl Fn(&Report) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Report) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let device_index = self.device_index();

        self.channel().subscribe(
            move |raw| {
                raw.get(1) == Some(&device_index)
                    && Report::from_bytes(raw).is_ok_and(|report| predicate(&report))
            },
            move |raw| {
                if let Ok(report) = Report::from_bytes(raw) {
                    callback(&report);
                }
            },
        )
    }

    /// Registers an event handler for notifications of a HID++2.0 feature.
    ///
    /// Notifications carry software ID 0, so replies to requests are never
    /// passed to the callback.
    pub fn subscribe_feature(
        &self,
        feature_index: u8,
        callback: impl Fn(&Report) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.subscribe(
            move |report| {
                report.feature_index() == feature_index && report.software_id() == U4::default()
            },
            callback,
        )
    }

    /// Looks up the index of a feature, resolving it with the root feature on
    /// first use.
    pub fn feature_index(&self, feature_id: u16) -> Result<u8, FeatureError> {
        if let Some(&index) = self
            .features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&feature_id)
        {
            return Ok(index);
        }

        if !self.version.is_v20() {
            return Err(FeatureError::Unsupported(feature_id));
        }

        let index = root::resolve(self, feature_id)?;
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(feature_id)
            .or_insert(index);

        Ok(index)
    }

    /// Creates a client for a feature of the device.
    ///
    /// Fails with [`FeatureError::Unsupported`] if the device does not have
    /// the feature.
    pub fn get_feature<F: CreatableFeature>(self: &Arc<Self>) -> Result<F, FeatureError> {
        let index = self.feature_index(F::ID)?;
        F::attach(Arc::clone(self), index)
    }

    /// Marks the device as asleep. No request is sent.
    pub fn sleep(&self) {
        let mut state = self.lock_state();
        if *state == DeviceState::Ready {
            debug!(name = %self.name(), device_index = self.device_index(), "device went to sleep");
            *state = DeviceState::Asleep;
        }
    }

    /// Pings the device and, once it answered, marks it ready and runs the
    /// wakeup hooks on the worker pool.
    ///
    /// Must not be called from a reader thread, see [`Self::schedule_wakeup`].
    pub fn wakeup(self: &Arc<Self>) -> Result<(), DeviceError> {
        if self.state() == DeviceState::Closed {
            return Err(TransactError::Closed.into());
        }

        protocol::determine_version(&self.transport)
            .map_err(|err| probe_error(self.device_index(), err))?;

        *self.lock_state() = DeviceState::Ready;
        info!(name = %self.name(), device_index = self.device_index(), "device woke up");

        let hooks = self
            .wakeup_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !hooks.is_empty() {
            let device = Arc::clone(self);
            self.context.pool().execute(move || {
                for hook in hooks {
                    hook(&device);
                }
            });
        }

        Ok(())
    }

    /// Runs [`Self::wakeup`] on the worker pool. Safe to call from event
    /// handlers.
    pub fn schedule_wakeup(self: &Arc<Self>) {
        let device = Arc::clone(self);
        self.context.pool().execute(move || {
            if let Err(err) = device.wakeup() {
                warn!(name = %device.name(), %err, "could not wake up device");
            }
        });
    }

    /// Registers a hook run after every successful [`Self::wakeup`].
    pub fn add_wakeup_hook(&self, hook: impl Fn(&Arc<Device>) + Send + Sync + 'static) {
        self.wakeup_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Closes the session. Every following transaction fails.
    pub fn close(&self) {
        *self.lock_state() = DeviceState::Closed;
        self.lock_status_listener().take();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.channel().info().path)
            .field("device_index", &self.device_index())
            .field("version", &self.version)
            .field("name", &self.name())
            .field("product_id", &self.product_id)
            .finish()
    }
}

/// Maps an error that occurred while talking to a device that was not yet
/// known to answer.
fn probe_error(device_index: u8, err: TransactError) -> DeviceError {
    match err {
        TransactError::Timeout(_) | TransactError::Asleep => DeviceError::NotReady,
        TransactError::Hidpp10(err)
            if err.is(v10::ErrorCode::ResourceError) || err.is(v10::ErrorCode::Busy) =>
        {
            DeviceError::NotReady
        },
        TransactError::Hidpp10(err) if err.is(v10::ErrorCode::UnknownDevice) => {
            DeviceError::InvalidDevice(device_index)
        },
        err => DeviceError::Transact(err),
    }
}

/// Represents a device-specific error.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device did not answer or is not stable yet. Probing may be retried.
    #[error("the device is not ready")]
    NotReady,

    /// There is no usable HID++ device at the given index.
    #[error("there is no HID++ device at index {0:#04x}")]
    InvalidDevice(u8),

    #[error("a transaction with the device failed")]
    Transact(#[from] TransactError),

    #[error("the HID channel returned an error")]
    Channel(#[from] ChannelError),
}

impl DeviceError {
    /// Whether probing the device again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady)
    }
}
