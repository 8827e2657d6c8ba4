//! Turns hotplug notifications into device and receiver sessions.
//!
//! [`DeviceMonitor::device_added`] only records the path; opening and probing
//! the node runs on the worker pool. Nodes that are not ready yet are retried
//! with an exponentially growing delay until the configured amount of
//! attempts is used up.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelError, RawChannel},
    context::Context,
    device::{Device, DeviceError, DeviceHint},
    listener::DeviceListener,
    receiver::{Receiver, ReceiverError, ReceiverKind},
    report::{CORDED_DEVICE_INDEX, DEFAULT_DEVICE_INDEX},
};

/// Opens the channel of a hotplugged node.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<RawChannel>, ChannelError>;
}

/// Opens hidraw nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct HidrawOpener;

impl ChannelOpener for HidrawOpener {
    fn open(&self, path: &Path) -> Result<Arc<RawChannel>, ChannelError> {
        RawChannel::open(path)
    }
}

/// A session owned by the monitor.
#[derive(Clone, Debug)]
pub enum Managed {
    Device(Arc<Device>),
    Receiver(Arc<Receiver>),
}

struct Entry {
    /// Distinguishes a node from an earlier one at the same path.
    generation: u64,

    /// [`None`] while the node is being probed.
    managed: Option<Managed>,
}

/// Keeps track of every HID++ node of the system.
pub struct DeviceMonitor {
    context: Arc<Context>,
    opener: Arc<dyn ChannelOpener>,
    listener: Arc<dyn DeviceListener>,
    entries: Mutex<HashMap<PathBuf, Entry>>,
    next_generation: AtomicU64,
}

impl DeviceMonitor {
    /// Creates a monitor opening hidraw nodes.
    pub fn new(context: Arc<Context>, listener: Arc<dyn DeviceListener>) -> Arc<Self> {
        Self::with_opener(context, Arc::new(HidrawOpener), listener)
    }

    pub fn with_opener(
        context: Arc<Context>,
        opener: Arc<dyn ChannelOpener>,
        listener: Arc<dyn DeviceListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            opener,
            listener,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts managing a node. Probing happens in the background.
    pub fn device_added(self: &Arc<Self>, path: impl Into<PathBuf>) {
        let path = path.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.lock_entries();
            if entries.contains_key(&path) {
                debug!(path = %path.display(), "node is already managed");
                return;
            }
            entries.insert(path.clone(), Entry {
                generation,
                managed: None,
            });
        }

        self.schedule(path, generation, 0);
    }

    /// Stops managing a node and closes its sessions.
    pub fn device_removed(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let Some(entry) = self.lock_entries().remove(path) else {
            return;
        };

        match entry.managed {
            Some(Managed::Device(device)) => {
                info!(path = %path.display(), name = %device.name(), "device removed");
                device.close();
                self.listener.device_removed(&device);
            },
            Some(Managed::Receiver(receiver)) => {
                info!(path = %path.display(), kind = ?receiver.kind(), "receiver removed");
                receiver.close();
                self.listener.receiver_removed(&receiver);
            },
            None => debug!(path = %path.display(), "node removed while probing"),
        }
    }

    /// The sessions of every node, receivers included.
    pub fn managed(&self) -> Vec<Managed> {
        self.lock_entries()
            .values()
            .filter_map(|entry| entry.managed.clone())
            .collect()
    }

    /// Every device, including the ones paired with a receiver.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices = Vec::new();
        for managed in self.managed() {
            match managed {
                Managed::Device(device) => devices.push(device),
                Managed::Receiver(receiver) => devices.extend(receiver.children()),
            }
        }
        devices
    }

    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.managed()
            .into_iter()
            .filter_map(|managed| match managed {
                Managed::Receiver(receiver) => Some(receiver),
                Managed::Device(_) => None,
            })
            .collect()
    }

    /// The amount of nodes still being probed or waiting for a retry.
    pub fn pending(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| entry.managed.is_none())
            .count()
    }

    fn is_current(&self, path: &Path, generation: u64) -> bool {
        self.lock_entries()
            .get(path)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn schedule(self: &Arc<Self>, path: PathBuf, generation: u64, attempt: u32) {
        let monitor = Arc::downgrade(self);
        let task = move || {
            if let Some(monitor) = Weak::upgrade(&monitor) {
                monitor.probe(&path, generation, attempt);
            }
        };

        if attempt == 0 {
            self.context.pool().execute(task);
        } else {
            let delay = self.context.options().retry_delay(attempt - 1);
            self.context.pool().execute_after(delay, task);
        }
    }

    /// Runs on the worker pool.
    fn probe(self: &Arc<Self>, path: &Path, generation: u64, attempt: u32) {
        if !self.is_current(path, generation) {
            return;
        }

        match self.connect(path) {
            Ok(managed) => self.install(path, generation, managed),
            Err(err) if err.is_retryable() => {
                let attempts = self.context.options().retry_max_attempts;
                if attempt + 1 >= attempts {
                    error!(path = %path.display(), attempts, %err, "giving up on node");
                    self.forget(path, generation);
                    return;
                }

                let delay = self.context.options().retry_delay(attempt);
                warn!(path = %path.display(), ?delay, %err, "node not ready, retrying");
                self.schedule(path.to_path_buf(), generation, attempt + 1);
            },
            Err(err) if err.is_invalid() => {
                debug!(path = %path.display(), %err, "skipping node");
                self.forget(path, generation);
            },
            Err(err) => {
                warn!(path = %path.display(), %err, "could not probe node");
                self.forget(path, generation);
            },
        }
    }

    fn connect(&self, path: &Path) -> Result<Managed, MonitorError> {
        let channel = self.opener.open(path)?;

        if ReceiverKind::from_product_id(channel.info().product_id).is_some() {
            let receiver = Receiver::new(&self.context, channel, Arc::clone(&self.listener))?;
            receiver.start()?;
            return Ok(Managed::Receiver(receiver));
        }

        let first = match self.probe_index(&channel, DEFAULT_DEVICE_INDEX) {
            Ok(device) => return Ok(Managed::Device(device)),
            Err(err) => err,
        };
        debug!(path = %path.display(), %first, "no device at the default index, trying the corded one");

        match self.probe_index(&channel, CORDED_DEVICE_INDEX) {
            Ok(device) => Ok(Managed::Device(device)),
            Err(_) if first.is_retryable() => Err(first.into()),
            Err(err) => Err(err.into()),
        }
    }

    fn probe_index(
        &self,
        channel: &Arc<RawChannel>,
        device_index: u8,
    ) -> Result<Arc<Device>, DeviceError> {
        Device::new(
            &self.context,
            Arc::clone(channel),
            device_index,
            DeviceHint::default(),
        )
    }

    fn install(&self, path: &Path, generation: u64, managed: Managed) {
        {
            let mut entries = self.lock_entries();
            match entries.get_mut(path) {
                Some(entry) if entry.generation == generation => {
                    entry.managed = Some(managed.clone());
                },
                _ => {
                    drop(entries);
                    debug!(path = %path.display(), "node removed while probing");
                    match managed {
                        Managed::Device(device) => device.close(),
                        Managed::Receiver(receiver) => receiver.close(),
                    }
                    return;
                },
            }
        }

        match managed {
            Managed::Device(device) => {
                info!(path = %path.display(), name = %device.name(), "device added");
                self.listener.device_added(&device);
            },
            Managed::Receiver(receiver) => self.listener.receiver_added(&receiver),
        }
    }

    fn forget(&self, path: &Path, generation: u64) {
        let mut entries = self.lock_entries();
        if entries
            .get(path)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(path);
        }
    }
}

/// Represents an error that occurred while probing a node.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("the node could not be opened")]
    Channel(#[from] ChannelError),

    #[error("the device could not be probed")]
    Device(#[from] DeviceError),

    #[error("the receiver could not be started")]
    Receiver(#[from] ReceiverError),
}

impl MonitorError {
    /// Whether probing again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Device(err) | Self::Receiver(ReceiverError::Device(err)) => err.is_retryable(),
            Self::Receiver(ReceiverError::Transact(err)) => err.is_timeout(),
            _ => false,
        }
    }

    /// Whether the node is no HID++ device at all.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            Self::Channel(ChannelError::InvalidDevice(_))
                | Self::Device(DeviceError::InvalidDevice(_))
                | Self::Receiver(ReceiverError::UnknownReceiver)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::Instant,
    };

    use super::*;
    use crate::{channel::mock, device::tests::hidpp20_mouse, options::Options};

    /// Opens mock nodes that only answer from the `answer_from`th open on.
    struct MockOpener {
        opens: AtomicUsize,
        answer_from: usize,
        invalid: bool,
    }

    impl MockOpener {
        fn new(answer_from: usize) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                answer_from,
                invalid: false,
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl ChannelOpener for MockOpener {
        fn open(&self, _path: &Path) -> Result<Arc<RawChannel>, ChannelError> {
            let open = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.invalid {
                return Err(ChannelError::InvalidDevice("no HID++ reports".to_string()));
            }

            let (channel, state) = mock::channel(0x4082);
            if open >= self.answer_from {
                state.respond_with(hidpp20_mouse(&[(0x0005, 0x01)], "MX Test"));
            }
            Ok(channel)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DeviceListener for Recorder {
        fn device_added(&self, device: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("added {}", device.name()));
        }

        fn device_removed(&self, device: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("removed {}", device.name()));
        }
    }

    fn monitor(opener: Arc<MockOpener>, max_attempts: u32) -> (Arc<DeviceMonitor>, Arc<Recorder>) {
        let context = Context::new(Options {
            io_timeout_ms: 30,
            worker_threads: 2,
            retry_base_delay_ms: 10,
            retry_max_attempts: max_attempts,
            ..Options::default()
        })
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        let monitor = DeviceMonitor::with_opener(context, opener, Arc::clone(&recorder) as _);
        (monitor, recorder)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn adds_and_removes_devices() {
        let opener = MockOpener::new(0);
        let (monitor, recorder) = monitor(Arc::clone(&opener), 3);

        monitor.device_added("/dev/hidraw3");
        monitor.device_added("/dev/hidraw3");
        wait_until(|| !recorder.events.lock().unwrap().is_empty());

        let device = monitor.devices().remove(0);
        assert_eq!(device.device_index(), DEFAULT_DEVICE_INDEX);
        assert_eq!(opener.opens(), 1);

        monitor.device_removed("/dev/hidraw3");
        assert!(monitor.devices().is_empty());
        assert_eq!(recorder.events.lock().unwrap().clone(), vec![
            "added MX Test",
            "removed MX Test",
        ]);
    }

    #[test]
    fn retries_nodes_that_are_not_ready() {
        let opener = MockOpener::new(2);
        let (monitor, _recorder) = monitor(Arc::clone(&opener), 5);

        monitor.device_added("/dev/hidraw4");
        wait_until(|| monitor.devices().len() == 1);

        assert_eq!(opener.opens(), 3);
        assert_eq!(monitor.pending(), 0);
    }

    #[test]
    fn gives_up_after_the_last_attempt() {
        let opener = MockOpener::new(usize::MAX);
        let (monitor, recorder) = monitor(Arc::clone(&opener), 2);

        monitor.device_added("/dev/hidraw5");
        wait_until(|| monitor.pending() == 0);

        assert_eq!(opener.opens(), 2);
        assert!(monitor.devices().is_empty());
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn skips_nodes_without_hidpp() {
        let opener = Arc::new(MockOpener {
            opens: AtomicUsize::new(0),
            answer_from: 0,
            invalid: true,
        });
        let (monitor, _recorder) = monitor(Arc::clone(&opener), 5);

        monitor.device_added("/dev/hidraw6");
        wait_until(|| monitor.pending() == 0);

        assert_eq!(opener.opens(), 1);
        assert!(monitor.managed().is_empty());
    }
}
