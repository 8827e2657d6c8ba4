//! Implements the raw HID channel a HID++ device is reached through.
//!
//! A [`RawChannel`] owns one kernel node, a send lock serializing writes and a
//! private reader thread that hands every inbound report to the registered
//! event handlers. It knows nothing about request/response correlation, that
//! is the job of [`crate::transport`].

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use hidreport::{Field, Report as _, ReportDescriptor, Usage, UsageId, UsagePage};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::report::{LONG_REPORT_ID, Report, ReportKind, SHORT_REPORT_ID};

pub mod handler;
pub mod hidraw;
#[cfg(test)]
pub(crate) mod mock;

pub use handler::{EventHandlerList, HandlerHandle, HandlerId};

/// The USB vendor ID of Logitech. Nodes of other vendors are never HID++.
pub const LOGITECH_VENDOR_ID: u16 = 0x046d;

const SHORT_REPORT_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;

const LONG_REPORT_USAGE_PAGE: u16 = 0xff00;
const LONG_REPORT_USAGE: u16 = 0x0002;

/// The size of the buffer incoming reports are read into.
///
/// hidraw nodes also deliver the regular input reports of a device, which may
/// be longer than a HID++ report. [`Report::from_bytes`] truncates anything
/// past the canonical length.
const READ_BUFFER_LENGTH: usize = 64;

/// How often a write is retried on a transient error before giving up.
const MAX_WRITE_RETRIES: usize = 3;

/// Static information about the node behind a channel.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RawDeviceInfo {
    pub path: PathBuf,
    pub bus_type: u32,
    pub vendor_id: u16,
    pub product_id: u16,

    /// The name the kernel reports for the node.
    pub name: String,
}

/// Represents an arbitrary HID node that is both readable and writable.
///
/// Any type this trait is implemented for can be used for HID++
/// communication. Whether a specific node supports HID++ is determined by
/// [`RawChannel::from_device`].
pub trait RawHidDevice: Send + Sync + 'static {
    fn info(&self) -> &RawDeviceInfo;

    /// Writes a raw report to the node.
    ///
    /// Returns the exact amount of written bytes on success.
    fn write_report(&self, src: &[u8]) -> io::Result<usize>;

    /// Blocks until a report is available and reads it.
    ///
    /// Returns `Ok(None)` without reading anything if the call was interrupted
    /// by [`Self::wake`]. Errors are considered fatal for the channel.
    fn read_report(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Wakes up a thread blocked in [`Self::read_report`].
    fn wake(&self);

    /// If the implementation already knows whether the node supports HID++
    /// messages, it should return `Some((supports_short, supports_long))`.
    ///
    /// In this case, the report descriptor will not be read and parsed.
    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        None
    }

    /// Retrieves the raw HID report descriptor of the node.
    fn report_descriptor(&self) -> io::Result<Vec<u8>>;
}

/// Checks whether a report descriptor declares short and/or long HID++
/// reports.
fn supports_short_long_hidpp(raw_descriptor: &[u8]) -> Result<(bool, bool), ChannelError> {
    let descriptor =
        ReportDescriptor::try_from(raw_descriptor).map_err(ChannelError::ReportDescriptor)?;

    let declares = |report_id: u8, usage_page: u16, usage: u16| {
        descriptor
            .find_input_report(&[report_id])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(usage_page),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    };

    Ok((
        declares(SHORT_REPORT_ID, SHORT_REPORT_USAGE_PAGE, SHORT_REPORT_USAGE),
        declares(LONG_REPORT_ID, LONG_REPORT_USAGE_PAGE, LONG_REPORT_USAGE),
    ))
}

/// Represents a HID node supporting HID++.
pub struct RawChannel {
    /// Whether the node supports short (7 bytes) HID++ reports.
    pub supports_short: bool,

    /// Whether the node supports long (20 bytes) HID++ reports.
    pub supports_long: bool,

    device: Arc<dyn RawHidDevice>,
    handlers: Arc<EventHandlerList>,

    /// Serializes writes, at most one report is on the wire at a time.
    send_lock: Mutex<()>,

    /// Cleared by the reader thread once the node failed.
    valid: Arc<AtomicBool>,

    /// Tells the reader thread to stop after the next wakeup.
    stop: Arc<AtomicBool>,

    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RawChannel {
    /// Opens a hidraw node.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, ChannelError> {
        Self::from_device(hidraw::HidrawDevice::open(path.as_ref())?)
    }

    /// Wraps an already opened node and starts its reader thread.
    ///
    /// Fails with [`ChannelError::InvalidDevice`] if the node is not a
    /// Logitech node or declares neither short nor long HID++ reports.
    pub fn from_device<T: RawHidDevice>(device: T) -> Result<Arc<Self>, ChannelError> {
        let info = device.info();
        if info.vendor_id != LOGITECH_VENDOR_ID {
            return Err(ChannelError::InvalidDevice(format!(
                "vendor {:#06x} is not Logitech",
                info.vendor_id
            )));
        }

        let (supports_short, supports_long) = match device.supports_short_long_hidpp() {
            Some(supported) => supported,
            None => supports_short_long_hidpp(&device.report_descriptor()?)?,
        };
        if !supports_short && !supports_long {
            return Err(ChannelError::InvalidDevice(
                "no HID++ reports in the report descriptor".to_string(),
            ));
        }

        let thread_name = match info.path.file_name() {
            Some(name) => format!("hidpp-{}", name.to_string_lossy()),
            None => "hidpp-reader".to_string(),
        };

        let device: Arc<dyn RawHidDevice> = Arc::new(device);
        let handlers = Arc::new(EventHandlerList::new());
        let valid = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = thread::Builder::new().name(thread_name).spawn({
            let device = Arc::clone(&device);
            let handlers = Arc::clone(&handlers);
            let valid = Arc::clone(&valid);
            let stop = Arc::clone(&stop);

            move || read_loop(device.as_ref(), &handlers, &valid, &stop)
        })?;

        debug!(
            path = %device.info().path.display(),
            supports_short,
            supports_long,
            "opened HID++ channel"
        );

        Ok(Arc::new(Self {
            supports_short,
            supports_long,
            device,
            handlers,
            send_lock: Mutex::new(()),
            valid,
            stop,
            reader: Mutex::new(Some(reader)),
        }))
    }

    pub fn info(&self) -> &RawDeviceInfo {
        self.device.info()
    }

    /// Whether the node is still usable. Once a read failed, this never
    /// becomes `true` again.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Writes raw bytes to the node.
    ///
    /// Transient errors are retried a few times. Sending on an invalid channel
    /// is a no-op.
    pub fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if !self.is_valid() {
            debug!(path = %self.info().path.display(), "dropping write to invalid channel");
            return Ok(());
        }

        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut attempt = 0;
        loop {
            match self.device.write_report(bytes) {
                Ok(_) => return Ok(()),
                Err(err) if is_transient(&err) && attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                    warn!(%err, attempt, "transient write error, retrying");
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Sends a HID++ report, adapting its framing to what the node supports.
    ///
    /// Short reports are widened if the node only supports long ones. Long
    /// reports cannot be narrowed without losing data and fail with
    /// [`ChannelError::UnsupportedReportKind`] instead.
    pub fn send_report(&self, report: &Report) -> Result<(), ChannelError> {
        let mut report = *report;

        match report.kind() {
            ReportKind::Short if !self.supports_short => report.set_kind(ReportKind::Long),
            ReportKind::Long if !self.supports_long => {
                return Err(ChannelError::UnsupportedReportKind(ReportKind::Long));
            },
            _ => (),
        }

        trace!(?report, "sending");
        self.send(report.as_bytes())
    }

    /// Registers an event handler receiving every inbound report accepted by
    /// `predicate`.
    ///
    /// The callback runs on the reader thread. It must not block on a
    /// transaction over this channel, as the reply could never be read.
    pub fn subscribe(
        &self,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.handlers
            .insert(Box::new(predicate), Box::new(callback))
    }

    /// Checks whether the current thread is this channel's reader thread.
    pub fn is_reader_thread(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }
}

impl Drop for RawChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.wake();

        let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        // The last handle may be dropped by an event handler. The thread
        // exits on its own after the current dispatch then.
        if reader.thread().id() == thread::current().id() {
            return;
        }

        if reader.join().is_err() {
            warn!(path = %self.info().path.display(), "reader thread panicked");
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn read_loop(
    device: &dyn RawHidDevice,
    handlers: &EventHandlerList,
    valid: &AtomicBool,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; READ_BUFFER_LENGTH];

    while !stop.load(Ordering::Acquire) {
        match device.read_report(&mut buf) {
            Ok(Some(0)) | Ok(None) => continue,
            Ok(Some(len)) => {
                trace!(report = ?&buf[..len], "received");
                handlers.dispatch(&buf[..len]);
            },
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(path = %device.info().path.display(), %err, "read failed, invalidating channel");
                valid.store(false, Ordering::Release);
                break;
            },
        }
    }

    debug!(path = %device.info().path.display(), "reader thread stopped");
}

/// Represents an error that occurred when creating or interacting with a raw
/// HID channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The node could not be opened or its basic descriptor queries failed.
    #[error("could not open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading from or writing to the node failed.
    #[error("I/O error on the HID channel")]
    Io(#[from] io::Error),

    /// Indicates that the HID report descriptor could not be parsed.
    #[error("the report descriptor could not be parsed")]
    ReportDescriptor(hidreport::ParserError),

    /// The node is not a HID++ endpoint.
    #[error("not a HID++ device: {0}")]
    InvalidDevice(String),

    /// The node does not support reports of the given framing.
    #[error("the channel does not support {0:?} HID++ reports")]
    UnsupportedReportKind(ReportKind),
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::{mock::MockDevice, *};

    #[test]
    fn rejects_foreign_vendors() {
        let (mut device, _state) = MockDevice::new(0xc548);
        device.info.vendor_id = 0x1234;

        assert!(matches!(
            RawChannel::from_device(device),
            Err(ChannelError::InvalidDevice(_))
        ));
    }

    #[test]
    fn rejects_nodes_without_hidpp() {
        let (mut device, _state) = MockDevice::new(0xc548);
        device.reports = Some((false, false));

        assert!(matches!(
            RawChannel::from_device(device),
            Err(ChannelError::InvalidDevice(_))
        ));
    }

    #[test]
    fn widens_short_reports_for_long_only_nodes() {
        let (mut device, state) = MockDevice::new(0xc548);
        device.reports = Some((false, true));
        let channel = RawChannel::from_device(device).unwrap();

        let report = Report::new(ReportKind::Short, 0xff, 0x81, 0x02);
        channel.send_report(&report).unwrap();

        let writes = state.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), ReportKind::Long.len());
        assert_eq!(&writes[0][..4], &[0x11, 0xff, 0x81, 0x02]);
    }

    #[test]
    fn refuses_long_reports_for_short_only_nodes() {
        let (mut device, _state) = MockDevice::new(0xc548);
        device.reports = Some((true, false));
        let channel = RawChannel::from_device(device).unwrap();

        let report = Report::new(ReportKind::Long, 0xff, 0x83, 0xb5);
        assert!(matches!(
            channel.send_report(&report),
            Err(ChannelError::UnsupportedReportKind(ReportKind::Long))
        ));
    }

    #[test]
    fn dispatches_inbound_reports() {
        let (channel, state) = mock::channel(0xc548);
        let (sender, receiver) = mpsc::channel();

        let _handle = channel.subscribe(
            |raw| raw[0] == SHORT_REPORT_ID,
            move |raw| {
                let _ = sender.send(raw.to_vec());
            },
        );

        state.inject(&[0x02, 0x00, 0x01]);
        state.inject(&[0x10, 0x01, 0x41, 0x04, 0x00, 0x00, 0x00]);

        let raw = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(raw, vec![0x10, 0x01, 0x41, 0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn read_errors_invalidate_the_channel() {
        let (channel, state) = mock::channel(0xc548);
        state.hang_up();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while channel.is_valid() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!channel.is_valid());

        channel.send(&[0x10, 0xff, 0x81, 0x02, 0, 0, 0]).unwrap();
        assert!(state.writes().is_empty());
    }

    #[test]
    fn retries_transient_write_errors() {
        let (channel, state) = mock::channel(0xc548);
        state.fail_next_writes(2);

        channel.send(&[0x10, 0xff, 0x81, 0x02, 0, 0, 0]).unwrap();
        assert_eq!(state.writes().len(), 1);
    }

    #[test]
    fn handles_survive_the_channel() {
        let (channel, _state) = mock::channel(0xc548);
        let handle = channel.subscribe(|_| true, |_| ());

        drop(channel);
        drop(handle);
    }
}
