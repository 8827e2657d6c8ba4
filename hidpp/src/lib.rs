//! A userspace implementation of Logitech's HID++ protocol over hidraw.
//!
//! Many of Logitech's peripheral devices (mice, keyboards etc.) support
//! features beyond standard [HID](https://en.wikipedia.org/wiki/Human_interface_device),
//! such as scroll wheels dynamically switching between ratchet and freespin
//! mode ([SmartShift](https://support.logi.com/hc/en-us/articles/360052340194-What-is-SmartShift-on-MX-Anywhere-3))
//! or sensors with adjustable resolution. All of them are managed using the
//! HID++ protocol:
//!
//! - HID++1.0 is register based and still spoken by every wireless receiver.
//! - HID++2.0 devices expose numbered features, each with up to 16 functions.
//!   The index of a feature differs from device to device and is looked up
//!   once per session.
//!
//! Logitech kindly provided a [public Google Drive folder](https://drive.google.com/drive/folders/0BxbRzx7vEV7eWmgwazJ3NUFfQ28)
//! with a lot of documentation on HID++ and several device features. The
//! [Solaar](https://github.com/pwr-Solaar/Solaar) project is the other
//! valuable source of knowledge about receivers.
//!
//! # Layers
//!
//! - [`report`] frames short (7 byte) and long (20 byte) reports.
//! - [`channel`] owns a hidraw node and its reader thread and dispatches every
//!   inbound report to the registered event handlers.
//! - [`transport`] correlates requests with replies for one device index and
//!   enforces the I/O timeout.
//! - [`device`] probes a device index (protocol version, stability,
//!   identification) and tracks whether the device is asleep.
//! - [`receiver`] manages the devices paired with a wireless receiver and
//!   drives pairing.
//! - [`monitor`] turns hotplug notifications into sessions, retrying devices
//!   that are not ready yet.
//! - [`feature`] holds the clients of individual HID++2.0 features.
//!
//! The implementation is synchronous: callers block until their reply arrived
//! while a reader thread per node receives reports. Work that has to be done
//! in reaction to an event runs on the [`workqueue::WorkerPool`] of the
//! [`context::Context`] every session is created with.
//!
//! # Quickstart
//!
//! ```no_run
//! use logid_hidpp::{
//!     context::Context,
//!     device::Device,
//!     feature::{adjustable_dpi::AdjustableDpi, smartshift::{SmartShift, WheelMode}},
//!     options::Options,
//!     report::DEFAULT_DEVICE_INDEX,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Context::new(Options::default())?;
//!
//! // A mouse connected by cable or Bluetooth answers at the default index.
//! let device = Device::open(&context, "/dev/hidraw3", DEFAULT_DEVICE_INDEX)?;
//! println!("{} speaks HID++{}", device.name(), device.version());
//!
//! let dpi = device.get_feature::<AdjustableDpi>()?;
//! let supported = dpi.dpi_list(0)?;
//! if let Some(value) = supported.closest(1600) {
//!     dpi.set_dpi(0, value)?;
//! }
//!
//! SmartShift::attach_any(&device)?.set_status(Some(WheelMode::Ratchet), Some(10), None)?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod context;
pub mod device;
pub mod feature;
pub mod listener;
pub mod monitor;
pub mod nibble;
pub mod options;
pub mod protocol;
pub mod receiver;
pub mod report;
pub mod transport;
pub mod workqueue;
