//! The Linux hidraw backend of [`RawHidDevice`].
//!
//! The node is opened non-blocking and registered edge-triggered with an
//! epoll instance, next to an eventfd used to wake the reader for shutdown.
//! Since the registration is edge-triggered, reads always drain the node
//! until it reports `EWOULDBLOCK` before waiting again.

use std::{
    ffi::CStr,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
};

use super::{ChannelError, RawDeviceInfo, RawHidDevice};

// From linux/hidraw.h:
// #define HIDIOCGRDESCSIZE    _IOR('H', 0x01, int)
// #define HIDIOCGRDESC        _IOR('H', 0x02, struct hidraw_report_descriptor)
// #define HIDIOCGRAWINFO      _IOR('H', 0x03, struct hidraw_devinfo)
// #define HIDIOCGRAWNAME(len) _IOC(_IOC_READ, 'H', 0x04, len)

const HIDRAW_MAGIC: u8 = b'H';
const IOC_READ: u32 = 2;

/// The largest report descriptor the kernel hands out.
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

const NAME_BUFFER_LENGTH: usize = 256;

const NODE_TOKEN: u64 = 0;
const WAKE_TOKEN: u64 = 1;

const fn ior(nr: u32, size: usize) -> u32 {
    (IOC_READ << 30) | (((size as u32) & 0x3fff) << 16) | ((HIDRAW_MAGIC as u32) << 8) | nr
}

#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

#[repr(C)]
#[derive(Default)]
struct HidrawDevinfo {
    bustype: u32,
    vendor: i16,
    product: i16,
}

const HIDIOCGRDESCSIZE: u32 = ior(0x01, size_of::<libc::c_int>());
const HIDIOCGRDESC: u32 = ior(0x02, size_of::<HidrawReportDescriptor>());
const HIDIOCGRAWINFO: u32 = ior(0x03, size_of::<HidrawDevinfo>());
const HIDIOCGRAWNAME: u32 = ior(0x04, NAME_BUFFER_LENGTH);

/// Converts the return value of a libc call into an [`io::Result`].
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// A `/dev/hidrawN` node.
pub struct HidrawDevice {
    file: File,
    epoll: OwnedFd,
    wake: OwnedFd,
    info: RawDeviceInfo,
}

impl HidrawDevice {
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        let open_err = |source: io::Error| ChannelError::Open {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(open_err)?;

        let (bus_type, vendor_id, product_id) = raw_info(&file).map_err(open_err)?;
        let name = raw_name(&file).map_err(open_err)?;

        let (epoll, wake) = setup_epoll(&file).map_err(open_err)?;

        Ok(Self {
            file,
            epoll,
            wake,
            info: RawDeviceInfo {
                path: path.to_path_buf(),
                bus_type,
                vendor_id,
                product_id,
                name,
            },
        })
    }

    fn drain_wake(&self) {
        let mut counter = [0u8; 8];
        // SAFETY: the eventfd is owned by `self` and the buffer is 8 bytes
        // long, the size of an eventfd counter.
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                counter.as_mut_ptr() as *mut libc::c_void,
                counter.len(),
            );
        }
    }
}

fn raw_info(file: &File) -> io::Result<(u32, u16, u16)> {
    let mut info = HidrawDevinfo::default();
    // SAFETY: HIDIOCGRAWINFO writes exactly one `struct hidraw_devinfo`.
    cvt(unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRAWINFO as _, &mut info) })?;

    Ok((info.bustype, info.vendor as u16, info.product as u16))
}

fn raw_name(file: &File) -> io::Result<String> {
    let mut buf = [0u8; NAME_BUFFER_LENGTH];
    // SAFETY: the size encoded in HIDIOCGRAWNAME is the length of `buf`.
    cvt(unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRAWNAME as _, buf.as_mut_ptr()) })?;

    Ok(CStr::from_bytes_until_nul(&buf)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default())
}

fn setup_epoll(file: &File) -> io::Result<(OwnedFd, OwnedFd)> {
    // SAFETY: both calls return a new file descriptor or -1. Ownership of a
    // valid descriptor is handed to an `OwnedFd` right away.
    let epoll = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
    let wake = unsafe {
        OwnedFd::from_raw_fd(cvt(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?)
    };

    for (fd, token) in [(file.as_raw_fd(), NODE_TOKEN), (wake.as_raw_fd(), WAKE_TOKEN)] {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: token,
        };
        // SAFETY: all descriptors are open and `event` outlives the call.
        cvt(unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) })?;
    }

    Ok((epoll, wake))
}

impl RawHidDevice for HidrawDevice {
    fn info(&self) -> &RawDeviceInfo {
        &self.info
    }

    fn write_report(&self, src: &[u8]) -> io::Result<usize> {
        (&self.file).write(src)
    }

    fn read_report(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match (&self.file).read(buf) {
                Ok(len) => return Ok(Some(len)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
            // SAFETY: `events` has room for the 2 events passed as maximum.
            let ready = unsafe {
                libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), 2, -1)
            };
            let ready = match cvt(ready) {
                Ok(ready) => ready as usize,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            for event in &events[..ready] {
                let token = event.u64;
                let flags = event.events;

                if token == WAKE_TOKEN {
                    self.drain_wake();
                    return Ok(None);
                }
                if flags & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
                    && flags & libc::EPOLLIN as u32 == 0
                {
                    return Err(io::ErrorKind::NotConnected.into());
                }
            }
        }
    }

    fn wake(&self) {
        let one = 1u64.to_ne_bytes();
        // SAFETY: the eventfd is owned by `self`, writes of 8 bytes increment
        // its counter.
        unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                one.as_ptr() as *const libc::c_void,
                one.len(),
            );
        }
    }

    fn report_descriptor(&self) -> io::Result<Vec<u8>> {
        let mut size: libc::c_int = 0;
        // SAFETY: HIDIOCGRDESCSIZE writes a single int.
        cvt(unsafe { libc::ioctl(self.file.as_raw_fd(), HIDIOCGRDESCSIZE as _, &mut size) })?;

        let mut descriptor = Box::new(HidrawReportDescriptor {
            size: (size.max(0) as u32).min(HID_MAX_DESCRIPTOR_SIZE as u32),
            value: [0u8; HID_MAX_DESCRIPTOR_SIZE],
        });
        // SAFETY: HIDIOCGRDESC fills at most `HID_MAX_DESCRIPTOR_SIZE` bytes
        // of the boxed descriptor.
        cvt(unsafe {
            libc::ioctl(self.file.as_raw_fd(), HIDIOCGRDESC as _, &mut *descriptor)
        })?;

        Ok(descriptor.value[..descriptor.size as usize].to_vec())
    }
}
