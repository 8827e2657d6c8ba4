//! An in-memory [`RawHidDevice`] used by the unit tests.

use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use super::{LOGITECH_VENDOR_ID, RawChannel, RawDeviceInfo, RawHidDevice};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Inbound {
    reports: VecDeque<Vec<u8>>,
    woken: bool,
    hung_up: bool,
}

#[derive(Default)]
struct Outbound {
    writes: Vec<Vec<u8>>,
    failures: usize,
}

/// The test-side view of a [`MockDevice`].
#[derive(Default)]
pub(crate) struct MockState {
    inbound: Mutex<Inbound>,
    inbound_cond: Condvar,
    outbound: Mutex<Outbound>,
    outbound_cond: Condvar,
    responder: Mutex<Option<Responder>>,
}

impl MockState {
    /// Queues a report for the reader thread.
    pub(crate) fn inject(&self, raw: &[u8]) {
        self.inbound.lock().unwrap().reports.push_back(raw.to_vec());
        self.inbound_cond.notify_all();
    }

    /// Installs a function producing the replies to every written report.
    pub(crate) fn respond_with(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().unwrap().writes.clone()
    }

    /// Waits until at least `count` reports were written.
    pub(crate) fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut outbound = self.outbound.lock().unwrap();

        while outbound.writes.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            outbound = self.outbound_cond.wait_timeout(outbound, remaining).unwrap().0;
        }

        outbound.writes.clone()
    }

    /// Makes the next `count` writes fail with a transient error.
    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.outbound.lock().unwrap().failures = count;
    }

    /// Makes every following read fail, as if the node was unplugged.
    pub(crate) fn hang_up(&self) {
        self.inbound.lock().unwrap().hung_up = true;
        self.inbound_cond.notify_all();
    }
}

pub(crate) struct MockDevice {
    pub(crate) info: RawDeviceInfo,
    pub(crate) reports: Option<(bool, bool)>,
    state: Arc<MockState>,
}

impl MockDevice {
    pub(crate) fn new(product_id: u16) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let device = Self {
            info: RawDeviceInfo {
                path: PathBuf::from(format!("/dev/mock-{product_id:04x}")),
                bus_type: 0x03,
                vendor_id: LOGITECH_VENDOR_ID,
                product_id,
                name: format!("Mock {product_id:04x}"),
            },
            reports: Some((true, true)),
            state: Arc::clone(&state),
        };

        (device, state)
    }
}

impl RawHidDevice for MockDevice {
    fn info(&self) -> &RawDeviceInfo {
        &self.info
    }

    fn write_report(&self, src: &[u8]) -> io::Result<usize> {
        {
            let mut outbound = self.state.outbound.lock().unwrap();
            if outbound.failures > 0 {
                outbound.failures -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            outbound.writes.push(src.to_vec());
        }
        self.state.outbound_cond.notify_all();

        let replies = match self.state.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(src),
            None => Vec::new(),
        };
        for reply in replies {
            self.state.inject(&reply);
        }

        Ok(src.len())
    }

    fn read_report(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut inbound = self.state.inbound.lock().unwrap();

        loop {
            if let Some(report) = inbound.reports.pop_front() {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                return Ok(Some(len));
            }
            if inbound.woken {
                inbound.woken = false;
                return Ok(None);
            }
            if inbound.hung_up {
                return Err(io::ErrorKind::NotConnected.into());
            }

            inbound = self.state.inbound_cond.wait(inbound).unwrap();
        }
    }

    fn wake(&self) {
        self.state.inbound.lock().unwrap().woken = true;
        self.state.inbound_cond.notify_all();
    }

    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        self.reports
    }

    fn report_descriptor(&self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Opens a channel over a fresh mock node supporting both report kinds.
pub(crate) fn channel(product_id: u16) -> (Arc<RawChannel>, Arc<MockState>) {
    let (device, state) = MockDevice::new(product_id);
    let channel = RawChannel::from_device(device).unwrap();
    (channel, state)
}
