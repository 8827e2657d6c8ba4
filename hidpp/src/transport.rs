//! Implements request/response correlation on top of a [`RawChannel`].
//!
//! A [`Transport`] is bound to one device index. Every request occupies a slot
//! of a small table until its reply, an error reply or the timeout arrives:
//!
//! - HID++1.0 requests are keyed by sub ID and register address. The slot is
//!   picked from the sub ID modulo the configured slot count.
//! - HID++2.0 requests are keyed by feature index, function and software ID.
//!   The slot is picked from the feature index modulo 16.
//!
//! A request whose slot is occupied blocks until the slot is free again, so
//! at most one request per slot is outstanding. Replies are matched on the
//! reader thread of the channel, which wakes up the waiting caller.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    channel::{ChannelError, HandlerHandle, RawChannel},
    nibble::U4,
    options::{NO_RESPONSE_SOFTWARE_ID, Options},
    protocol::{v10::Hidpp10Error, v20::Hidpp20Error},
    report::{LONG_REPORT_ID, Report, SHORT_REPORT_ID},
};

/// The size of the HID++2.0 slot table.
const V20_SLOT_COUNT: usize = 16;

/// The protocol a request is sent with. Decides which slot table it uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Protocol {
    V10,
    V20,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ProtocolError {
    V10(Hidpp10Error),
    V20(Hidpp20Error),
}

struct Pending {
    /// Bytes 2 and 3 of the request. Replies and error replies echo them.
    key: [u8; 2],
    result: Option<Result<Report, ProtocolError>>,
}

struct Slots {
    v10: Vec<Option<Pending>>,
    v20: Vec<Option<Pending>>,
}

impl Slots {
    fn table(&mut self, protocol: Protocol) -> &mut [Option<Pending>] {
        match protocol {
            Protocol::V10 => &mut self.v10,
            Protocol::V20 => &mut self.v20,
        }
    }

    fn slot(&mut self, protocol: Protocol, key: [u8; 2]) -> &mut Option<Pending> {
        let table = self.table(protocol);
        let index = key[0] as usize % table.len();
        &mut table[index]
    }

    /// Completes the pending request with the given key, if any.
    ///
    /// Returns whether a request was completed.
    fn complete(
        &mut self,
        protocol: Protocol,
        key: [u8; 2],
        result: Result<Report, ProtocolError>,
    ) -> bool {
        match self.slot(protocol, key) {
            Some(pending) if pending.key == key && pending.result.is_none() => {
                pending.result = Some(result);
                true
            },
            _ => false,
        }
    }

    /// Matches an inbound report against all pending requests.
    fn deposit(&mut self, report: Report) -> bool {
        if let Some(err) = report.hidpp10_error() {
            let key = [err.sub_id, err.address];
            let result = Err(ProtocolError::V10(Hidpp10Error::new(err.code)));

            // HID++1.0 devices answer HID++2.0 requests with HID++1.0 errors,
            // the feature index and function/software ID byte taking the
            // place of the sub ID and address.
            return self.complete(Protocol::V10, key, result)
                || self.complete(Protocol::V20, key, result);
        }

        if let Some(err) = report.hidpp20_error() {
            let key = [
                err.feature_index,
                U4::combine(err.function, err.software_id),
            ];
            return self.complete(
                Protocol::V20,
                key,
                Err(ProtocolError::V20(Hidpp20Error::new(err.code))),
            );
        }

        let key = [report.sub_id(), report.address()];
        self.complete(Protocol::V10, key, Ok(report))
            || self.complete(Protocol::V20, key, Ok(report))
    }
}

struct Correlation {
    slots: Mutex<Slots>,
    cond: Condvar,
}

impl Correlation {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sends requests to a single device index and waits for their replies.
pub struct Transport {
    channel: Arc<RawChannel>,
    device_index: u8,
    software_id: U4,
    timeout: Duration,
    correlation: Arc<Correlation>,

    /// Keeps the reply dispatcher registered on the channel.
    _dispatcher: HandlerHandle,
}

impl Transport {
    pub fn new(channel: Arc<RawChannel>, device_index: u8, options: &Options) -> Self {
        let correlation = Arc::new(Correlation {
            slots: Mutex::new(Slots {
                v10: (0..options.v10_slot_count.max(1)).map(|_| None).collect(),
                v20: (0..V20_SLOT_COUNT).map(|_| None).collect(),
            }),
            cond: Condvar::new(),
        });

        let dispatcher = channel.subscribe(
            move |raw| {
                raw.len() > 1
                    && (raw[0] == SHORT_REPORT_ID || raw[0] == LONG_REPORT_ID)
                    && raw[1] == device_index
            },
            {
                let correlation = Arc::clone(&correlation);
                move |raw| {
                    let Ok(report) = Report::from_bytes(raw) else {
                        return;
                    };

                    if correlation.lock().deposit(report) {
                        correlation.cond.notify_all();
                    }
                }
            },
        );

        Self {
            channel,
            device_index,
            software_id: options.software_id(),
            timeout: options.io_timeout(),
            correlation,
            _dispatcher: dispatcher,
        }
    }

    pub fn channel(&self) -> &Arc<RawChannel> {
        &self.channel
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    /// The software ID stamped into HID++2.0 requests.
    pub fn software_id(&self) -> U4 {
        self.software_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a HID++1.0 request and waits for its reply.
    pub fn transact10(&self, report: Report) -> Result<Report, TransactError> {
        self.transact(report, Protocol::V10)
    }

    /// Sends a HID++2.0 request and waits for its reply.
    ///
    /// The software ID of the report is replaced by the one of the transport.
    pub fn transact20(&self, report: Report) -> Result<Report, TransactError> {
        self.transact(report, Protocol::V20)
    }

    /// Sends a request and waits for its reply.
    ///
    /// Blocks while another request is outstanding on the same slot. Fails with
    /// [`TransactError::Timeout`] if no reply arrived in time, or with the
    /// protocol error the device replied with.
    ///
    /// Must not be called from the reader thread of the channel.
    pub fn transact(&self, mut report: Report, protocol: Protocol) -> Result<Report, TransactError> {
        report.set_device_index(self.device_index);
        if protocol == Protocol::V20 {
            report.set_software_id(self.software_id);
        }

        let key = [report.sub_id(), report.address()];

        let mut slots = self.correlation.lock();
        while slots.slot(protocol, key).is_some() {
            slots = self
                .correlation
                .cond
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *slots.slot(protocol, key) = Some(Pending { key, result: None });
        drop(slots);

        if let Err(err) = self.channel.send_report(&report) {
            self.release(protocol, key);
            return Err(err.into());
        }

        let deadline = Instant::now() + self.timeout;
        let mut slots = self.correlation.lock();
        let result = loop {
            if let Some(result) = slots
                .slot(protocol, key)
                .as_mut()
                .and_then(|pending| pending.result.take())
            {
                break Some(result);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break None;
            }

            slots = self
                .correlation
                .cond
                .wait_timeout(slots, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        *slots.slot(protocol, key) = None;
        drop(slots);
        self.correlation.cond.notify_all();

        match result {
            Some(Ok(reply)) => {
                trace!(?reply, "transaction completed");
                Ok(reply)
            },
            Some(Err(ProtocolError::V10(err))) => Err(err.into()),
            Some(Err(ProtocolError::V20(err))) => Err(err.into()),
            None => {
                debug!(
                    device_index = self.device_index,
                    ?report,
                    "transaction timed out"
                );
                Err(TransactError::Timeout(self.timeout))
            },
        }
    }

    /// Sends a HID++2.0 request without waiting for a reply.
    ///
    /// The request carries a software ID no transaction uses, so a reply the
    /// device may still send is ignored.
    pub fn send_no_response(&self, mut report: Report) -> Result<(), TransactError> {
        report.set_device_index(self.device_index);
        report.set_software_id(U4::from_lo(NO_RESPONSE_SOFTWARE_ID));
        self.channel.send_report(&report)?;
        Ok(())
    }

    fn release(&self, protocol: Protocol, key: [u8; 2]) {
        *self.correlation.lock().slot(protocol, key) = None;
        self.correlation.cond.notify_all();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("path", &self.channel.info().path)
            .field("device_index", &self.device_index)
            .field("software_id", &self.software_id)
            .finish()
    }
}

/// Represents an error that occurred during a transaction.
#[derive(Debug, Error)]
pub enum TransactError {
    /// No reply arrived within the I/O timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The device replied with a HID++1.0 error.
    #[error(transparent)]
    Hidpp10(#[from] Hidpp10Error),

    /// The device replied with a HID++2.0 error.
    #[error(transparent)]
    Hidpp20(#[from] Hidpp20Error),

    /// The request could not be written.
    #[error("the HID channel returned an error")]
    Channel(#[from] ChannelError),

    /// The device is asleep and has to be woken up first.
    #[error("the device is asleep")]
    Asleep,

    /// The session was closed or lost its channel.
    #[error("the device session is closed")]
    Closed,
}

impl TransactError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::thread;

    use super::*;
    use crate::{
        channel::mock,
        protocol::{v10, v20},
        report::ReportKind,
    };

    /// Builds a reply echoing the header of `request` with the given params.
    pub(crate) fn reply(request: &[u8], params: &[u8]) -> Vec<u8> {
        let mut report = Report::from_bytes(request).unwrap();
        report.params_mut().fill(0);
        report.set_params(params);
        report.as_bytes().to_vec()
    }

    /// Like [`reply`], but always answers with a long report, as HID++2.0
    /// devices do for functions returning more than 3 bytes.
    pub(crate) fn long_reply(request: &[u8], params: &[u8]) -> Vec<u8> {
        let mut report = Report::from_bytes(request).unwrap();
        report.set_kind(ReportKind::Long);
        report.params_mut().fill(0);
        report.set_params(params);
        report.as_bytes().to_vec()
    }

    pub(crate) fn v20_error(request: &[u8], code: v20::ErrorCode) -> Vec<u8> {
        let mut raw = vec![0u8; ReportKind::Long.len()];
        raw[..6].copy_from_slice(&[0x11, request[1], 0xff, request[2], request[3], code.into()]);
        raw
    }

    pub(crate) fn v10_error(request: &[u8], code: v10::ErrorCode) -> Vec<u8> {
        vec![0x10, request[1], 0x8f, request[2], request[3], code.into(), 0x00]
    }

    fn options(timeout_ms: u64) -> Options {
        Options {
            io_timeout_ms: timeout_ms,
            software_id: 0x02,
            ..Options::default()
        }
    }

    #[test]
    fn reads_sensor_count() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(|request| vec![reply(request, &[0x03, 0x00, 0x00])]);
        let transport = Transport::new(channel, 0x01, &options(500));

        let request = Report::new_v20(ReportKind::Short, 0, 0x04, U4::from_lo(0), U4::from_lo(0));
        let response = transport.transact20(request).unwrap();

        assert_eq!(state.writes()[0], vec![0x10, 0x01, 0x04, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(response.params()[0], 0x03);
    }

    #[test]
    fn times_out_once_and_frees_the_slot() {
        let (channel, state) = mock::channel(0xc548);
        let transport = Transport::new(channel, 0x01, &options(30));
        let request = Report::new_v20(ReportKind::Long, 0, 0x05, U4::from_lo(1), U4::from_lo(0));

        let started = Instant::now();
        assert!(transport.transact20(request).unwrap_err().is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(30));

        state.respond_with(|request| vec![reply(request, &[0x01])]);
        let response = transport.transact20(request).unwrap();
        assert_eq!(response.params()[0], 0x01);
        assert_eq!(state.writes().len(), 2);
    }

    #[test]
    fn serializes_requests_on_the_same_slot() {
        let (channel, state) = mock::channel(0xc548);
        let transport = Arc::new(Transport::new(channel, 0x01, &options(2000)));
        let request = Report::new_v20(ReportKind::Short, 0, 0x03, U4::from_lo(0), U4::from_lo(0));

        let callers: Vec<_> = (0..2)
            .map(|_| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || transport.transact20(request))
            })
            .collect();

        let writes = state.wait_for_writes(1, Duration::from_secs(1));
        assert_eq!(writes.len(), 1);

        // The second caller must not send before the first one completed.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(state.writes().len(), 1);

        state.inject(&reply(&writes[0], &[0xaa]));
        let writes = state.wait_for_writes(2, Duration::from_secs(1));
        assert_eq!(writes.len(), 2);
        state.inject(&reply(&writes[1], &[0xbb]));

        let mut results: Vec<u8> = callers
            .into_iter()
            .map(|caller| caller.join().unwrap().unwrap().params()[0])
            .collect();
        results.sort_unstable();
        assert_eq!(results, vec![0xaa, 0xbb]);
    }

    #[test]
    fn requests_on_different_slots_are_concurrent() {
        let (channel, state) = mock::channel(0xc548);
        let transport = Arc::new(Transport::new(channel, 0x01, &options(2000)));

        let callers: Vec<_> = [0x03u8, 0x04]
            .into_iter()
            .map(|feature_index| {
                let transport = Arc::clone(&transport);
                let request = Report::new_v20(
                    ReportKind::Short,
                    0,
                    feature_index,
                    U4::from_lo(0),
                    U4::from_lo(0),
                );
                thread::spawn(move || transport.transact20(request))
            })
            .collect();

        let writes = state.wait_for_writes(2, Duration::from_secs(1));
        assert_eq!(writes.len(), 2);
        for write in &writes {
            state.inject(&reply(write, &[write[2]]));
        }

        for caller in callers {
            let response = caller.join().unwrap().unwrap();
            assert_eq!(response.params()[0], response.feature_index());
        }
    }

    #[test]
    fn maps_hidpp20_errors() {
        let (channel, state) = mock::channel(0xc548);
        state.respond_with(|request| vec![v20_error(request, v20::ErrorCode::InvalidFeatureIndex)]);
        let transport = Transport::new(channel, 0x01, &options(500));

        let request = Report::new_v20(ReportKind::Long, 0, 0x09, U4::from_lo(2), U4::from_lo(0));
        match transport.transact20(request) {
            Err(TransactError::Hidpp20(err)) => {
                assert!(err.is(v20::ErrorCode::InvalidFeatureIndex));
            },
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn hidpp10_errors_resolve_hidpp20_requests() {
        let (channel, state) = mock::channel(0xc52b);
        state.respond_with(|request| vec![v10_error(request, v10::ErrorCode::InvalidSubId)]);
        let transport = Transport::new(channel, 0x02, &options(500));

        let request = Report::new_v20(ReportKind::Short, 0, 0x00, U4::from_lo(1), U4::from_lo(0));
        match transport.transact20(request) {
            Err(TransactError::Hidpp10(err)) => assert!(err.is(v10::ErrorCode::InvalidSubId)),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn ignores_replies_for_other_device_indices() {
        let (channel, state) = mock::channel(0xc52b);
        state.respond_with(|request| {
            let mut other = reply(request, &[0x01]);
            other[1] = 0x03;
            vec![other]
        });
        let transport = Transport::new(channel, 0x02, &options(30));

        let request = Report::new(ReportKind::Short, 0, 0x81, 0x02);
        assert!(transport.transact10(request).unwrap_err().is_timeout());
    }

    #[test]
    fn no_response_requests_use_their_own_software_id() {
        let (channel, state) = mock::channel(0xc548);
        let transport = Transport::new(channel, 0x01, &options(500));

        let request = Report::new_v20(ReportKind::Long, 0, 0x0b, U4::from_lo(1), U4::from_lo(0));
        transport.send_no_response(request).unwrap();

        assert_eq!(state.writes()[0][3], 0x1f);
    }
}
