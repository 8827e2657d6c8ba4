//! Tunables shared by every session created from the same monitor.

use std::time::Duration;

use crate::nibble::U4;

/// The software ID used for fire-and-forget requests. Replies carrying it are
/// never matched against pending transactions.
pub const NO_RESPONSE_SOFTWARE_ID: u8 = 0x0f;

/// Configures transports, sessions and the device monitor.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Options {
    /// How long a transaction waits for its reply.
    pub io_timeout_ms: u64,

    /// The software ID stamped into HID++2.0 requests. Must be neither `0`
    /// (used by device notifications) nor [`NO_RESPONSE_SOFTWARE_ID`].
    pub software_id: u8,

    /// The amount of threads of the worker pool.
    pub worker_threads: usize,

    /// The delay before the first retry of a device that was not ready. Every
    /// following retry doubles it.
    pub retry_base_delay_ms: u64,

    pub retry_max_attempts: u32,

    /// The amount of HID++1.0 transaction slots per transport. Requests whose
    /// sub IDs map to the same slot are serialized.
    pub v10_slot_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            io_timeout_ms: 500,
            software_id: 1,
            worker_threads: 4,
            retry_base_delay_ms: 100,
            retry_max_attempts: 5,
            v10_slot_count: 4,
        }
    }
}

impl Options {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// The software ID to use for requests, falling back to the default if the
    /// configured one is reserved or out of range.
    pub fn software_id(&self) -> U4 {
        match self.software_id {
            0 | NO_RESPONSE_SOFTWARE_ID | 0x10.. => U4::from_lo(Self::default().software_id),
            id => U4::from_lo(id),
        }
    }

    /// The delay before retry number `attempt`, starting at 0.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay()
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}
