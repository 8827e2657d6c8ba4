//! The pairing state machine of a receiver.
//!
//! The machine only consumes notifications and tells the receiver what to do
//! next. It never talks to the device itself, so it can run on the reader
//! thread.

use tracing::{debug, trace};

use super::event::{DeviceKind, DiscoveredDevice, ReceiverEvent};

/// The pairing state of a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PairState {
    #[default]
    NotPairing,

    /// A Bolt receiver looks for devices ready to pair.
    Discovering,

    /// A pairing request was sent for a discovered device. Waiting for the
    /// receiver to hand out the passkey.
    FindingPasskey,

    /// Waiting for the device to connect. On Unifying receivers this means the
    /// pairing lock is open.
    Pairing,
}

/// A pairing request for a fully discovered device.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PairRequest {
    pub address: [u8; 6],
    pub authentication: u8,

    /// The number of clicks or key presses making up the passkey.
    pub entropy: u8,

    pub name: String,
    pub kind: DeviceKind,
    pub wpid: u16,
}

/// How a pairing process ended.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PairingOutcome {
    /// The raw error code of the receiver, if pairing failed or was aborted.
    pub error: Option<u8>,

    /// The slot of the newly paired device, if the receiver reported it.
    pub slot: Option<u8>,
}

impl PairingOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// What the receiver has to do after a notification was consumed.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum PairingAction {
    /// Send a pairing request.
    Pair(PairRequest),

    /// Show the passkey to the user.
    Passkey(String),

    /// The pairing process ended.
    Finished(PairingOutcome),
}

/// A device announced during discovery whose name is still being received.
#[derive(Debug)]
struct Candidate {
    device: DiscoveredDevice,
    name: Vec<u8>,

    /// The sequence number the next name chunk has to carry.
    next_counter: u16,
}

impl Candidate {
    fn is_complete(&self) -> bool {
        self.name.len() >= self.device.name_length as usize
    }

    fn request(&self) -> PairRequest {
        let name = &self.name[..self.device.name_length as usize];

        PairRequest {
            address: self.device.address,
            authentication: self.device.authentication,
            entropy: if self.device.kind == DeviceKind::Keyboard {
                20
            } else {
                10
            },
            name: String::from_utf8_lossy(name).into_owned(),
            kind: self.device.kind,
            wpid: self.device.wpid,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Pairing {
    state: PairState,
    candidate: Option<Candidate>,
}

impl Pairing {
    pub(crate) fn state(&self) -> PairState {
        self.state
    }

    /// Enters `state` after pairing was started by the host.
    pub(crate) fn begin(&mut self, state: PairState) {
        self.state = state;
        self.candidate = None;
    }

    /// Returns to [`PairState::NotPairing`], e.g. after a failed request.
    pub(crate) fn reset(&mut self) {
        self.begin(PairState::NotPairing);
    }

    /// Consumes a notification.
    pub(crate) fn handle(&mut self, event: &ReceiverEvent) -> Option<PairingAction> {
        match event {
            ReceiverEvent::DiscoveredDevice(device) if self.state == PairState::Discovering => {
                trace!(?device, "discovered device");
                let candidate = Candidate {
                    device: *device,
                    name: Vec::new(),
                    next_counter: device.counter.wrapping_add(1),
                };
                self.candidate = Some(candidate);
                self.advance()
            },
            ReceiverEvent::DiscoveredName(name) if self.state == PairState::Discovering => {
                let candidate = self.candidate.as_mut()?;
                if name.counter != candidate.next_counter {
                    debug!(
                        expected = candidate.next_counter,
                        got = name.counter,
                        "dropping out of order name chunk"
                    );
                    return None;
                }

                candidate.next_counter = candidate.next_counter.wrapping_add(1);
                candidate.name.extend_from_slice(&name.chunk);
                self.advance()
            },
            ReceiverEvent::PasskeyRequest { passkey, .. }
                if matches!(self.state, PairState::FindingPasskey | PairState::Pairing) =>
            {
                self.state = PairState::Pairing;
                Some(PairingAction::Passkey(passkey.clone()))
            },
            // Discovery also stops once a candidate is being paired.
            ReceiverEvent::DiscoveryStatus { discovering: false, error }
                if self.state == PairState::Discovering =>
            {
                self.finish(*error, None)
            },
            ReceiverEvent::PairingStatus {
                pairing: false,
                error,
                slot,
                ..
            } if self.state != PairState::NotPairing => self.finish(*error, *slot),
            ReceiverEvent::PairingLock { open: false, error }
                if self.state != PairState::NotPairing =>
            {
                self.finish(*error, None)
            },
            _ => None,
        }
    }

    /// Sends the pairing request once the candidate is complete.
    fn advance(&mut self) -> Option<PairingAction> {
        let candidate = self.candidate.take_if(|candidate| candidate.is_complete())?;
        self.state = PairState::FindingPasskey;
        Some(PairingAction::Pair(candidate.request()))
    }

    fn finish(&mut self, error: u8, slot: Option<u8>) -> Option<PairingAction> {
        debug!(from = ?self.state, error, "pairing ended");
        self.reset();

        Some(PairingAction::Finished(PairingOutcome {
            error: Some(error).filter(|&error| error != 0),
            slot,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::event::DiscoveredName;

    fn discovered(counter: u16, name_length: u8) -> ReceiverEvent {
        ReceiverEvent::DiscoveredDevice(DiscoveredDevice {
            counter,
            kind: DeviceKind::Mouse,
            wpid: 0x4082,
            address: [1, 2, 3, 4, 5, 6],
            name_length,
            authentication: 0x0a,
        })
    }

    fn name(counter: u16, chunk: &str) -> ReceiverEvent {
        ReceiverEvent::DiscoveredName(DiscoveredName {
            counter,
            chunk: chunk.as_bytes().to_vec(),
        })
    }

    fn discovering() -> Pairing {
        let mut pairing = Pairing::default();
        pairing.begin(PairState::Discovering);
        pairing
    }

    #[test]
    fn reassembles_names_and_requests_pairing() {
        let mut pairing = discovering();

        assert_eq!(pairing.handle(&discovered(0x0100, 11)), None);
        assert_eq!(pairing.handle(&name(0x0101, "MX Anywh")), None);
        let action = pairing.handle(&name(0x0102, "ere"));

        let Some(PairingAction::Pair(request)) = action else {
            panic!("expected a pairing request, got {action:?}");
        };
        assert_eq!(request.name, "MX Anywhere");
        assert_eq!(request.address, [1, 2, 3, 4, 5, 6]);
        assert_eq!(request.entropy, 10);
        assert_eq!(pairing.state(), PairState::FindingPasskey);
    }

    #[test]
    fn drops_out_of_order_chunks() {
        let mut pairing = discovering();

        pairing.handle(&discovered(7, 6));
        assert_eq!(pairing.handle(&name(9, "ABC")), None);
        assert_eq!(pairing.handle(&name(8, "MX ")), None);
        // The chunk with counter 9 was dropped, so this one is expected next.
        assert!(pairing.handle(&name(9, "ABC")).is_some());
        assert_eq!(pairing.state(), PairState::FindingPasskey);
    }

    #[test]
    fn names_from_an_older_candidate_are_ignored() {
        let mut pairing = discovering();

        pairing.handle(&discovered(1, 4));
        pairing.handle(&discovered(10, 4));
        assert_eq!(pairing.handle(&name(2, "Stal")), None);
        assert_eq!(pairing.state(), PairState::Discovering);
    }

    #[test]
    fn surfaces_the_passkey() {
        let mut pairing = discovering();
        pairing.handle(&discovered(1, 0));
        assert_eq!(pairing.state(), PairState::FindingPasskey);

        let action = pairing.handle(&ReceiverEvent::PasskeyRequest {
            address: [1, 2, 3, 4, 5, 6],
            passkey: "012345".to_string(),
        });

        assert_eq!(action, Some(PairingAction::Passkey("012345".to_string())));
        assert_eq!(pairing.state(), PairState::Pairing);
    }

    #[test]
    fn any_stop_collapses_to_not_pairing() {
        let mut pairing = discovering();
        pairing.handle(&discovered(1, 0));

        let action = pairing.handle(&ReceiverEvent::PairingStatus {
            pairing: false,
            error: 0x02,
            address: [1, 2, 3, 4, 5, 6],
            slot: None,
        });
        assert_eq!(
            action,
            Some(PairingAction::Finished(PairingOutcome {
                error: Some(0x02),
                slot: None,
            }))
        );
        assert_eq!(pairing.state(), PairState::NotPairing);

        pairing.begin(PairState::Pairing);
        let action = pairing.handle(&ReceiverEvent::PairingLock {
            open: false,
            error: 0x00,
        });
        assert!(matches!(
            action,
            Some(PairingAction::Finished(outcome)) if outcome.is_success()
        ));
        assert_eq!(pairing.state(), PairState::NotPairing);

        pairing.begin(PairState::Discovering);
        pairing.handle(&ReceiverEvent::DiscoveryStatus {
            discovering: false,
            error: 0x01,
        });
        assert_eq!(pairing.state(), PairState::NotPairing);
    }

    #[test]
    fn discovery_stop_after_a_request_keeps_pairing() {
        let mut pairing = discovering();
        pairing.handle(&discovered(1, 0));

        let action = pairing.handle(&ReceiverEvent::DiscoveryStatus {
            discovering: false,
            error: 0x00,
        });
        assert_eq!(action, None);
        assert_eq!(pairing.state(), PairState::FindingPasskey);
    }

    #[test]
    fn ignores_events_when_idle() {
        let mut pairing = Pairing::default();
        assert_eq!(pairing.handle(&discovered(1, 0)), None);
        assert_eq!(
            pairing.handle(&ReceiverEvent::PairingLock {
                open: false,
                error: 0,
            }),
            None
        );
    }
}
