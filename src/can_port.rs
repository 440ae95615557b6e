//! Hardware mailboxes + software RX rings (spec.md §4.2).
//!
//! `CanPort` owns the fixed budget of 7 mailboxes. Each mailbox is either
//! free or owns exactly one filter definition (spec.md §3 invariant) plus an
//! 8-entry software RX ring fed from interrupt context. The hybrid
//! hardware/software filter split (pass filters programmed into the
//! controller, block filters accepted in hardware and dropped in software)
//! lives in `MailboxRole` rather than per-channel parallel arrays, so the
//! raw CAN channel and the ISO-TP channel share one representation of "what
//! is this mailbox for" (REDESIGN FLAGS, spec.md §9).

use crate::can_frame::CanFrame;
use crate::hw::CanTransceiver;

/// Exactly 7 mailboxes (spec.md §6 Hardware budget; Open Question 8 takes
/// `MAILBOX_COUNT = 7` as canonical over the divergent reference copies).
pub const MAILBOX_COUNT: usize = 7;

const RING_CAPACITY: usize = 8;

/// What a mailbox is being used for once installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxRole {
    /// Raw CAN pass filter: the hardware filter alone decides admission.
    PassFilter,
    /// Raw CAN block filter: hardware accepts everything: `update()` drops
    /// frames matching `pattern`/`mask` in software.
    BlockFilter { pattern: u32, mask: u32 },
    /// ISO-TP flow-control binding: `pattern`/`mask` match the request CAN
    /// ID, `flowcontrol_id` is the ID to transmit FC/CF frames on.
    FlowControl { flowcontrol_id: u32 },
}

/// A single-producer (mailbox interrupt) / single-consumer (main loop)
/// bounded ring of received frames. New frames are dropped on overflow —
/// there is no overflow counter, matching spec.md §4.2 (Open Question 7
/// leaves adding one to a future extension; since spec.md names no IOCTL id
/// to surface it through, this crate does not invent one).
struct FrameRing {
    slots: [Option<CanFrame>; RING_CAPACITY],
    head: usize,
    tail: usize,
    count: usize,
}

impl FrameRing {
    const fn new() -> Self {
        const NONE: Option<CanFrame> = None;
        Self {
            slots: [NONE; RING_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Pushes a frame; returns `false` (and drops it) if the ring is full.
    fn push(&mut self, frame: CanFrame) -> bool {
        if self.count == RING_CAPACITY {
            return false;
        }
        self.slots[self.tail] = Some(frame);
        self.tail = (self.tail + 1) % RING_CAPACITY;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<CanFrame> {
        if self.count == 0 {
            return None;
        }
        let frame = self.slots[self.head].take();
        self.head = (self.head + 1) % RING_CAPACITY;
        self.count -= 1;
        frame
    }
}

struct Mailbox {
    role: MailboxRole,
    ring: FrameRing,
}

/// Error installing or removing a mailbox filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxError {
    OutOfRange,
    AlreadyInUse,
    NotInUse,
}

/// Owns the 7-mailbox resource shared by the raw CAN channel and the ISO-TP
/// channel (only one of which exists at a time, per the channel registry).
pub struct CanPort<D: CanTransceiver> {
    transceiver: D,
    mailboxes: [Option<Mailbox>; MAILBOX_COUNT],
}

impl<D: CanTransceiver> CanPort<D> {
    pub fn new(transceiver: D) -> Self {
        const NONE: Option<Mailbox> = None;
        Self {
            transceiver,
            mailboxes: [NONE; MAILBOX_COUNT],
        }
    }

    /// Initializes the controller and blanks every mailbox to block-all.
    pub fn enable(&mut self, baud: u32) -> Result<(), ()> {
        self.transceiver.enable(baud)?;
        for id in 0..MAILBOX_COUNT {
            self.transceiver.clear_filter(id as u8);
            self.mailboxes[id] = None;
        }
        Ok(())
    }

    pub fn disable(&mut self) {
        self.transceiver.disable();
        for id in 0..MAILBOX_COUNT {
            self.mailboxes[id] = None;
        }
    }

    /// Installs a filter on mailbox `id`. `hw_pattern`/`hw_mask` are what get
    /// programmed into the hardware filter (for a block filter this is
    /// `(0, 0)`, i.e. accept-all, with the real pattern/mask carried in
    /// `role` for the software check in `drain`).
    pub fn set_filter(
        &mut self,
        id: usize,
        hw_pattern: u32,
        hw_mask: u32,
        extended: bool,
        role: MailboxRole,
    ) -> Result<(), MailboxError> {
        if id >= MAILBOX_COUNT {
            return Err(MailboxError::OutOfRange);
        }
        if self.mailboxes[id].is_some() {
            return Err(MailboxError::AlreadyInUse);
        }
        self.transceiver
            .set_filter(id as u8, hw_pattern, hw_mask, extended);
        self.mailboxes[id] = Some(Mailbox {
            role,
            ring: FrameRing::new(),
        });
        Ok(())
    }

    /// Restores block-all on mailbox `id` and clears its ring.
    pub fn clear_filter(&mut self, id: usize) -> Result<(), MailboxError> {
        if id >= MAILBOX_COUNT {
            return Err(MailboxError::OutOfRange);
        }
        if self.mailboxes[id].is_none() {
            return Err(MailboxError::NotInUse);
        }
        self.transceiver.clear_filter(id as u8);
        self.mailboxes[id] = None;
        Ok(())
    }

    #[inline]
    pub fn is_in_use(&self, id: usize) -> bool {
        id < MAILBOX_COUNT && self.mailboxes[id].is_some()
    }

    pub fn role(&self, id: usize) -> Option<MailboxRole> {
        self.mailboxes.get(id)?.as_ref().map(|m| m.role)
    }

    /// Non-blocking send through the controller.
    pub fn send(&mut self, frame: &CanFrame) -> nb::Result<(), ()> {
        self.transceiver.transmit(frame)
    }

    /// Pops one received frame off mailbox `id`'s ring, if any.
    pub fn try_recv(&mut self, id: usize) -> Option<CanFrame> {
        self.mailboxes.get_mut(id)?.as_mut()?.ring.pop()
    }

    /// Called from interrupt context when the controller delivers a frame
    /// to mailbox `id`. Frames for mailboxes that are not in use, or whose
    /// ring is full, are dropped silently (spec.md §4.2/§5).
    pub fn on_mailbox_interrupt(&mut self, id: usize, frame: CanFrame) {
        if let Some(Some(mailbox)) = self.mailboxes.get_mut(id) {
            mailbox.ring.push(frame);
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, id: usize, frame: CanFrame) {
        self.on_mailbox_interrupt(id, frame);
    }

    #[cfg(test)]
    pub(crate) fn transceiver(&self) -> &D {
        &self.transceiver
    }

    /// Escape hatch for the firmware binary's CAN RX interrupt handler,
    /// which needs to pull frames off the hardware directly rather than
    /// through the `CanTransceiver` trait (spec.md §2 CanPort owns the
    /// mailbox rings, not the raw receive path).
    pub fn transceiver_mut(&mut self) -> &mut D {
        &mut self.transceiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTransceiver {
        enabled: bool,
        sent: heapless::Vec<CanFrame, 16>,
    }

    impl CanTransceiver for FakeTransceiver {
        fn enable(&mut self, _baud: u32) -> Result<(), ()> {
            self.enabled = true;
            Ok(())
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn set_filter(&mut self, _mailbox: u8, _pattern: u32, _mask: u32, _extended: bool) {}
        fn clear_filter(&mut self, _mailbox: u8) {}
        fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), ()> {
            self.sent.push(frame.clone()).ok();
            Ok(())
        }
    }

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, false, &[1, 2, 3]).unwrap()
    }

    #[test]
    fn mailbox_exhaustion_is_exceeded_limit_at_seven() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        for id in 0..MAILBOX_COUNT {
            assert!(port
                .set_filter(id, 0x7E8, 0x7FF, false, MailboxRole::PassFilter)
                .is_ok());
        }
        assert_eq!(
            port.set_filter(MAILBOX_COUNT, 0, 0, false, MailboxRole::PassFilter),
            Err(MailboxError::OutOfRange)
        );
    }

    #[test]
    fn ring_drops_newest_frame_when_full() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        port.set_filter(0, 0, 0, false, MailboxRole::PassFilter)
            .unwrap();
        for i in 0..(RING_CAPACITY as u32 + 3) {
            port.on_mailbox_interrupt(0, frame(i));
        }
        let mut got = heapless::Vec::<u32, 16>::new();
        while let Some(f) = port.try_recv(0) {
            got.push(f.id()).ok();
        }
        assert_eq!(got.len(), RING_CAPACITY);
        assert_eq!(got[0], 0);
        assert_eq!(got[RING_CAPACITY - 1], RING_CAPACITY as u32 - 1);
    }

    #[test]
    fn removing_filter_restores_block_all_and_clears_ring() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        port.set_filter(2, 0x7E8, 0x7FF, false, MailboxRole::PassFilter)
            .unwrap();
        port.on_mailbox_interrupt(2, frame(0x7E8));
        port.clear_filter(2).unwrap();
        assert!(!port.is_in_use(2));
        assert_eq!(port.try_recv(2), None);
        assert_eq!(port.clear_filter(2), Err(MailboxError::NotInUse));
    }
}
