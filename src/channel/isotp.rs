//! ISO-TP (ISO-15765) segmentation/reassembly state machine (spec.md §4.5).
//!
//! This is the hard core of the adapter: a full-duplex state machine driven
//! by the PCI nibble of each frame delivered through a flow-control-bound
//! mailbox, paced against a monotonic millisecond clock rather than by
//! busy-waiting (spec.md §5).

use heapless::Vec;

use crate::can_frame::CanFrame;
use crate::can_port::{CanPort, MailboxError, MailboxRole, MAILBOX_COUNT};
use crate::clock::Clock;
use crate::host_link::{err, msg_type, rx_status, HostLink};
use crate::hw::{CanTransceiver, SerialTransport};

use super::{FILTER_FLOW_CONTROL, FLAG_ISO15765_ADDR_TYPE};

/// 4096 ISO-TP payload bytes plus the 4-byte CAN id prefix (spec.md §6
/// Hardware budget).
const BUFFER_CAPACITY: usize = 4096 + 4;

/// J2534 SCONFIG parameter ids honored by this channel.
pub const IOCTL_ISO15765_BS: u32 = 31;
pub const IOCTL_ISO15765_STMIN: u32 = 32;

/// Sent by the peer after a multi-frame request to grant further CFs.
const FC_CLEAR_TO_SEND: u8 = 0x30;
/// Block-size value meaning "send every remaining CF without another FC".
const BLOCK_SIZE_UNLIMITED: u16 = 0xFFFF;
/// Hard-coded RX block gate carried over from the reference: after this many
/// CFs without re-arming, emit another FC regardless of the peer's wishes.
const RX_BLOCK_GATE: u16 = 8;

struct IsoTpBuffer {
    data: [u8; BUFFER_CAPACITY],
    size: usize,
    pos: usize,
}

impl IsoTpBuffer {
    const fn new() -> Self {
        Self {
            data: [0; BUFFER_CAPACITY],
            size: 0,
            pos: 0,
        }
    }

    fn reset(&mut self) {
        self.size = 0;
        self.pos = 0;
    }
}

struct IsoTpState {
    rx_active: bool,
    tx_active: bool,
    clear_to_send: bool,
    /// Advertised in our FC frames; settable via `ISO15765_BS`/`ISO15765_STMIN`.
    block_size_rx: u8,
    st_min_rx: u8,
    /// Learned from the peer's FC; honored on our CF pacing.
    block_size_tx: u16,
    st_min_tx: u8,
    rx_frame_count: u16,
    tx_frames_sent: u16,
    tx_pci: u8,
    next_send_time: u32,
}

impl IsoTpState {
    const fn new() -> Self {
        Self {
            rx_active: false,
            tx_active: false,
            clear_to_send: false,
            block_size_rx: 8,
            st_min_rx: 0,
            block_size_tx: 0,
            st_min_tx: 0,
            rx_frame_count: 0,
            tx_frames_sent: 0,
            tx_pci: 0x20,
            next_send_time: 0,
        }
    }
}

pub struct IsoTpChannel {
    channel_id: u8,
    extended_can_id: bool,
    extended_addressing: bool,
    rx: IsoTpBuffer,
    tx: IsoTpBuffer,
    state: IsoTpState,
}

impl IsoTpChannel {
    pub fn new(channel_id: u8, extended_can_id: bool, extended_addressing: bool) -> Self {
        Self {
            channel_id,
            extended_can_id,
            extended_addressing,
            rx: IsoTpBuffer::new(),
            tx: IsoTpBuffer::new(),
            state: IsoTpState::new(),
        }
    }

    pub fn add_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
        filter_type: u32,
        mask: &[u8],
        pattern: &[u8],
        flowcontrol: &[u8],
    ) -> Result<(), (u8, &'static str)> {
        if filter_type != FILTER_FLOW_CONTROL {
            return Err((err::FAILED, "ISO15765 filter not valid type"));
        }
        if mask.len() != 4 {
            return Err((err::FAILED, "mask length not 4"));
        }
        if pattern.len() != 4 {
            return Err((err::FAILED, "pattern length not 4"));
        }
        if flowcontrol.len() != 4 {
            return Err((err::FAILED, "flowcontrol length not 4"));
        }
        let mask_u32 = u32::from_be_bytes([mask[0], mask[1], mask[2], mask[3]]);
        let pattern_u32 = u32::from_be_bytes([pattern[0], pattern[1], pattern[2], pattern[3]]);
        let flowcontrol_id =
            u32::from_be_bytes([flowcontrol[0], flowcontrol[1], flowcontrol[2], flowcontrol[3]]);
        port.set_filter(
            filter_id,
            pattern_u32,
            mask_u32,
            self.extended_can_id,
            MailboxRole::FlowControl { flowcontrol_id },
        )
        .map_err(mailbox_err_to_response)
    }

    /// Releases the filter and, per spec.md §3's Lifecycle invariant, any
    /// reception in progress on this channel.
    pub fn remove_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
    ) -> Result<(), (u8, &'static str)> {
        port.clear_filter(filter_id).map_err(mailbox_err_to_response)?;
        self.rx.reset();
        self.state.rx_active = false;
        self.state.clear_to_send = false;
        Ok(())
    }

    /// `data` is `[CANID(4, BE), payload...]`.
    pub fn send<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        tx_flags: u32,
        data: &[u8],
        require_response: bool,
    ) {
        if tx_flags & FLAG_ISO15765_ADDR_TYPE != 0 {
            if require_response {
                link.respond_err(
                    transport,
                    msg_type::TX_CHAN_DATA,
                    err::FAILED,
                    "Extended ISO-TP Tx not implemented",
                );
            }
            return;
        }
        if data.len() < 4 {
            if require_response {
                link.respond_err(
                    transport,
                    msg_type::TX_CHAN_DATA,
                    err::FAILED,
                    "TX payload shorter than the 4-byte CAN id",
                );
            }
            return;
        }
        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let iso_payload = &data[4..];

        if data.len() <= 11 {
            let mut bytes = Vec::<u8, 8>::new();
            let _ = bytes.push(iso_payload.len() as u8);
            let _ = bytes.extend_from_slice(iso_payload);
            while bytes.len() < 8 {
                let _ = bytes.push(0);
            }
            let frame = match CanFrame::new(id, self.extended_can_id, &bytes) {
                Some(f) => f,
                None => return,
            };
            match port.send(&frame) {
                Ok(()) => {
                    if require_response {
                        link.respond_ok(transport, msg_type::TX_CHAN_DATA, &[]);
                    }
                }
                Err(_) => {
                    if require_response {
                        link.respond_err(transport, msg_type::TX_CHAN_DATA, err::FAILED, "CAN Tx failed");
                    } else {
                        defmt::warn!("Error sending ISO-TP frame. Canbus Tx failed");
                    }
                }
            }
            return;
        }

        if self.state.tx_active {
            if require_response {
                link.respond_err(transport, msg_type::TX_CHAN_DATA, err::BUFFER_FULL, "");
            } else {
                defmt::warn!(
                    "ISO15765 already sending ({}/{} bytes)",
                    self.tx.pos,
                    self.tx.size
                );
            }
            return;
        }

        let iso_len = iso_payload.len();
        let mut ff = Vec::<u8, 8>::new();
        let _ = ff.push(0x10 | (((iso_len as u16) >> 8) & 0x0F) as u8);
        let _ = ff.push((iso_len & 0xFF) as u8);
        let _ = ff.extend_from_slice(&iso_payload[..6.min(iso_payload.len())]);

        self.tx.data[..data.len()].copy_from_slice(data);
        self.tx.size = data.len();
        self.tx.pos = 10;
        self.state.tx_active = true;
        self.state.clear_to_send = false;
        self.state.tx_pci = 0x21;

        if let Some(frame) = CanFrame::new(id, self.extended_can_id, &ff) {
            if port.send(&frame).is_err() {
                defmt::warn!("CAN TX FAILED!");
            }
        }
    }

    /// Drains every flow-control mailbox and ticks CF emission. `send_frame`
    /// is the caller's hook into `CanPort::send` (kept out of this function
    /// so the borrow of `port` for draining and for transmitting never
    /// overlap awkwardly with the generic `D`).
    pub fn update<D: CanTransceiver, S: SerialTransport, C: Clock>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        clock: &C,
    ) {
        for mailbox in 0..MAILBOX_COUNT {
            let flowcontrol_id = match port.role(mailbox) {
                Some(MailboxRole::FlowControl { flowcontrol_id }) => flowcontrol_id,
                _ => continue,
            };
            while let Some(frame) = port.try_recv(mailbox) {
                self.handle_rx_frame(port, link, transport, &frame, flowcontrol_id, clock);
            }
        }

        if self.state.tx_active && self.state.clear_to_send && clock.now_ms() >= self.state.next_send_time {
            self.emit_cf(port, link, transport, clock);
        }
    }

    fn handle_rx_frame<D: CanTransceiver, S: SerialTransport, C: Clock>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        frame: &CanFrame,
        flowcontrol_id: u32,
        clock: &C,
    ) {
        let cmp = if self.extended_addressing { 1 } else { 0 };
        let data = frame.data();
        if data.len() <= cmp {
            defmt::warn!("ISO15765: frame on {:x} too short for addressing mode", frame.id());
            return;
        }
        match data[cmp] & 0xF0 {
            0x00 => self.rx_single_frame(link, transport, frame, cmp),
            0x10 => self.rx_first_frame(port, link, transport, frame, flowcontrol_id),
            0x20 => self.rx_consecutive_frame(port, link, transport, frame, flowcontrol_id),
            0x30 => self.handle_flow_control(frame, clock),
            other => {
                defmt::warn!(
                    "CAN ID {:x} invalid ISO-TP PCI: {:x}. Discarding frame",
                    frame.id(),
                    other
                );
            }
        }
    }

    fn rx_single_frame<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        frame: &CanFrame,
        cmp: usize,
    ) {
        let data = frame.data();
        let len = (data[cmp] & 0x0F) as usize;
        let payload_start = cmp + 1;
        if data.len() < payload_start + len {
            defmt::warn!("ISO15765: single frame claims more data than present");
            return;
        }
        let mut out = Vec::<u8, 11>::new();
        let _ = out.extend_from_slice(&frame.id().to_be_bytes());
        let _ = out.extend_from_slice(&data[payload_start..payload_start + len]);
        link.send_rx_data(transport, self.channel_id, rx_status::NORMAL, &out);
    }

    fn rx_first_frame<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        frame: &CanFrame,
        flowcontrol_id: u32,
    ) {
        if self.state.rx_active {
            defmt::warn!("Already trying to receive another ISO-15765 payload!?");
            return;
        }
        let data = frame.data();
        if data.len() < 8 {
            defmt::warn!("ISO15765: first frame shorter than 8 bytes");
            return;
        }
        let length = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        let size = length + 4;
        if size > BUFFER_CAPACITY {
            defmt::error!("ISO15765: first frame announces {} bytes, exceeds buffer", size);
            return;
        }
        self.rx.data[0..4].copy_from_slice(&frame.id().to_be_bytes());
        self.rx.data[4..10].copy_from_slice(&data[2..8]);
        self.rx.size = size;
        self.rx.pos = 10;
        self.state.rx_active = true;
        self.state.rx_frame_count = 0;

        let fc = CanFrame::new(
            flowcontrol_id,
            self.extended_can_id,
            &[
                FC_CLEAR_TO_SEND,
                self.state.block_size_rx,
                self.state.st_min_rx,
                0,
                0,
                0,
                0,
                0,
            ],
        );
        if let Some(fc) = fc {
            if port.send(&fc).is_err() {
                defmt::warn!("ISO15765: CAN TX of first-frame FC failed");
            }
        }

        link.send_rx_data(
            transport,
            self.channel_id,
            rx_status::FIRST_FRAME,
            &frame.id().to_be_bytes(),
        );
    }

    fn rx_consecutive_frame<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        frame: &CanFrame,
        flowcontrol_id: u32,
    ) {
        if !self.state.rx_active {
            defmt::warn!("Multi frame message received but not start frame!?");
            return;
        }
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        let payload = &data[1..];
        let remaining = self.rx.size - self.rx.pos;
        let n = remaining.min(payload.len()).min(7);
        self.rx.data[self.rx.pos..self.rx.pos + n].copy_from_slice(&payload[..n]);
        self.rx.pos += n;
        self.state.rx_frame_count += 1;

        if self.rx.pos >= self.rx.size {
            link.send_rx_data(
                transport,
                self.channel_id,
                rx_status::NORMAL,
                &self.rx.data[..self.rx.size],
            );
            self.state.rx_active = false;
            return;
        }

        if self.state.rx_frame_count >= RX_BLOCK_GATE {
            self.state.rx_frame_count = 0;
            let fc = CanFrame::new(
                flowcontrol_id,
                self.extended_can_id,
                &[
                    FC_CLEAR_TO_SEND,
                    self.state.block_size_rx,
                    self.state.st_min_rx,
                    0,
                    0,
                    0,
                    0,
                    0,
                ],
            );
            if let Some(fc) = fc {
                if port.send(&fc).is_err() {
                    defmt::warn!("CAN TX FAILED!");
                }
            }
        }
    }

    /// FC from the peer, received while we are transmitting. Only 0x30
    /// (clear to send) is understood; wait/overflow are logged and ignored
    /// (spec.md §9 Open Question 5 — not implemented by the reference).
    fn handle_flow_control<C: Clock>(&mut self, frame: &CanFrame, clock: &C) {
        let data = frame.data();
        if data.is_empty() || data[0] != FC_CLEAR_TO_SEND {
            defmt::warn!("Flow Control is NOT 0x30!");
            return;
        }
        let block_size = if data.len() > 1 && data[1] != 0 {
            data[1] as u16
        } else {
            BLOCK_SIZE_UNLIMITED
        };
        let st_min_tx = if data.len() > 2 { data[2] } else { 0 };
        self.state.block_size_tx = block_size;
        self.state.st_min_tx = st_min_tx;
        self.state.clear_to_send = true;
        self.state.tx_frames_sent = 0;
        // Preserves the reference's bug: the first post-FC gap is paced by
        // our own advertised st_min, not the peer's (spec.md §9 Open
        // Question 1).
        self.state.next_send_time = clock.now_ms().wrapping_add(self.state.st_min_rx as u32);
    }

    fn emit_cf<D: CanTransceiver, S: SerialTransport, C: Clock>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        clock: &C,
    ) {
        let id = u32::from_be_bytes([self.tx.data[0], self.tx.data[1], self.tx.data[2], self.tx.data[3]]);
        let remaining = self.tx.size - self.tx.pos;
        let n = remaining.min(7);
        let mut bytes = Vec::<u8, 8>::new();
        let _ = bytes.push(self.state.tx_pci);
        let _ = bytes.extend_from_slice(&self.tx.data[self.tx.pos..self.tx.pos + n]);
        while bytes.len() < 8 {
            let _ = bytes.push(0);
        }
        let frame = CanFrame::new(id, self.extended_can_id, &bytes);
        self.tx.pos += n;
        self.state.tx_pci += 1;
        if self.state.tx_pci == 0x30 {
            self.state.tx_pci = 0x20;
        }
        self.state.tx_frames_sent += 1;

        if let Some(frame) = frame {
            if port.send(&frame).is_err() {
                defmt::warn!("ISO15765: CF transmit failed");
            }
        }

        if self.tx.pos >= self.tx.size {
            self.state.clear_to_send = false;
            self.state.tx_active = false;
            link.send_rx_data(transport, self.channel_id, rx_status::TX_MSG_TYPE, &[]);
            return;
        }

        self.state.next_send_time = clock.now_ms().wrapping_add(self.state.st_min_tx as u32);
        if self.state.tx_frames_sent >= self.state.block_size_tx {
            self.state.clear_to_send = false;
        }
    }

    pub fn ioctl_get<S: SerialTransport>(&mut self, link: &mut HostLink, transport: &mut S, id: u32) {
        match id {
            IOCTL_ISO15765_STMIN => {
                let value = self.state.st_min_rx as u32;
                link.respond_ok(transport, msg_type::IOCTL_GET, &value.to_le_bytes());
            }
            IOCTL_ISO15765_BS => {
                let value = self.state.block_size_rx as u32;
                link.respond_ok(transport, msg_type::IOCTL_GET, &value.to_le_bytes());
            }
            _ => {
                link.respond_err(
                    transport,
                    msg_type::IOCTL_GET,
                    err::INVALID_IOCTL_ID,
                    "ISO15765 invalid IOCTL ID",
                );
            }
        }
    }

    pub fn ioctl_set<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        id: u32,
        value: u32,
    ) {
        match id {
            IOCTL_ISO15765_STMIN => {
                self.state.st_min_rx = value as u8;
                link.respond_ok(transport, msg_type::IOCTL_SET, &[]);
            }
            IOCTL_ISO15765_BS => {
                self.state.block_size_rx = value as u8;
                link.respond_ok(transport, msg_type::IOCTL_SET, &[]);
            }
            _ => {
                link.respond_err(
                    transport,
                    msg_type::IOCTL_SET,
                    err::INVALID_IOCTL_ID,
                    "ISO15765 invalid IOCTL ID",
                );
            }
        }
    }
}

fn mailbox_err_to_response(e: MailboxError) -> (u8, &'static str) {
    match e {
        MailboxError::OutOfRange => (err::EXCEEDED_LIMIT, "filter id exceeds the mailbox budget"),
        MailboxError::AlreadyInUse => (err::FAILED, "filter ID already in use"),
        MailboxError::NotInUse => (err::INVALID_FILTER_ID, "filter does not exist"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[derive(Default)]
    struct FakeTransceiver {
        sent: Vec<CanFrame, 16>,
    }

    impl CanTransceiver for FakeTransceiver {
        fn enable(&mut self, _baud: u32) -> Result<(), ()> {
            Ok(())
        }
        fn disable(&mut self) {}
        fn set_filter(&mut self, _mailbox: u8, _pattern: u32, _mask: u32, _extended: bool) {}
        fn clear_filter(&mut self, _mailbox: u8) {}
        fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), ()> {
            self.sent.push(frame.clone()).ok();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        out: Vec<u8, 256>,
    }

    impl SerialTransport for RecordingTransport {
        fn read(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
        fn write_all(&mut self, buf: &[u8]) {
            self.out.extend_from_slice(buf).unwrap();
        }
    }

    fn port_with_fc(flowcontrol_id: u32, pattern: u32) -> CanPort<FakeTransceiver> {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        port.set_filter(0, pattern, 0xFFFF_FFFF, false, MailboxRole::FlowControl { flowcontrol_id })
            .unwrap();
        port
    }

    #[test]
    fn single_frame_rx_scenario() {
        let mut chan = IsoTpChannel::new(0, false, false);
        let mut port = port_with_fc(0x7E0, 0x7E8);
        port.inject(0, CanFrame::new(0x7E8, false, &[0x03, 0x41, 0x0D, 0, 0, 0, 0, 0]).unwrap());

        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        let clock = FakeClock::new(0);
        chan.update(&mut port, &mut link, &mut transport, &clock);

        let args = [0x00, 0x00, 0x07, 0xE8, 0x41, 0x0D, 0x00];
        let len = (2 + 1 + 4 + args.len()) as u16;
        let mut expected = Vec::<u8, 64>::new();
        expected.extend_from_slice(&len.to_le_bytes()).unwrap();
        expected.push(0).unwrap();
        expected.push(msg_type::RX_CHAN_DATA).unwrap();
        expected.push(0).unwrap();
        expected.extend_from_slice(&rx_status::NORMAL.to_le_bytes()).unwrap();
        expected.extend_from_slice(&args).unwrap();
        assert_eq!(transport.out.as_slice(), expected.as_slice());
    }

    #[test]
    fn multi_frame_rx_scenario_assembles_full_payload() {
        let mut chan = IsoTpChannel::new(0, false, false);
        let mut port = port_with_fc(0x7E0, 0x7E8);
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        let clock = FakeClock::new(0);

        port.inject(0, CanFrame::new(0x7E8, false, &[0x10, 0x0A, 0x49, 0x02, 0x01, 0x31, 0x32, 0x33]).unwrap());
        chan.update(&mut port, &mut link, &mut transport, &clock);

        assert!(chan.state.rx_active);
        assert_eq!(chan.rx.size, 14);
        assert_eq!(chan.rx.pos, 10);
        assert_eq!(chan.rx.data[0..10], [0, 0, 0x07, 0xE8, 0x49, 0x02, 0x01, 0x31, 0x32, 0x33]);

        assert_eq!(port.transceiver().sent.len(), 1);
        assert_eq!(port.transceiver().sent[0].id(), 0x7E0);
        assert_eq!(port.transceiver().sent[0].data(), &[0x30, 8, 0, 0, 0, 0, 0, 0]);

        transport.out.clear();
        port.inject(0, CanFrame::new(0x7E8, false, &[0x21, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x00]).unwrap());
        chan.update(&mut port, &mut link, &mut transport, &clock);

        assert!(!chan.state.rx_active);
        let args: [u8; 14] = [
            0, 0, 0x07, 0xE8, 0x49, 0x02, 0x01, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37,
        ];
        let len = (2 + 1 + 4 + args.len()) as u16;
        let mut expected = Vec::<u8, 64>::new();
        expected.extend_from_slice(&len.to_le_bytes()).unwrap();
        expected.push(0).unwrap();
        expected.push(msg_type::RX_CHAN_DATA).unwrap();
        expected.push(0).unwrap();
        expected.extend_from_slice(&rx_status::NORMAL.to_le_bytes()).unwrap();
        expected.extend_from_slice(&args).unwrap();
        assert_eq!(transport.out.as_slice(), expected.as_slice());
    }

    #[test]
    fn multi_frame_tx_scenario_paces_cf_after_fc() {
        let mut chan = IsoTpChannel::new(0, false, false);
        let mut port = port_with_fc(0x7E8, 0x7E8);
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        let clock = FakeClock::new(0);

        let tx_data = [
            0x00, 0x00, 0x07, 0xE0, 0x22, 0xF1, 0x90, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        chan.send(&mut port, &mut link, &mut transport, 0, &tx_data, false);
        assert!(chan.state.tx_active);
        assert_eq!(port.transceiver().sent[0].id(), 0x7E0);
        assert_eq!(
            port.transceiver().sent[0].data(),
            &[0x10, 0x0B, 0x22, 0xF1, 0x90, 0x01, 0x02, 0x03]
        );

        port.inject(0, CanFrame::new(0x7E8, false, &[0x30, 0x00, 20, 0, 0, 0, 0, 0]).unwrap());
        chan.update(&mut port, &mut link, &mut transport, &clock);
        assert!(chan.state.clear_to_send);

        clock.advance(25);
        chan.update(&mut port, &mut link, &mut transport, &clock);
        let sent = &port.transceiver().sent;
        let last = sent.last().unwrap();
        assert_eq!(last.id(), 0x7E0);
        assert_eq!(last.data(), &[0x21, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00]);
    }
}
