//! The engine (spec.md §9 "process-wide mutable globals" redesign): owns
//! every piece of state the reference keeps as file-scope globals
//! (`canChannel`, `klineChannel`, `last_id`, the mailbox rings) as one value
//! the dispatch loop borrows, and implements the host opcode dispatch table
//! (spec.md §4.3, wire payload layouts per §6 and `channel.cpp`'s
//! `setup_channel`/`add_channel_filter`/`send_data`/`ioctl_get`/`ioctl_set`/
//! `init_lin_channel`).

use byteorder::{ByteOrder, LittleEndian};

use crate::channel::ChannelRegistry;
use crate::clock::Clock;
use crate::host_link::{err, msg_type, HostLink, HostMessage};
use crate::hw::{BatteryReader, CanTransceiver, KLineUart, SerialTransport, StatusIndicator};

/// Compiled into the firmware; reported verbatim to `GET_FW_VERSION`.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `STATUS` args[0] values (spec.md §4.3).
mod status {
    pub const GOODBYE: u8 = 0x00;
    pub const HELLO: u8 = 0x01;
}

pub struct Engine<D: CanTransceiver, K: KLineUart, B: BatteryReader, I: StatusIndicator> {
    link: HostLink,
    registry: ChannelRegistry<D, K>,
    battery: B,
    indicator: I,
}

impl<D: CanTransceiver, K: KLineUart, B: BatteryReader, I: StatusIndicator> Engine<D, K, B, I> {
    pub fn new(transceiver: D, kline_uart: K, battery: B, indicator: I) -> Self {
        Self {
            link: HostLink::new(),
            registry: ChannelRegistry::new(transceiver, kline_uart),
            battery,
            indicator,
        }
    }

    /// One tick of the dispatch loop (spec.md §4.7): drain the host link,
    /// dispatch at most one completed message, then poll every channel.
    pub fn poll<S: SerialTransport, C: Clock>(&mut self, transport: &mut S, clock: &C) {
        if let Some(msg) = self.link.poll(transport) {
            self.indicator.set_rx(true);
            self.dispatch(transport, msg);
            self.indicator.set_rx(false);
        }
        self.registry.update(&mut self.link, transport, clock);
    }

    /// Feeds a frame the CAN hardware interrupt handler pulled off the wire
    /// into the matching mailbox ring (spec.md §2 CanPort). Called from
    /// interrupt context; the actual channel logic only ever runs from
    /// `poll`, on the main dispatch loop.
    pub fn on_can_frame(&mut self, mailbox: usize, frame: crate::can_frame::CanFrame) {
        self.registry.can_port.on_mailbox_interrupt(mailbox, frame);
    }

    /// Hands the CAN RX interrupt handler direct access to the hardware
    /// transceiver so it can drain the peripheral's RX FIFO without going
    /// through the channel dispatch logic.
    pub fn can_transceiver_mut(&mut self) -> &mut D {
        self.registry.can_port.transceiver_mut()
    }

    /// Releases both channel slots without emitting a response (host
    /// disconnect path, spec.md §3 Lifecycle / §8 scenario 6).
    pub fn reset_all_channels(&mut self) {
        self.registry.reset_all_channels();
        self.indicator.set_can(false);
        self.indicator.set_kline(false);
    }

    fn dispatch<S: SerialTransport>(&mut self, transport: &mut S, msg: HostMessage) {
        let args = msg.args.as_slice();
        match msg.msg_type {
            msg_type::OPEN_CHANNEL => self.handle_open_channel(transport, args),
            msg_type::CLOSE_CHANNEL => self.handle_close_channel(transport, args),
            msg_type::SET_CHAN_FILT => self.handle_add_filter(transport, args),
            msg_type::REM_CHAN_FILT => self.handle_remove_filter(transport, args),
            msg_type::TX_CHAN_DATA => self.handle_send(transport, args, msg.msg_id != 0),
            msg_type::IOCTL_GET => self.handle_ioctl_get(transport, args),
            msg_type::IOCTL_SET => self.handle_ioctl_set(transport, args),
            msg_type::INIT_LIN_CHANNEL => self.handle_init_lin_channel(transport, args),
            msg_type::READ_BATT => self.handle_read_batt(transport),
            msg_type::GET_FW_VERSION => {
                self.link.respond_ok(transport, msg_type::GET_FW_VERSION, FIRMWARE_VERSION.as_bytes());
            }
            msg_type::STATUS => self.handle_status(transport, args),
            _ => {
                self.link.log_message(transport, "Unknown message type received");
            }
        }
    }

    fn handle_open_channel<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() != 16 {
            self.link.respond_err(
                transport,
                msg_type::OPEN_CHANNEL,
                err::FAILED,
                "Payload size for OpenChannel is incorrect",
            );
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        let protocol = le_u32(&args[4..8]);
        let baud = le_u32(&args[8..12]);
        let flags = le_u32(&args[12..16]);
        let opened = self
            .registry
            .open_channel(&mut self.link, transport, channel_id, protocol, baud, flags);
        if opened {
            match channel_id {
                crate::channel::CHANNEL_ID_CAN => self.indicator.set_can(true),
                crate::channel::CHANNEL_ID_KLINE => self.indicator.set_kline(true),
                _ => {}
            }
        }
    }

    fn handle_close_channel<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() != 4 {
            self.link.respond_err(
                transport,
                msg_type::CLOSE_CHANNEL,
                err::FAILED,
                "Payload size for CloseChannel is incorrect",
            );
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        let closed = self.registry.close_channel(&mut self.link, transport, channel_id);
        if closed {
            match channel_id {
                crate::channel::CHANNEL_ID_CAN => self.indicator.set_can(false),
                crate::channel::CHANNEL_ID_KLINE => self.indicator.set_kline(false),
                _ => {}
            }
        }
    }

    fn handle_add_filter<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() < 24 {
            self.link.respond_err(transport, msg_type::SET_CHAN_FILT, err::FAILED, "Message size not valid");
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        let filter_id = le_u32(&args[4..8]);
        let filter_type = le_u32(&args[8..12]);
        let mask_size = le_u32(&args[12..16]) as usize;
        let pattern_size = le_u32(&args[16..20]) as usize;
        let flowcontrol_size = le_u32(&args[20..24]) as usize;

        if filter_type == crate::channel::FILTER_FLOW_CONTROL && flowcontrol_size == 0 {
            self.link.respond_err(
                transport,
                msg_type::SET_CHAN_FILT,
                err::NULL_PARAMETER,
                "ISO15765 FC filter is null",
            );
            return;
        }
        let total = 24 + mask_size + pattern_size + flowcontrol_size;
        if args.len() < total {
            self.link.respond_err(transport, msg_type::SET_CHAN_FILT, err::FAILED, "Message size not valid");
            return;
        }
        let mask = &args[24..24 + mask_size];
        let pattern = &args[24 + mask_size..24 + mask_size + pattern_size];
        let flowcontrol = &args[24 + mask_size + pattern_size..total];

        self.registry.add_filter(
            &mut self.link,
            transport,
            channel_id,
            filter_id,
            filter_type,
            mask,
            pattern,
            flowcontrol,
        );
    }

    fn handle_remove_filter<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() != 8 {
            self.link.respond_err(transport, msg_type::REM_CHAN_FILT, err::FAILED, "Message size not valid");
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        let filter_id = le_u32(&args[4..8]);
        self.registry.remove_filter(&mut self.link, transport, channel_id, filter_id);
    }

    fn handle_send<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8], require_response: bool) {
        if args.len() < 8 {
            if require_response {
                self.link.respond_err(transport, msg_type::TX_CHAN_DATA, err::FAILED, "TX payload too short");
            }
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        let tx_flags = le_u32(&args[4..8]);
        let data = &args[8..];
        self.indicator.set_tx(true);
        self.registry
            .send(&mut self.link, transport, channel_id, tx_flags, data, require_response);
        self.indicator.set_tx(false);
    }

    fn handle_ioctl_get<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() != 5 {
            self.link.respond_err(transport, msg_type::IOCTL_GET, err::FAILED, "IOCTL get request invalid length");
            return;
        }
        let channel_id = args[0] as u32;
        let ioctl_id = le_u32(&args[1..5]);
        self.registry.ioctl_get(&mut self.link, transport, channel_id, ioctl_id);
    }

    fn handle_ioctl_set<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() != 9 {
            self.link.respond_err(transport, msg_type::IOCTL_SET, err::FAILED, "IOCTL set request invalid length");
            return;
        }
        let channel_id = args[0] as u32;
        let ioctl_id = le_u32(&args[1..5]);
        let value = le_u32(&args[5..9]);
        self.registry.ioctl_set(&mut self.link, transport, channel_id, ioctl_id, value);
    }

    fn handle_init_lin_channel<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        if args.len() < 5 {
            self.link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "request too short");
            return;
        }
        let channel_id = le_u32(&args[0..4]);
        if channel_id != crate::channel::CHANNEL_ID_KLINE {
            self.link
                .respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::INVALID_CHANNEL_ID, "");
            return;
        }
        self.registry.wakeup(&mut self.link, transport, &args[4..]);
    }

    fn handle_read_batt<S: SerialTransport>(&mut self, transport: &mut S) {
        let mv = self.battery.read_millivolts();
        self.link.respond_ok(transport, msg_type::READ_BATT, &mv.to_le_bytes());
    }

    fn handle_status<S: SerialTransport>(&mut self, transport: &mut S, args: &[u8]) {
        match args.first().copied() {
            Some(status::GOODBYE) => {
                self.reset_all_channels();
                self.link.reset();
            }
            Some(status::HELLO) => {
                self.link.respond_ok(transport, msg_type::STATUS, &[]);
            }
            _ => {
                self.link.respond_err(transport, msg_type::STATUS, err::FAILED, "Unknown STATUS request");
            }
        }
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_frame::CanFrame;
    use crate::clock::FakeClock;
    use crate::hw::{NoIndicator, Timeout};
    use heapless::Vec;

    #[derive(Default)]
    struct FakeTransceiver;
    impl CanTransceiver for FakeTransceiver {
        fn enable(&mut self, _baud: u32) -> Result<(), ()> {
            Ok(())
        }
        fn disable(&mut self) {}
        fn set_filter(&mut self, _mailbox: u8, _pattern: u32, _mask: u32, _extended: bool) {}
        fn clear_filter(&mut self, _mailbox: u8) {}
        fn transmit(&mut self, _frame: &CanFrame) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeKLineUart;
    impl KLineUart for FakeKLineUart {
        fn set_baud(&mut self, _baud: u32) {}
        fn bring_online(&mut self) {}
        fn go_offline(&mut self) {}
        fn set_line_level(&mut self, _high: bool) {}
        fn write(&mut self, _data: &[u8]) {}
        fn read_byte(&mut self, _timeout_ms: u32) -> Result<u8, Timeout> {
            Err(Timeout)
        }
        fn delay_ms(&mut self, _ms: u32) {}
    }

    #[derive(Default)]
    struct FakeBattery;
    impl BatteryReader for FakeBattery {
        fn read_millivolts(&mut self) -> u16 {
            12_600
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

    fn frame(msg_id: u8, msg_type: u8, args: &[u8]) -> HostMessage {
        let mut v = Vec::new();
        v.extend_from_slice(args).unwrap();
        HostMessage { msg_id, msg_type, args: v }
    }

    fn new_engine() -> Engine<FakeTransceiver, FakeKLineUart, FakeBattery, NoIndicator> {
        Engine::new(FakeTransceiver, FakeKLineUart, FakeBattery, NoIndicator)
    }

    #[test]
    fn open_channel_rejects_wrong_payload_size() {
        let mut engine = new_engine();
        let mut transport = RecordingTransport::default();
        engine.dispatch(&mut transport, frame(1, msg_type::OPEN_CHANNEL, &[0, 0]));
        assert_eq!(transport.out[3], msg_type::OPEN_CHANNEL);
        assert_eq!(transport.out[4], err::FAILED);
    }

    #[test]
    fn open_can_channel_then_mailbox_exhaustion() {
        let mut engine = new_engine();
        let mut transport = RecordingTransport::default();
        let open_args = [0u32.to_le_bytes(), 5u32.to_le_bytes(), 500_000u32.to_le_bytes(), 0u32.to_le_bytes()].concat();
        engine.dispatch(&mut transport, frame(1, msg_type::OPEN_CHANNEL, &open_args));
        assert_eq!(transport.out[4], err::NOERROR);

        for filter_id in 0..8u32 {
            transport.out.clear();
            let mut payload = Vec::<u8, 64>::new();
            payload.extend_from_slice(&0u32.to_le_bytes()).unwrap();
            payload.extend_from_slice(&filter_id.to_le_bytes()).unwrap();
            payload.extend_from_slice(&crate::channel::FILTER_PASS.to_le_bytes()).unwrap();
            payload.extend_from_slice(&4u32.to_le_bytes()).unwrap();
            payload.extend_from_slice(&4u32.to_le_bytes()).unwrap();
            payload.extend_from_slice(&0u32.to_le_bytes()).unwrap();
            payload.extend_from_slice(&0x000007FFu32.to_be_bytes()).unwrap();
            payload.extend_from_slice(&0x000007E8u32.to_be_bytes()).unwrap();
            engine.dispatch(&mut transport, frame(2, msg_type::SET_CHAN_FILT, &payload));
            if filter_id < 7 {
                assert_eq!(transport.out[4], err::NOERROR, "filter {filter_id} should succeed");
            } else {
                assert_eq!(transport.out[4], err::EXCEEDED_LIMIT);
            }
        }
    }

    #[test]
    fn status_goodbye_resets_last_id() {
        let mut engine = new_engine();
        let mut transport = RecordingTransport::default();
        engine.dispatch(&mut transport, frame(9, msg_type::TX_CHAN_DATA, &[]));
        assert_eq!(engine.link.last_id(), 9);
        engine.dispatch(&mut transport, frame(3, msg_type::STATUS, &[0x00]));
        assert_eq!(engine.link.last_id(), 0);
    }

    #[test]
    fn read_batt_reports_fake_millivolts() {
        let mut engine = new_engine();
        let mut transport = RecordingTransport::default();
        engine.dispatch(&mut transport, frame(1, msg_type::READ_BATT, &[]));
        assert_eq!(transport.out[4], err::NOERROR);
        let mv = u16::from_le_bytes([transport.out[5], transport.out[6]]);
        assert_eq!(mv, 12_600);
    }

    #[test]
    fn poll_drains_link_and_updates_channels() {
        let mut engine = new_engine();
        let mut transport = RecordingTransport::default();
        let clock = FakeClock::new(0);
        engine.poll(&mut transport, &clock);
        assert!(transport.out.is_empty());
    }
}
