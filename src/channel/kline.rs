//! K-Line (ISO9141) channel (spec.md §4.6): wakeup and framed I/O only. The
//! reference leaves the RX path and five-baud init unfinished; per spec.md
//! §9 Open Question 6 this channel answers those with `ERR_NOT_SUPPORTED`
//! rather than guessing at a design the source never committed to.

use heapless::Vec;

use crate::host_link::{err, msg_type, HostLink};
use crate::hw::{KLineUart, SerialTransport};

/// J2534 SCONFIG parameter ids for the ISO9141/ISO14230 timing set.
pub const P1_MIN: u32 = 6;
pub const P1_MAX: u32 = 7;
pub const P2_MIN: u32 = 8;
pub const P2_MAX: u32 = 9;
pub const P3_MIN: u32 = 10;
pub const P3_MAX: u32 = 11;
pub const P4_MIN: u32 = 12;
pub const P4_MAX: u32 = 13;
pub const W1: u32 = 14;
pub const W2: u32 = 15;
pub const W3: u32 = 16;
pub const W4: u32 = 17;
pub const W5: u32 = 18;
pub const TIDLE: u32 = 19;
pub const TINL: u32 = 20;
pub const TWUP: u32 = 21;
pub const PARITY: u32 = 22;

const MAX_RESPONSE: usize = 64;

struct Timing {
    p1_min: u32,
    p1_max: u32,
    p2_min: u32,
    p2_max: u32,
    p3_min: u32,
    p3_max: u32,
    p4_min: u32,
    p4_max: u32,
    w1: u32,
    w2: u32,
    w3: u32,
    w4: u32,
    w5: u32,
    tidle: u32,
    tinl: u32,
    twup: u32,
    parity: u32,
}

impl Timing {
    /// Defaults lifted from the reference's `Iso9141Channel::setup`.
    const fn new() -> Self {
        Self {
            p1_min: 0,
            p1_max: 20,
            p2_min: 25,
            p2_max: 50,
            p3_min: 55,
            p3_max: 5000,
            p4_min: 5,
            p4_max: 20,
            w1: 300,
            w2: 20,
            w3: 20,
            w4: 50,
            w5: 300,
            tidle: 300,
            tinl: 25,
            twup: 50,
            parity: 0,
        }
    }
}

pub struct KLineChannel {
    channel_id: u8,
    baud: u32,
    timing: Timing,
}

impl KLineChannel {
    pub fn new(channel_id: u8, baud: u32) -> Self {
        Self {
            channel_id,
            baud,
            timing: Timing::new(),
        }
    }

    /// The reference always answers filter ops `OK` without touching any
    /// state: K-Line has no mailbox/filter concept of its own.
    pub fn add_filter(&mut self) -> Result<(), (u8, &'static str)> {
        Ok(())
    }

    pub fn remove_filter(&mut self) -> Result<(), (u8, &'static str)> {
        Ok(())
    }

    /// The reference never actually drives a Tx on this channel, it just
    /// acknowledges (`comm_channel_iso9141.cpp::sendMsg`).
    pub fn send<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        _data: &[u8],
        require_response: bool,
    ) {
        if require_response {
            link.respond_ok(transport, msg_type::TX_CHAN_DATA, &[]);
        }
    }

    pub fn ioctl_get<S: SerialTransport>(&mut self, link: &mut HostLink, transport: &mut S, _id: u32) {
        link.respond_err(
            transport,
            msg_type::IOCTL_GET,
            err::FAILED,
            "ISO9141 IOCTL get unimplemented",
        );
    }

    pub fn ioctl_set<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        id: u32,
        value: u32,
    ) {
        match id {
            P1_MIN => self.timing.p1_min = value,
            P1_MAX => self.timing.p1_max = value,
            P2_MIN => self.timing.p2_min = value,
            P2_MAX => self.timing.p2_max = value,
            P3_MIN => self.timing.p3_min = value,
            P3_MAX => self.timing.p3_max = value,
            P4_MIN => self.timing.p4_min = value,
            P4_MAX => self.timing.p4_max = value,
            W1 => self.timing.w1 = value,
            W2 => self.timing.w2 = value,
            W3 => self.timing.w3 = value,
            W4 => self.timing.w4 = value,
            W5 => self.timing.w5 = value,
            TIDLE => self.timing.tidle = value,
            TINL => self.timing.tinl = value,
            TWUP => self.timing.twup = value,
            PARITY => self.timing.parity = value,
            _ => {
                link.respond_err(
                    transport,
                    msg_type::IOCTL_SET,
                    err::FAILED,
                    "ISO9141 IOCTL set unimplemented",
                );
                return;
            }
        }
        link.respond_ok(transport, msg_type::IOCTL_SET, &[]);
    }

    /// Nothing to poll: the reference's `Iso9141Channel::update()` is empty.
    pub fn update<S: SerialTransport>(&mut self, _link: &mut HostLink, _transport: &mut S) {}

    /// `request[0]` selects wakeup type: `0` is five-baud init, anything
    /// else is fast init (matching the reference's `wakeup(type, ...)`).
    pub fn fast_init<K: KLineUart, S: SerialTransport>(
        &mut self,
        kline_uart: &mut K,
        link: &mut HostLink,
        transport: &mut S,
        request: &[u8],
    ) {
        if request.is_empty() {
            link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "empty wakeup request");
            return;
        }
        let (wakeup_type, payload) = (request[0], &request[1..]);
        if wakeup_type == 0 {
            link.respond_err(
                transport,
                msg_type::INIT_LIN_CHANNEL,
                err::NOT_SUPPORTED,
                "Five baud init not supported",
            );
            return;
        }
        if payload.is_empty() {
            link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "empty fast-init request");
            return;
        }

        kline_uart.go_offline();
        kline_uart.set_line_level(true);
        kline_uart.delay_ms(self.timing.tidle);
        kline_uart.set_line_level(false);
        kline_uart.delay_ms(self.timing.tinl);
        kline_uart.set_line_level(true);
        kline_uart.delay_ms(self.timing.twup);
        kline_uart.set_baud(self.baud);
        kline_uart.bring_online();

        let mut framed = match Vec::<u8, 32>::from_slice(payload) {
            Ok(v) => v,
            Err(()) => {
                link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "request too long");
                return;
            }
        };
        let checksum = framed.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if framed.push(checksum).is_err() {
            link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "request too long");
            return;
        }
        kline_uart.write(&framed);

        let header_timeout = self.timing.p1_max + self.timing.p3_min;
        let header = match kline_uart.read_byte(header_timeout) {
            Ok(b) => b,
            Err(_) => {
                link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::TIMEOUT, "Err TIMEOUT");
                return;
            }
        };

        let length = (header & 0x3F) as usize + 2;
        let mut response = Vec::<u8, MAX_RESPONSE>::new();
        if response.push(header).is_err() {
            link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "response too long");
            return;
        }
        for _ in 0..length {
            match kline_uart.read_byte(self.timing.p1_max) {
                Ok(b) => {
                    if response.push(b).is_err() {
                        link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::FAILED, "response too long");
                        return;
                    }
                }
                Err(_) => {
                    link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::TIMEOUT, "Err TIMEOUT");
                    return;
                }
            }
        }
        link.respond_ok(transport, msg_type::INIT_LIN_CHANNEL, &response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HVec;

    #[derive(Default)]
    struct FakeUart {
        online: bool,
        baud: u32,
        written: HVec<u8, 64>,
        rx: HVec<u8, 64>,
        rx_pos: usize,
        line_history: HVec<bool, 16>,
    }

    impl KLineUart for FakeUart {
        fn set_baud(&mut self, baud: u32) {
            self.baud = baud;
        }
        fn bring_online(&mut self) {
            self.online = true;
        }
        fn go_offline(&mut self) {
            self.online = false;
        }
        fn set_line_level(&mut self, high: bool) {
            self.line_history.push(high).ok();
        }
        fn write(&mut self, data: &[u8]) {
            self.written.extend_from_slice(data).unwrap();
        }
        fn read_byte(&mut self, _timeout_ms: u32) -> Result<u8, crate::hw::Timeout> {
            if self.rx_pos < self.rx.len() {
                let b = self.rx[self.rx_pos];
                self.rx_pos += 1;
                Ok(b)
            } else {
                Err(crate::hw::Timeout)
            }
        }
        fn delay_ms(&mut self, _ms: u32) {}
    }

    #[derive(Default)]
    struct RecordingTransport {
        out: HVec<u8, 128>,
    }

    impl SerialTransport for RecordingTransport {
        fn read(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
        fn write_all(&mut self, buf: &[u8]) {
            self.out.extend_from_slice(buf).unwrap();
        }
    }

    #[test]
    fn five_baud_init_is_not_supported() {
        let mut chan = KLineChannel::new(1, 10400);
        let mut uart = FakeUart::default();
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        chan.fast_init(&mut uart, &mut link, &mut transport, &[0, 0x68, 0x6A, 0xF1]);
        assert!(!uart.online);

        assert_eq!(transport.out[3], msg_type::INIT_LIN_CHANNEL);
        assert_eq!(transport.out[4], err::NOT_SUPPORTED);
    }

    #[test]
    fn fast_init_writes_checksum_and_parses_response() {
        let mut chan = KLineChannel::new(1, 10400);
        let mut uart = FakeUart::default();
        uart.rx.extend_from_slice(&[0x02, 0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();

        chan.fast_init(&mut uart, &mut link, &mut transport, &[1, 0x68, 0x6A, 0xF1]);

        assert!(uart.online);
        assert_eq!(uart.baud, 10400);
        assert_eq!(uart.written.as_slice(), &[0x68, 0x6A, 0xF1, 0x68u8.wrapping_add(0x6A).wrapping_add(0xF1)]);

        assert_eq!(transport.out[3], msg_type::INIT_LIN_CHANNEL);
        assert_eq!(transport.out[4], err::NOERROR);
        let body = &transport.out[5..];
        assert_eq!(body, &[0x02, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn fast_init_times_out_waiting_for_header() {
        let mut chan = KLineChannel::new(1, 10400);
        let mut uart = FakeUart::default();
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        chan.fast_init(&mut uart, &mut link, &mut transport, &[1, 0x68]);
        assert_eq!(transport.out[3], msg_type::INIT_LIN_CHANNEL);
        assert_eq!(transport.out[4], err::TIMEOUT);
    }

    #[test]
    fn ioctl_set_updates_timing_and_responds_ok() {
        let mut chan = KLineChannel::new(1, 10400);
        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        chan.ioctl_set(&mut link, &mut transport, TIDLE, 123);
        assert_eq!(chan.timing.tidle, 123);
        assert_eq!(transport.out[3], msg_type::IOCTL_SET);
        assert_eq!(transport.out[4], err::NOERROR);
    }
}
