//! Raw CAN channel (spec.md §4.4): hardware pass-filters, plus a software
//! block-filter overlay carried in `CanPort`'s `MailboxRole` rather than the
//! reference's parallel `masks[]`/`patterns[]`/`blocking_filters[]` arrays.

use heapless::Vec;

use crate::can_frame::CanFrame;
use crate::can_port::{CanPort, MailboxError, MailboxRole, MAILBOX_COUNT};
use crate::host_link::{err, msg_type, rx_status, HostLink};
use crate::hw::{CanTransceiver, SerialTransport};

use super::{FILTER_BLOCK, FILTER_FLOW_CONTROL, FILTER_PASS};

/// J2534 `LOOPBACK` SCONFIG parameter id.
pub const IOCTL_LOOPBACK: u32 = 3;

pub struct RawCanChannel {
    channel_id: u8,
    extended: bool,
    loopback: bool,
}

impl RawCanChannel {
    pub fn new(channel_id: u8, extended: bool) -> Self {
        Self {
            channel_id,
            extended,
            loopback: false,
        }
    }

    pub fn add_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
        filter_type: u32,
        mask: &[u8],
        pattern: &[u8],
    ) -> Result<(), (u8, &'static str)> {
        if filter_type == FILTER_FLOW_CONTROL {
            return Err((err::FAILED, "CAN channel cannot use a flow control filter"));
        }
        if mask.len() > 4 {
            return Err((err::FAILED, "mask length too big"));
        }
        if pattern.len() > 4 {
            return Err((err::FAILED, "pattern length too big"));
        }
        let mask_u32 = be_bytes_to_u32(mask);
        let pattern_u32 = be_bytes_to_u32(pattern);
        let (role, hw_pattern, hw_mask) = if filter_type == FILTER_BLOCK {
            (
                MailboxRole::BlockFilter {
                    pattern: pattern_u32,
                    mask: mask_u32,
                },
                0,
                0,
            )
        } else {
            (MailboxRole::PassFilter, pattern_u32, mask_u32)
        };
        port.set_filter(filter_id, hw_pattern, hw_mask, self.extended, role)
            .map_err(mailbox_err_to_response)
    }

    pub fn remove_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
    ) -> Result<(), (u8, &'static str)> {
        port.clear_filter(filter_id).map_err(mailbox_err_to_response)
    }

    /// `data` is `[CANID(4, BE), payload...]`, already stripped of the
    /// channel id and tx_flags by the dispatcher.
    pub fn send<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        data: &[u8],
        require_response: bool,
    ) {
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
        let payload = &data[4..];
        let frame = match CanFrame::new(id, self.extended, payload) {
            Some(f) => f,
            None => {
                if require_response {
                    link.respond_err(
                        transport,
                        msg_type::TX_CHAN_DATA,
                        err::FAILED,
                        "CAN data exceeds 8 bytes",
                    );
                }
                return;
            }
        };
        match port.send(&frame) {
            Ok(()) => {
                if require_response {
                    link.respond_ok(transport, msg_type::TX_CHAN_DATA, &[]);
                }
                if self.loopback {
                    link.send_rx_data(transport, self.channel_id, rx_status::TX_MSG_TYPE, data);
                }
            }
            Err(_) => {
                defmt::warn!("raw CAN send failed on channel {}", self.channel_id);
                if require_response {
                    link.respond_err(
                        transport,
                        msg_type::TX_CHAN_DATA,
                        err::FAILED,
                        "CAN controller rejected the frame",
                    );
                }
            }
        }
    }

    /// The reference never implements a raw CAN `ioctl_get`; preserved as-is.
    pub fn ioctl_get<S: SerialTransport>(&mut self, link: &mut HostLink, transport: &mut S) {
        link.respond_err(
            transport,
            msg_type::IOCTL_GET,
            err::FAILED,
            "CAN IOCTL get unimplemented",
        );
    }

    pub fn ioctl_set<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        id: u32,
        value: u32,
    ) {
        if id == IOCTL_LOOPBACK {
            self.loopback = value != 0;
            link.respond_ok(transport, msg_type::IOCTL_SET, &[]);
        } else {
            link.respond_err(
                transport,
                msg_type::IOCTL_SET,
                err::FAILED,
                "CAN IOCTL set unimplemented",
            );
        }
    }

    /// Drains every in-use mailbox, dropping frames that match a block
    /// filter's pattern/mask and forwarding the rest (spec.md §4.4).
    pub fn update<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
    ) {
        for mailbox in 0..MAILBOX_COUNT {
            let role = match port.role(mailbox) {
                Some(r) => r,
                None => continue,
            };
            while let Some(frame) = port.try_recv(mailbox) {
                if let MailboxRole::BlockFilter { pattern, mask } = role {
                    if (mask & frame.id()) == pattern {
                        continue;
                    }
                }
                let mut payload = Vec::<u8, 12>::new();
                let _ = payload.extend_from_slice(&frame.id().to_be_bytes());
                let _ = payload.extend_from_slice(frame.data());
                link.send_rx_data(transport, self.channel_id, rx_status::NORMAL, &payload);
            }
        }
    }
}

fn be_bytes_to_u32(bytes: &[u8]) -> u32 {
    let mut v = 0u32;
    for b in bytes {
        v = (v << 8) | (*b as u32);
    }
    v
}

fn mailbox_err_to_response(e: MailboxError) -> (u8, &'static str) {
    match e {
        MailboxError::OutOfRange => (err::EXCEEDED_LIMIT, "filter id exceeds the mailbox budget"),
        MailboxError::AlreadyInUse => (err::FAILED, "filter id in use"),
        MailboxError::NotInUse => (err::INVALID_FILTER_ID, "no filter installed at that id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_port::CanPort;

    #[derive(Default)]
    struct FakeTransceiver {
        sent: Vec<CanFrame, 8>,
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
        out: Vec<u8, 64>,
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
    fn pass_filter_scenario_delivers_one_frame() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        let mut chan = RawCanChannel::new(0, false);
        chan.add_filter(&mut port, 0, FILTER_PASS, &0x000007FFu32.to_be_bytes(), &0x000007E8u32.to_be_bytes())
            .unwrap();

        let frame = CanFrame::new(0x7E8, false, &[0x41, 0x0D, 0, 0, 0, 0, 0, 0]).unwrap();
        port.inject(0, frame);

        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        chan.update(&mut port, &mut link, &mut transport);

        let expected_args = [0, 0, 0x07, 0xE8, 0x41, 0x0D, 0, 0, 0, 0, 0, 0];
        let mut expected = Vec::<u8, 64>::new();
        let len = (2 + 1 + 4 + expected_args.len()) as u16;
        expected.extend_from_slice(&len.to_le_bytes()).unwrap();
        expected.push(0).unwrap();
        expected.push(msg_type::RX_CHAN_DATA).unwrap();
        expected.push(0).unwrap();
        expected.extend_from_slice(&rx_status::NORMAL.to_le_bytes()).unwrap();
        expected.extend_from_slice(&expected_args).unwrap();
        assert_eq!(transport.out.as_slice(), expected.as_slice());
    }

    #[test]
    fn block_filter_drops_matching_frame() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        let mut chan = RawCanChannel::new(0, false);
        chan.add_filter(&mut port, 1, FILTER_BLOCK, &0x000007FFu32.to_be_bytes(), &0x0000_0123u32.to_be_bytes())
            .unwrap();
        port.inject(1, CanFrame::new(0x123, false, &[1]).unwrap());

        let mut link = HostLink::new();
        let mut transport = RecordingTransport::default();
        chan.update(&mut port, &mut link, &mut transport);
        assert!(transport.out.is_empty());
    }

    #[test]
    fn flow_control_filter_rejected() {
        let mut port = CanPort::new(FakeTransceiver::default());
        port.enable(500_000).unwrap();
        let mut chan = RawCanChannel::new(0, false);
        let res = chan.add_filter(&mut port, 0, FILTER_FLOW_CONTROL, &[0, 0, 7, 0xFF], &[0, 0, 7, 0xE8]);
        assert_eq!(res, Err((err::FAILED, "CAN channel cannot use a flow control filter")));
    }
}
