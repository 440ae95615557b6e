//! Length-prefixed framed transport between the host PC and the firmware
//! (spec.md §4.1, §6).
//!
//! Wire format, both directions: `len_lo, len_hi, msg_id, msg_type,
//! arg_bytes...` where `len = 2 + arg_size` counts the id and type bytes.
//! The length prefix is little-endian `u16`.

use crate::hw::SerialTransport;
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

/// Largest argument payload this crate will frame. Sized for an ISO-TP
/// transfer at the spec's floor (4096 payload bytes + 4 byte CAN id
/// prefix), plus slack for the 8-byte `SET_CHAN_FILT` header fields.
pub const ARG_CAPACITY: usize = 4096 + 4 + 32;
/// Id + type bytes, counted in the wire length field alongside the args.
const HEADER_IN_LEN: usize = 2;
const FRAME_CAPACITY: usize = ARG_CAPACITY + HEADER_IN_LEN;

pub mod msg_type {
    pub const LOG: u8 = 0x01;
    pub const OPEN_CHANNEL: u8 = 0x02;
    pub const CLOSE_CHANNEL: u8 = 0x03;
    pub const SET_CHAN_FILT: u8 = 0x04;
    pub const REM_CHAN_FILT: u8 = 0x05;
    pub const TX_CHAN_DATA: u8 = 0x06;
    pub const RX_CHAN_DATA: u8 = 0x07;
    pub const READ_BATT: u8 = 0x08;
    pub const IOCTL_SET: u8 = 0x09;
    pub const IOCTL_GET: u8 = 0x10;
    pub const INIT_LIN_CHANNEL: u8 = 0x11;
    pub const STATUS: u8 = 0xAA;
    pub const GET_FW_VERSION: u8 = 0xAB;
}

pub mod err {
    pub const NOERROR: u8 = 0x00;
    pub const FAILED: u8 = 0x01;
    pub const NOT_SUPPORTED: u8 = 0x02;
    pub const CHANNEL_IN_USE: u8 = 0x03;
    pub const INVALID_CHANNEL_ID: u8 = 0x04;
    pub const INVALID_FILTER_ID: u8 = 0x05;
    pub const INVALID_IOCTL_ID: u8 = 0x06;
    pub const EXCEEDED_LIMIT: u8 = 0x07;
    pub const BUFFER_FULL: u8 = 0x08;
    pub const NULL_PARAMETER: u8 = 0x09;
    pub const TIMEOUT: u8 = 0x0A;
}

/// rx_status values carried in a `RX_CHAN_DATA` event (spec.md §4.4, §4.5).
pub mod rx_status {
    pub const NORMAL: u32 = 0x0000_0000;
    pub const TX_MSG_TYPE: u32 = 0x0000_0001;
    pub const FIRST_FRAME: u32 = 0x0000_0002;
}

/// A fully received host→firmware frame, or a firmware→host one about to be
/// serialized.
#[derive(Clone)]
pub struct HostMessage {
    pub msg_id: u8,
    pub msg_type: u8,
    pub args: Vec<u8, ARG_CAPACITY>,
}

/// Incremental, non-blocking, reentrant frame reader plus the three
/// response-writer helpers (spec.md §4.1).
pub struct HostLink {
    reading: bool,
    len_bytes: [u8; 2],
    len_have: u8,
    target_len: u16,
    scratch: Vec<u8, FRAME_CAPACITY>,
    /// Most recent non-zero request id; tagged onto every response
    /// (spec.md §3 HostMessage invariant).
    last_id: u8,
}

impl HostLink {
    pub const fn new() -> Self {
        Self {
            reading: false,
            len_bytes: [0; 2],
            len_have: 0,
            target_len: 0,
            scratch: Vec::new(),
            last_id: 0,
        }
    }

    pub fn last_id(&self) -> u8 {
        self.last_id
    }

    /// Host disconnect: drop any partially-read frame and forget `last_id`
    /// (spec.md §8 scenario 6).
    pub fn reset(&mut self) {
        self.reading = false;
        self.len_have = 0;
        self.scratch.clear();
        self.last_id = 0;
    }

    /// Drains whatever bytes the transport currently has buffered. Returns
    /// a completed message at most once per call; otherwise the frame is
    /// still in progress.
    pub fn poll<S: SerialTransport>(&mut self, transport: &mut S) -> Option<HostMessage> {
        if !self.reading {
            if self.len_have < 2 {
                let mut tmp = [0u8; 2];
                let want = 2 - self.len_have as usize;
                let n = transport.read(&mut tmp[..want]);
                for b in &tmp[..n] {
                    self.len_bytes[self.len_have as usize] = *b;
                    self.len_have += 1;
                }
                if self.len_have < 2 {
                    return None;
                }
            }
            let target_len = LittleEndian::read_u16(&self.len_bytes);
            self.len_have = 0;
            if (target_len as usize) < HEADER_IN_LEN || (target_len as usize) > FRAME_CAPACITY {
                defmt::error!(
                    "HostLink: frame length {} out of range, discarding",
                    target_len
                );
                return None;
            }
            self.target_len = target_len;
            self.scratch.clear();
            self.reading = true;
        }

        let remaining = self.target_len as usize - self.scratch.len();
        if remaining > 0 {
            let mut tmp = [0u8; 64];
            let to_read = remaining.min(tmp.len());
            let n = transport.read(&mut tmp[..to_read]);
            let _ = self.scratch.extend_from_slice(&tmp[..n]);
        }

        if self.scratch.len() < self.target_len as usize {
            return None;
        }

        self.reading = false;
        let msg_id = self.scratch[0];
        let msg_type = self.scratch[1];
        let mut args = Vec::new();
        let _ = args.extend_from_slice(&self.scratch[2..]);
        if msg_id != 0 {
            self.last_id = msg_id;
        }
        Some(HostMessage {
            msg_id,
            msg_type,
            args,
        })
    }

    fn send_message<S: SerialTransport>(&mut self, transport: &mut S, msg: &HostMessage) {
        let arg_size = msg.args.len() as u16;
        let len = HEADER_IN_LEN as u16 + arg_size;
        let mut header = [0u8; 4];
        LittleEndian::write_u16(&mut header[0..2], len);
        header[2] = msg.msg_id;
        header[3] = msg.msg_type;
        transport.write_all(&header);
        transport.write_all(&msg.args);
    }

    /// `respond_ok(op, args)` → `{msg_type=op, msg_id=last_id, args =
    /// [0x00] ++ args}`.
    pub fn respond_ok<S: SerialTransport>(&mut self, transport: &mut S, op: u8, args: &[u8]) {
        let mut payload = Vec::<u8, ARG_CAPACITY>::new();
        let _ = payload.push(err::NOERROR);
        let _ = payload.extend_from_slice(args);
        let msg = HostMessage {
            msg_id: self.last_id,
            msg_type: op,
            args: payload,
        };
        self.send_message(transport, &msg);
    }

    /// `respond_err(op, err_code, text)` → `{msg_type=op, msg_id=last_id,
    /// args = [err_code] ++ text_bytes}`.
    pub fn respond_err<S: SerialTransport>(
        &mut self,
        transport: &mut S,
        op: u8,
        error_code: u8,
        text: &str,
    ) {
        let mut payload = Vec::<u8, ARG_CAPACITY>::new();
        let _ = payload.push(error_code);
        let _ = payload.extend_from_slice(text.as_bytes());
        let msg = HostMessage {
            msg_id: self.last_id,
            msg_type: op,
            args: payload,
        };
        self.send_message(transport, &msg);
    }

    /// `send_rx_data(channel_id, rx_status, data)` → unsolicited
    /// `MSG_RX_CHAN_DATA` (`msg_id = 0`).
    pub fn send_rx_data<S: SerialTransport>(
        &mut self,
        transport: &mut S,
        channel_id: u8,
        rx_status: u32,
        data: &[u8],
    ) {
        let mut payload = Vec::<u8, ARG_CAPACITY>::new();
        let _ = payload.push(channel_id);
        let mut rx_status_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut rx_status_bytes, rx_status);
        let _ = payload.extend_from_slice(&rx_status_bytes);
        let _ = payload.extend_from_slice(data);
        let msg = HostMessage {
            msg_id: 0,
            msg_type: msg_type::RX_CHAN_DATA,
            args: payload,
        };
        self.send_message(transport, &msg);
    }

    /// `msg_type=MSG_LOG`, `msg_id=0`.
    pub fn log_message<S: SerialTransport>(&mut self, transport: &mut S, text: &str) {
        let mut payload = Vec::<u8, ARG_CAPACITY>::new();
        let _ = payload.extend_from_slice(text.as_bytes());
        let msg = HostMessage {
            msg_id: 0,
            msg_type: msg_type::LOG,
            args: payload,
        };
        self.send_message(transport, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct LoopbackTransport {
        rx: Vec<u8, 256>,
        rx_pos: usize,
        tx: Vec<u8, 256>,
    }

    impl LoopbackTransport {
        fn push_host_bytes(&mut self, bytes: &[u8]) {
            self.rx.extend_from_slice(bytes).unwrap();
        }
    }

    impl SerialTransport for LoopbackTransport {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let avail = self.rx.len() - self.rx_pos;
            let n = avail.min(buf.len());
            buf[..n].copy_from_slice(&self.rx[self.rx_pos..self.rx_pos + n]);
            self.rx_pos += n;
            n
        }

        fn write_all(&mut self, buf: &[u8]) {
            self.tx.extend_from_slice(buf).unwrap();
        }
    }

    fn frame_bytes(msg_id: u8, msg_type: u8, args: &[u8]) -> Vec<u8, 256> {
        let len = (2 + args.len()) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_le_bytes()).unwrap();
        out.push(msg_id).unwrap();
        out.push(msg_type).unwrap();
        out.extend_from_slice(args).unwrap();
        out
    }

    #[test]
    fn reads_one_full_frame_and_tracks_last_id() {
        let mut link = HostLink::new();
        let mut t = LoopbackTransport::default();
        t.push_host_bytes(&frame_bytes(7, msg_type::OPEN_CHANNEL, &[1, 2, 3]));

        let msg = link.poll(&mut t).expect("frame should complete in one poll");
        assert_eq!(msg.msg_id, 7);
        assert_eq!(msg.msg_type, msg_type::OPEN_CHANNEL);
        assert_eq!(msg.args.as_slice(), &[1, 2, 3]);
        assert_eq!(link.last_id(), 7);
    }

    #[test]
    fn unsolicited_message_does_not_update_last_id() {
        let mut link = HostLink::new();
        let mut t = LoopbackTransport::default();
        t.push_host_bytes(&frame_bytes(9, msg_type::TX_CHAN_DATA, &[0xAA]));
        link.poll(&mut t).unwrap();
        assert_eq!(link.last_id(), 9);

        t.push_host_bytes(&frame_bytes(0, msg_type::TX_CHAN_DATA, &[0xBB]));
        link.poll(&mut t).unwrap();
        assert_eq!(link.last_id(), 9);
    }

    #[test]
    fn partial_frame_across_polls_stays_in_progress() {
        let mut link = HostLink::new();
        let mut t = LoopbackTransport::default();
        let full = frame_bytes(3, msg_type::IOCTL_GET, &[1, 2, 3, 4]);

        t.push_host_bytes(&full[..3]);
        assert!(link.poll(&mut t).is_none());

        t.push_host_bytes(&full[3..]);
        let msg = link.poll(&mut t).expect("frame completes once all bytes arrive");
        assert_eq!(msg.args.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn respond_ok_tags_last_id_and_prefixes_status() {
        let mut link = HostLink::new();
        let mut t = LoopbackTransport::default();
        t.push_host_bytes(&frame_bytes(5, msg_type::TX_CHAN_DATA, &[]));
        link.poll(&mut t).unwrap();

        link.respond_ok(&mut t, msg_type::TX_CHAN_DATA, &[]);
        assert_eq!(
            t.tx.as_slice(),
            &[2, 0, 5, msg_type::TX_CHAN_DATA, err::NOERROR]
        );
    }

    #[test]
    fn reset_clears_last_id() {
        let mut link = HostLink::new();
        let mut t = LoopbackTransport::default();
        t.push_host_bytes(&frame_bytes(5, msg_type::TX_CHAN_DATA, &[]));
        link.poll(&mut t).unwrap();
        assert_eq!(link.last_id(), 5);
        link.reset();
        assert_eq!(link.last_id(), 0);
    }
}
