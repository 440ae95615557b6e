//! Channel registry (spec.md §4.3): two exclusive-owner slots, one for the
//! CAN-family channel (raw CAN or ISO-TP) and one for K-Line. Modeled as a
//! tagged variant over a small capability interface rather than the
//! reference's `Channel` abstract base with three concrete subclasses
//! (spec.md §9 REDESIGN FLAGS).

pub mod isotp;
pub mod kline;
pub mod raw_can;

use crate::can_port::CanPort;
use crate::clock::Clock;
use crate::host_link::{err, msg_type, HostLink};
use crate::hw::{CanTransceiver, KLineUart, SerialTransport};

/// `channel_id` values from the open-channel payload (spec.md §4.3).
pub const CHANNEL_ID_CAN: u32 = 0;
pub const CHANNEL_ID_KLINE: u32 = 1;

/// Protocol ids from the open-channel payload. Values match the public
/// J2534 `ProtocolID` table the reference firmware's host driver speaks.
pub const PROTOCOL_CAN: u32 = 5;
pub const PROTOCOL_ISO15765: u32 = 6;
pub const PROTOCOL_ISO9141: u32 = 3;

/// Open-channel `flags` bits (J2534 `TxFlags`/connect-flags values).
pub const FLAG_CAN_29BIT_ID: u32 = 0x0100;
pub const FLAG_ISO15765_ADDR_TYPE: u32 = 0x0080;

/// `addFilter` filter-type ids (J2534 `FilterType`).
pub const FILTER_PASS: u32 = 1;
pub const FILTER_BLOCK: u32 = 2;
pub const FILTER_FLOW_CONTROL: u32 = 3;

/// The CAN-family slot: at most one of a raw CAN channel or an ISO-TP
/// channel, both built over the same `CanPort` mailbox resource.
pub enum CanFamilyChannel {
    Raw(raw_can::RawCanChannel),
    IsoTp(isotp::IsoTpChannel),
}

impl CanFamilyChannel {
    pub fn add_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
        filter_type: u32,
        mask: &[u8],
        pattern: &[u8],
        flowcontrol: &[u8],
    ) -> Result<(), (u8, &'static str)> {
        match self {
            CanFamilyChannel::Raw(c) => c.add_filter(port, filter_id, filter_type, mask, pattern),
            CanFamilyChannel::IsoTp(c) => {
                c.add_filter(port, filter_id, filter_type, mask, pattern, flowcontrol)
            }
        }
    }

    pub fn remove_filter<D: CanTransceiver>(
        &mut self,
        port: &mut CanPort<D>,
        filter_id: usize,
    ) -> Result<(), (u8, &'static str)> {
        match self {
            CanFamilyChannel::Raw(c) => c.remove_filter(port, filter_id),
            CanFamilyChannel::IsoTp(c) => c.remove_filter(port, filter_id),
        }
    }

    pub fn send<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        tx_flags: u32,
        data: &[u8],
        require_response: bool,
    ) {
        match self {
            CanFamilyChannel::Raw(c) => c.send(port, link, transport, data, require_response),
            CanFamilyChannel::IsoTp(c) => {
                c.send(port, link, transport, tx_flags, data, require_response)
            }
        }
    }

    pub fn update<D: CanTransceiver, S: SerialTransport, C: Clock>(
        &mut self,
        port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        clock: &C,
    ) {
        match self {
            CanFamilyChannel::Raw(c) => c.update(port, link, transport),
            CanFamilyChannel::IsoTp(c) => c.update(port, link, transport, clock),
        }
    }

    pub fn ioctl_get<D: CanTransceiver, S: SerialTransport>(
        &mut self,
        _port: &mut CanPort<D>,
        link: &mut HostLink,
        transport: &mut S,
        id: u32,
    ) {
        match self {
            CanFamilyChannel::Raw(c) => c.ioctl_get(link, transport),
            CanFamilyChannel::IsoTp(c) => c.ioctl_get(link, transport, id),
        }
    }

    pub fn ioctl_set<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        id: u32,
        value: u32,
    ) {
        match self {
            CanFamilyChannel::Raw(c) => c.ioctl_set(link, transport, id, value),
            CanFamilyChannel::IsoTp(c) => c.ioctl_set(link, transport, id, value),
        }
    }
}

/// Two exclusive-owner slots plus the shared mailbox resource (spec.md §3
/// Channel, §9 "process-wide mutable globals" redesign).
pub struct ChannelRegistry<D: CanTransceiver, K: KLineUart> {
    pub can_port: CanPort<D>,
    can_slot: Option<CanFamilyChannel>,
    kline_slot: Option<kline::KLineChannel>,
    kline_uart: K,
}

impl<D: CanTransceiver, K: KLineUart> ChannelRegistry<D, K> {
    pub fn new(transceiver: D, kline_uart: K) -> Self {
        Self {
            can_port: CanPort::new(transceiver),
            can_slot: None,
            kline_slot: None,
            kline_uart,
        }
    }

    /// Returns whether the channel ended up open, so the caller can drive
    /// ambient state (status LEDs) off the real outcome rather than guessing.
    pub fn open_channel<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        protocol: u32,
        baud: u32,
        flags: u32,
    ) -> bool {
        match channel_id {
            CHANNEL_ID_CAN => {
                if self.can_slot.is_some() {
                    link.respond_err(transport, msg_type::OPEN_CHANNEL, err::CHANNEL_IN_USE, "");
                    return false;
                }
                if self.can_port.enable(baud).is_err() {
                    link.respond_err(
                        transport,
                        msg_type::OPEN_CHANNEL,
                        err::FAILED,
                        "CAN Controller setup failed!",
                    );
                    return false;
                }
                let extended = flags & FLAG_CAN_29BIT_ID != 0;
                self.can_slot = Some(match protocol {
                    PROTOCOL_ISO15765 => {
                        let extended_addressing = flags & FLAG_ISO15765_ADDR_TYPE != 0;
                        CanFamilyChannel::IsoTp(isotp::IsoTpChannel::new(
                            channel_id as u8,
                            extended,
                            extended_addressing,
                        ))
                    }
                    _ => CanFamilyChannel::Raw(raw_can::RawCanChannel::new(channel_id as u8, extended)),
                });
                link.respond_ok(transport, msg_type::OPEN_CHANNEL, &[]);
                true
            }
            CHANNEL_ID_KLINE => {
                if self.kline_slot.is_some() {
                    link.respond_err(transport, msg_type::OPEN_CHANNEL, err::CHANNEL_IN_USE, "");
                    return false;
                }
                if protocol != PROTOCOL_ISO9141 {
                    link.respond_err(transport, msg_type::OPEN_CHANNEL, err::NOT_SUPPORTED, "");
                    return false;
                }
                self.kline_slot = Some(kline::KLineChannel::new(channel_id as u8, baud));
                link.respond_ok(transport, msg_type::OPEN_CHANNEL, &[]);
                true
            }
            _ => {
                link.respond_err(
                    transport,
                    msg_type::OPEN_CHANNEL,
                    err::FAILED,
                    "Protocol unsupported",
                );
                false
            }
        }
    }

    /// Returns whether a channel was actually torn down.
    pub fn close_channel<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
    ) -> bool {
        match channel_id {
            CHANNEL_ID_CAN => {
                if self.can_slot.take().is_some() {
                    self.can_port.disable();
                    link.respond_ok(transport, msg_type::CLOSE_CHANNEL, &[]);
                    true
                } else {
                    link.respond_err(transport, msg_type::CLOSE_CHANNEL, err::INVALID_CHANNEL_ID, "");
                    false
                }
            }
            CHANNEL_ID_KLINE => {
                if self.kline_slot.take().is_some() {
                    self.kline_uart.go_offline();
                    link.respond_ok(transport, msg_type::CLOSE_CHANNEL, &[]);
                    true
                } else {
                    link.respond_err(transport, msg_type::CLOSE_CHANNEL, err::INVALID_CHANNEL_ID, "");
                    false
                }
            }
            _ => {
                link.respond_err(transport, msg_type::CLOSE_CHANNEL, err::FAILED, "Protocol unsupported");
                false
            }
        }
    }

    /// Destroys both slots without emitting a response (host disconnect,
    /// spec.md §3 Lifecycle / §8 scenario 6).
    pub fn reset_all_channels(&mut self) {
        if self.can_slot.take().is_some() {
            self.can_port.disable();
        }
        if self.kline_slot.take().is_some() {
            self.kline_uart.go_offline();
        }
    }

    pub fn add_filter<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        filter_id: u32,
        filter_type: u32,
        mask: &[u8],
        pattern: &[u8],
        flowcontrol: &[u8],
    ) {
        let result = match channel_id {
            CHANNEL_ID_CAN => match &mut self.can_slot {
                Some(c) => c.add_filter(
                    &mut self.can_port,
                    filter_id as usize,
                    filter_type,
                    mask,
                    pattern,
                    flowcontrol,
                ),
                None => Err((err::INVALID_CHANNEL_ID, "Can based channel null")),
            },
            CHANNEL_ID_KLINE => match &mut self.kline_slot {
                Some(c) => c.add_filter(),
                None => Err((err::INVALID_CHANNEL_ID, "Kline based channel null")),
            },
            _ => Err((err::INVALID_CHANNEL_ID, "Channel ID does not exist")),
        };
        match result {
            Ok(()) => link.respond_ok(transport, msg_type::SET_CHAN_FILT, &[]),
            Err((code, text)) => link.respond_err(transport, msg_type::SET_CHAN_FILT, code, text),
        }
    }

    pub fn remove_filter<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        filter_id: u32,
    ) {
        let result = match channel_id {
            CHANNEL_ID_CAN => match &mut self.can_slot {
                Some(c) => c.remove_filter(&mut self.can_port, filter_id as usize),
                None => Err((err::INVALID_CHANNEL_ID, "Can based channel null")),
            },
            CHANNEL_ID_KLINE => match &mut self.kline_slot {
                Some(c) => c.remove_filter(),
                None => Err((err::INVALID_CHANNEL_ID, "Kline based channel null")),
            },
            _ => Err((err::INVALID_CHANNEL_ID, "Channel ID does not exist")),
        };
        match result {
            Ok(()) => link.respond_ok(transport, msg_type::REM_CHAN_FILT, &[]),
            Err((code, text)) => link.respond_err(transport, msg_type::REM_CHAN_FILT, code, text),
        }
    }

    pub fn send<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        tx_flags: u32,
        data: &[u8],
        require_response: bool,
    ) {
        match channel_id {
            CHANNEL_ID_CAN => match &mut self.can_slot {
                Some(c) => c.send(&mut self.can_port, link, transport, tx_flags, data, require_response),
                None => {
                    if require_response {
                        link.respond_err(transport, msg_type::TX_CHAN_DATA, err::INVALID_CHANNEL_ID, "");
                    } else {
                        link.log_message(transport, "Cannot send, Channel null!");
                    }
                }
            },
            CHANNEL_ID_KLINE => match &mut self.kline_slot {
                Some(c) => c.send(link, transport, data, require_response),
                None => {
                    if require_response {
                        link.respond_err(transport, msg_type::TX_CHAN_DATA, err::INVALID_CHANNEL_ID, "");
                    } else {
                        link.log_message(transport, "Cannot send, Channel null!");
                    }
                }
            },
            _ => {
                if require_response {
                    link.respond_err(
                        transport,
                        msg_type::TX_CHAN_DATA,
                        err::FAILED,
                        "Tx data not implemented for this protocol",
                    );
                }
            }
        }
    }

    pub fn ioctl_get<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        ioctl_id: u32,
    ) {
        match channel_id {
            CHANNEL_ID_CAN => match &mut self.can_slot {
                Some(c) => c.ioctl_get(&mut self.can_port, link, transport, ioctl_id),
                None => link.respond_err(transport, msg_type::IOCTL_GET, err::INVALID_CHANNEL_ID, ""),
            },
            CHANNEL_ID_KLINE => match &mut self.kline_slot {
                Some(c) => c.ioctl_get(link, transport, ioctl_id),
                None => link.respond_err(transport, msg_type::IOCTL_GET, err::INVALID_CHANNEL_ID, ""),
            },
            _ => link.respond_err(transport, msg_type::IOCTL_GET, err::INVALID_CHANNEL_ID, ""),
        }
    }

    pub fn ioctl_set<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        channel_id: u32,
        ioctl_id: u32,
        value: u32,
    ) {
        match channel_id {
            CHANNEL_ID_CAN => match &mut self.can_slot {
                Some(c) => c.ioctl_set(link, transport, ioctl_id, value),
                None => link.respond_err(transport, msg_type::IOCTL_SET, err::INVALID_CHANNEL_ID, ""),
            },
            CHANNEL_ID_KLINE => match &mut self.kline_slot {
                Some(c) => c.ioctl_set(link, transport, ioctl_id, value),
                None => link.respond_err(transport, msg_type::IOCTL_SET, err::INVALID_CHANNEL_ID, ""),
            },
            _ => link.respond_err(transport, msg_type::IOCTL_SET, err::INVALID_CHANNEL_ID, ""),
        }
    }

    pub fn wakeup<S: SerialTransport>(
        &mut self,
        link: &mut HostLink,
        transport: &mut S,
        request: &[u8],
    ) {
        match &mut self.kline_slot {
            Some(c) => c.fast_init(&mut self.kline_uart, link, transport, request),
            None => link.respond_err(transport, msg_type::INIT_LIN_CHANNEL, err::INVALID_CHANNEL_ID, ""),
        }
    }

    /// Dispatch-loop tick: `update()` on whichever channels are present
    /// (spec.md §4.7 step 2).
    pub fn update<S: SerialTransport, C: Clock>(&mut self, link: &mut HostLink, transport: &mut S, clock: &C) {
        if let Some(c) = &mut self.can_slot {
            c.update(&mut self.can_port, link, transport, clock);
        }
        if let Some(c) = &mut self.kline_slot {
            c.update(link, transport);
        }
    }
}
