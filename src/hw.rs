//! Narrow interfaces to the board-specific collaborators this crate does not
//! implement: GPIO/LED drivers, the raw CAN controller bindings, the host
//! transport, and the K-Line UART driver (spec.md §1). The engine is generic
//! over these traits the way `can_queue::Control<I: fdcan::Instance>` is
//! generic over the FDCAN peripheral instance in the teacher firmware,
//! rather than hard-wiring a specific board.

use crate::can_frame::CanFrame;

/// Failure reading a byte within a deadline (K-Line wakeup, spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

/// The raw CAN controller: `enableCanBus`, `sendFrame`, `setRXFilter` and
/// mailbox interrupt registration in spec.md §1's terms. `CanPort` (see
/// `can_port.rs`) owns the per-mailbox software state and calls through this
/// trait for the hardware side of each operation.
pub trait CanTransceiver {
    /// Initialize the controller at the given baud rate (bit/s).
    fn enable(&mut self, baud: u32) -> Result<(), ()>;
    fn disable(&mut self);
    /// Install a hardware pattern/mask filter on one mailbox (0..7).
    fn set_filter(&mut self, mailbox: u8, pattern: u32, mask: u32, extended: bool);
    /// Revert a mailbox to block-all.
    fn clear_filter(&mut self, mailbox: u8);
    /// Non-blocking transmit.
    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), ()>;
}

/// The host-facing byte transport (USB serial or UART). Non-blocking on
/// both sides: `read` returns however many bytes are currently buffered (up
/// to the slice length), `write_all` is expected to drain synchronously
/// (the transport is assumed not to interleave two frames, per spec.md
/// §4.1).
pub trait SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn write_all(&mut self, buf: &[u8]);
}

/// Half-duplex K-Line UART plus its direct line-level drive for the wakeup
/// pulse train (spec.md §4.6).
pub trait KLineUart {
    fn set_baud(&mut self, baud: u32);
    fn bring_online(&mut self);
    fn go_offline(&mut self);
    /// Drive the K line directly (used only during fast-init pulse timing,
    /// while the UART is offline).
    fn set_line_level(&mut self, high: bool);
    fn write(&mut self, data: &[u8]);
    /// Blocking-with-deadline single byte read.
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Timeout>;
    /// Blocking millisecond delay, used only for the fast-init pulse train
    /// (spec.md §5 Suspension points: the one deliberate blocking wait).
    fn delay_ms(&mut self, ms: u32);
}

/// Battery voltage sense (`READ_BATT`, SPEC_FULL.md §C). Out of scope per
/// spec.md §1; narrow interface only.
pub trait BatteryReader {
    fn read_millivolts(&mut self) -> u16;
}

/// Status LEDs (SPEC_FULL.md §C). Peripheral; a no-op impl is provided for
/// boards without them.
pub trait StatusIndicator {
    fn set_can(&mut self, on: bool);
    fn set_kline(&mut self, on: bool);
    fn set_rx(&mut self, on: bool);
    fn set_tx(&mut self, on: bool);
}

/// Indicator implementation that does nothing.
pub struct NoIndicator;

impl StatusIndicator for NoIndicator {
    fn set_can(&mut self, _on: bool) {}
    fn set_kline(&mut self, _on: bool) {}
    fn set_rx(&mut self, _on: bool) {}
    fn set_tx(&mut self, _on: bool) {}
}
