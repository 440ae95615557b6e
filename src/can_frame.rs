//! CAN frame type shared by the raw CAN and ISO-TP channels.

use heapless::Vec;

/// An 11- or 29-bit CAN identifier plus up to 8 data bytes. Immutable once
/// built (spec.md §3), mirroring `embedded_can::Frame`/`CAN_FRAME` in the
/// reference but kept as a plain value type rather than implementing
/// `embedded_can::Frame` directly, since this crate's wire format always
/// carries the id big-endian in 4 bytes regardless of 11/29-bit width.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    data: Vec<u8, 8>,
}

impl CanFrame {
    /// Returns `None` if `data` is longer than 8 bytes.
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut v = Vec::new();
        v.extend_from_slice(data).ok()?;
        Some(Self {
            id,
            extended,
            data: v,
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl defmt::Format for CanFrame {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "CanFrame(id={=u32:#x}, ext={}, data={=[u8]:#04x})",
            self.id,
            self.extended,
            self.data.as_slice(),
        );
    }
}
