//! Protocol translation engine for a dual-interface vehicle diagnostic
//! adapter: a host-facing framed serial protocol on one side, native vehicle
//! bus protocols (raw CAN, ISO-TP, K-Line/ISO9141) on the other.
//!
//! This crate is the hardware-agnostic core. `#[cfg(not(test))] no_std` lets
//! every module's `#[cfg(test)] mod tests` run under `cargo test` on the
//! host, exactly as `projectgus-fakon` keeps its `lib.rs` separate from the
//! RTIC-wired `main.rs` binary so the protocol logic is testable without a
//! board attached.

#![cfg_attr(not(test), no_std)]

pub mod can_frame;
pub mod can_port;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod host_link;
pub mod hw;

/// Board-level wiring (FDCAN, UARTs, ADC, LEDs, monotonic clock) behind the
/// `hw` traits. Only built for the firmware binary: it pulls in
/// `stm32g4xx-hal`/`fdcan` register-level types that have no business in a
/// host-side `cargo test` run.
#[cfg(not(test))]
pub mod hardware;
