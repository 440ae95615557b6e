#![no_main]
#![no_std]

use core::sync::atomic::{AtomicUsize, Ordering};
use defmt_brtt as _; // global logger

use panic_probe as _;

use stm32g4xx_hal as _; // memory layout

use vdiag_fw::can_frame::CanFrame;
use vdiag_fw::engine::Engine;
use vdiag_fw::hardware;

pub use vdiag_fw::*;

#[rtic::app(device = stm32g4xx_hal::stm32, dispatchers = [USBWAKEUP, COMP1_2_3])]
mod app {
    use super::*;
    use fugit::ExtU32;
    use hardware::{BatteryHardware, CanHardware, KLineHardware, LedIndicator, Mono, SystickClock};
    use rtic_monotonics::Monotonic;

    type Adapter = Engine<CanHardware, KLineHardware, BatteryHardware, LedIndicator>;

    #[shared]
    struct Shared {
        engine: Adapter,
    }

    #[local]
    struct Local {
        host_uart: hardware::HostUart,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        defmt::info!("init");

        let board = hardware::init(cx.core, cx.device);

        let can_hw = CanHardware::new(board.can_config, board.can_clock_hz);
        let kline_hw = KLineHardware::new(board.kline_uart, board.kline_level);
        let battery_hw = BatteryHardware::new(board.battery_adc, board.battery_channel);
        let indicator = LedIndicator::new(board.can_led, board.kline_led, board.rx_led, board.tx_led);

        let engine = Engine::new(can_hw, kline_hw, battery_hw, indicator);

        can_irq::spawn().unwrap();
        dispatch_loop::spawn().unwrap();

        (
            Shared { engine },
            Local {
                host_uart: board.host_uart,
            },
        )
    }

    /// Drains newly arrived CAN frames into their mailbox rings (spec.md §2
    /// CanPort, §5: the interrupt-context producer side of each mailbox's
    /// ring buffer). Re-armed every time the hardware interrupt fires.
    #[task(binds = FDCAN1_INTR1_IT, shared = [engine], priority = 6)]
    fn can_irq(mut cx: can_irq::Context) {
        cx.shared.engine.lock(|engine| {
            let hw = engine.can_transceiver_mut();
            hw.ack_irq();
            let mut frames: heapless::Vec<(usize, CanFrame), 16> = heapless::Vec::new();
            hw.drain_rx(|mailbox, frame| {
                frames.push((mailbox, frame)).ok();
            });
            for (mailbox, frame) in frames {
                engine.on_can_frame(mailbox, frame);
            }
        });
    }

    /// The single cooperative dispatch loop (spec.md §4.7): drains the host
    /// link, dispatches at most one completed message, then polls every open
    /// channel, once per tick.
    #[task(local = [host_uart], shared = [engine], priority = 1)]
    async fn dispatch_loop(mut cx: dispatch_loop::Context) {
        let host_uart = cx.local.host_uart;
        let mut next = Mono::now() + 1.millis();
        loop {
            Mono::delay_until(next).await;
            next += 1.millis();
            cx.shared.engine.lock(|engine| engine.poll(host_uart, &SystickClock));
        }
    }
}

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}

static COUNT: AtomicUsize = AtomicUsize::new(0);
defmt::timestamp!("{=usize}", {
    // NOTE(no-CAS) `timestamps` runs with interrupts disabled
    let n = COUNT.load(Ordering::Relaxed);
    COUNT.store(n + 1, Ordering::Relaxed);
    n
});

/// Terminates the application and makes `probe-rs` exit with exit-code = 0
pub fn exit() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}
