//! Board-level wiring: pin assignments, clock tree and the concrete impls of
//! the `hw` traits for this adapter's STM32G474 target. Laid out the way
//! `projectgus-fakon`'s `hardware.rs` assembles a `Board` struct out of
//! `stm32g4xx_hal` peripherals, just for a diagnostic-adapter board instead
//! of a vehicle-integration board: one FDCAN transceiver, a host-facing
//! USART (the `HostLink` transport), a K-Line USART plus a GPIO for the
//! wakeup pulse train, a battery-sense ADC channel and four status LEDs.

use can_bit_timings::CanBitTiming;
use defmt::info;
use fdcan::config::FrameTransmissionConfig::ClassicCanOnly;
use fdcan::config::InterruptLine;
use fdcan::filter::{ExtendedFilter, ExtendedFilterSlot, FilterAction, StandardFilter, StandardFilterSlot};
use fdcan::frame::{FrameFormat, RxFrameInfo, TxFrameHeader};
use fdcan::interrupt::{Interrupt, Interrupts};
use fdcan::{ConfigMode, FdCan, Fifo0, NormalOperationMode, ReceiveOverrun};
use fugit::{ExtU32, RateExtU32};
use hal::adc::AdcClaim;
use hal::gpio::gpioa;
use hal::gpio::gpiob;
use hal::gpio::gpioc;
use hal::gpio::Output;
use hal::gpio::PushPull;
use hal::prelude::*;
use stm32g4xx_hal as hal;
use stm32g4xx_hal::can::CanExt;
use stm32g4xx_hal::gpio::GpioExt;
use stm32g4xx_hal::gpio::Speed;
use stm32g4xx_hal::pwr::PwrExt;
use stm32g4xx_hal::rcc;
use stm32g4xx_hal::rcc::{PllConfig, RccExt};
use stm32g4xx_hal::serial::{FullConfig, Serial};
use stm32g4xx_hal::stm32;

use crate::can_frame::CanFrame;
use crate::can_port::MAILBOX_COUNT;
use crate::hw::{BatteryReader, CanTransceiver, KLineUart, SerialTransport, StatusIndicator, Timeout};

/// Hardware peripheral carrying the vehicle-side CAN bus.
pub type VehicleCan = hal::can::Can<stm32::FDCAN1>;
/// Host-facing USART (the transport `HostLink` frames over).
pub type HostUart = Serial<stm32::USART2, FullConfig>;
/// K-Line half-duplex UART.
pub type KLineUsart = Serial<stm32::USART1, FullConfig>;

pub type CanLed = gpiob::PB10<Output<PushPull>>;
pub type KLineLed = gpiob::PB5<Output<PushPull>>;
pub type RxLed = gpioa::PA10<Output<PushPull>>;
pub type TxLed = gpioc::PC4<Output<PushPull>>;
/// Direct GPIO drive of the K-Line during the fast-init pulse train, while
/// the UART peripheral is offline (spec.md §4.6).
pub type KLineLevelPin = gpioc::PC5<Output<PushPull>>;

pub const MONOTONIC_FREQUENCY: u32 = 1_000;
rtic_monotonics::systick_monotonic!(Mono, MONOTONIC_FREQUENCY);

/// `crate::clock::Clock` backed by the systick monotonic (spec.md §5: all
/// ISO-TP/K-Line timing runs against a monotonic millisecond clock).
pub struct SystickClock;

impl crate::clock::Clock for SystickClock {
    fn now_ms(&self) -> u32 {
        Mono::now().duration_since_epoch().to_millis()
    }
}

pub struct Board {
    pub can_config: FdCan<VehicleCan, ConfigMode>,
    pub can_clock_hz: u32,
    pub host_uart: HostUart,
    pub kline_uart: KLineUsart,
    pub kline_level: KLineLevelPin,
    pub battery_adc: hal::adc::Adc<stm32::ADC1, hal::adc::config::Continuous>,
    pub battery_channel: gpioa::PA1<hal::gpio::Analog>,
    pub can_led: CanLed,
    pub kline_led: KLineLed,
    pub rx_led: RxLed,
    pub tx_led: TxLed,
}

pub fn init(core: cortex_m::Peripherals, dp: stm32::Peripherals) -> Board {
    info!("hardware init");

    let mut rcc = dp.RCC.constrain();
    let pll_config = PllConfig {
        mux: rcc::PllSrc::HSE(24_u32.MHz()),
        n: rcc::PllNMul::MUL_32,
        m: rcc::PllMDiv::DIV_3,
        r: Some(rcc::PllRDiv::DIV_2),
        q: None,
        p: None,
    };
    let clock_config = rcc::Config::default()
        .pll_cfg(pll_config)
        .clock_src(rcc::SysClockSrc::PLL)
        .ahb_psc(rcc::Prescaler::NotDivided)
        .apb1_psc(rcc::Prescaler::Div2)
        .apb2_psc(rcc::Prescaler::Div2);
    let pwr = dp.PWR.constrain().freeze();
    let rcc = rcc.freeze(clock_config, pwr);

    Mono::start(core.SYST, rcc.clocks.sys_clk.to_Hz());

    let gpioa = dp.GPIOA.split(&rcc);
    let gpiob = dp.GPIOB.split(&rcc);
    let gpioc = dp.GPIOC.split(&rcc);

    // Vehicle-side CAN transceiver.
    let can_config = {
        let rx = gpioa.pa11.into_alternate().set_speed(Speed::VeryHigh);
        let tx = gpioa.pa12.into_alternate().set_speed(Speed::VeryHigh);
        dp.FDCAN1.fdcan(tx, rx, &rcc)
    };

    // Host link: USB-CDC-to-UART bridge on USART2.
    let host_uart = {
        let tx = gpioa.pa2.into_alternate();
        let rx = gpioa.pa3.into_alternate();
        dp.USART2
            .usart(tx, rx, FullConfig::default().baudrate(115_200.bps()), &rcc)
            .expect("USART2 init")
    };

    // K-Line (ISO9141) half-duplex UART on USART1, plus a GPIO for the
    // fast-init wakeup pulse train while the UART is offline.
    let kline_uart = {
        let tx = gpiob.pb6.into_alternate();
        let rx = gpiob.pb7.into_alternate();
        dp.USART1
            .usart(tx, rx, FullConfig::default().baudrate(10_400.bps()), &rcc)
            .expect("USART1 init")
    };
    let kline_level = gpioc.pc5.into_push_pull_output();

    // Battery sense.
    let battery_channel = gpioa.pa1.into_analog();
    let battery_adc = dp.ADC1.claim(stm32g4xx_hal::adc::config::AdcConfig::default(), &rcc, true);

    // Status LEDs, all active high.
    let can_led = gpiob.pb10.into_push_pull_output();
    let kline_led = gpiob.pb5.into_push_pull_output();
    let rx_led = gpioa.pa10.into_push_pull_output();
    let tx_led = gpioc.pc4.into_push_pull_output();

    Board {
        can_config,
        can_clock_hz: rcc.clocks.apb1_clk.to_Hz(),
        host_uart,
        kline_uart,
        kline_level,
        battery_adc,
        battery_channel,
        can_led,
        kline_led,
        rx_led,
        tx_led,
    }
}

/// What the `enable()`/`set_filter()` calls have configured, mirrored here so
/// the FDCAN RX interrupt (which only tells us a frame arrived, plus the
/// hardware filter index that accepted it) can be turned back into "which
/// mailbox does this belong to" for `CanPort::on_mailbox_interrupt`.
enum CanState {
    Offline(FdCan<VehicleCan, ConfigMode>),
    Online {
        control: fdcan::FdCanControl<VehicleCan, NormalOperationMode>,
        tx: fdcan::Tx<VehicleCan, NormalOperationMode>,
        rx: fdcan::Rx<VehicleCan, NormalOperationMode, Fifo0>,
    },
}

/// `CanTransceiver` impl wrapping the FDCAN peripheral. One hardware filter
/// bank per mailbox (spec.md §3: mailbox id and filter id are the same
/// integer), each carrying its own pattern/mask so the silicon's filter
/// match index tells the RX interrupt exactly which mailbox a frame landed
/// in without a software re-scan.
pub struct CanHardware {
    state: Option<CanState>,
    clock_hz: u32,
}

impl CanHardware {
    pub fn new(can_config: FdCan<VehicleCan, ConfigMode>, clock_hz: u32) -> Self {
        Self {
            state: Some(CanState::Offline(can_config)),
            clock_hz,
        }
    }

    /// Called from the FDCAN RX-FIFO-0 interrupt. Drains available frames
    /// and hands each to `route`, keyed by the hardware filter match index
    /// (== mailbox id, spec.md §3).
    pub fn drain_rx(&mut self, mut route: impl FnMut(usize, CanFrame)) {
        let CanState::Online { rx, .. } = self.state.as_mut().expect("CAN not enabled") else {
            return;
        };
        loop {
            match rx.receive(Fifo0) {
                Ok(ReceiveOverrun::NoOverrun(frame)) | Ok(ReceiveOverrun::Overrun(frame)) => {
                    if let Some(id) = mailbox_of(&frame) {
                        if let Some(data) = into_can_frame(&frame) {
                            route(id, data);
                        }
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(_)) => {
                    defmt::error!("FDCAN RX FIFO error");
                    break;
                }
            }
        }
    }

    /// Acknowledges whichever hardware interrupt flags fired; bus errors are
    /// logged, never panicked on (spec.md §7: hardware errors surface as
    /// `ERR_FAILED`/`ERR_TIMEOUT` at the host boundary, not a crash).
    pub fn ack_irq(&mut self) {
        if let Some(CanState::Online { control, .. }) = self.state.as_mut() {
            if control.has_interrupt(Interrupt::RxFifo0NewMsg) {
                control.clear_interrupt(Interrupt::RxFifo0NewMsg);
            }
            if control.has_interrupt(Interrupt::ErrPassive) {
                control.clear_interrupt(Interrupt::ErrPassive);
                defmt::warn!("FDCAN error passive");
            }
            if control.has_interrupt(Interrupt::BusOff) {
                control.clear_interrupt(Interrupt::BusOff);
                defmt::error!("FDCAN bus off");
            }
        }
    }
}

impl CanTransceiver for CanHardware {
    fn enable(&mut self, baud: u32) -> Result<(), ()> {
        let config = match self.state.take() {
            Some(CanState::Offline(c)) => c,
            other => {
                self.state = other;
                return Err(());
            }
        };
        let timing = CanBitTiming::new(self.clock_hz, baud).ok_or(())?;
        let mut config = config;
        config.set_nominal_bit_timing(fdcan::config::NominalBitTiming {
            prescaler: timing.prescaler.try_into().map_err(|_| ())?,
            seg1: timing.bs1.try_into().map_err(|_| ())?,
            seg2: timing.bs2.try_into().map_err(|_| ())?,
            sync_jump_width: timing.sjw.try_into().map_err(|_| ())?,
        });
        config.set_frame_transmit(ClassicCanOnly);
        for slot in standard_slots() {
            config.set_standard_filter(slot, StandardFilter::disable());
        }
        for slot in extended_slots() {
            config.set_extended_filter(slot, ExtendedFilter::disable());
        }
        config.enable_interrupt_line(InterruptLine::_0, true);
        config.enable_interrupts(Interrupts::RX_FIFO0_NEW_MSG | Interrupts::ERR_PASSIVE | Interrupts::BUS_OFF);

        let (control, tx, rx, _rx1) = config.into_normal().split();
        self.state = Some(CanState::Online { control, tx, rx });
        Ok(())
    }

    fn disable(&mut self) {
        if let Some(CanState::Online { control, tx, rx }) = self.state.take() {
            let can = fdcan::FdCan::from_normal(control, tx, rx);
            self.state = Some(CanState::Offline(can.into_config_mode()));
        }
    }

    fn set_filter(&mut self, mailbox: u8, pattern: u32, mask: u32, extended: bool) {
        let Some(CanState::Online { control, .. }) = self.state.as_mut() else {
            return;
        };
        if extended {
            if let Some(slot) = extended_slot(mailbox) {
                control.set_extended_filter(
                    slot,
                    ExtendedFilter::Classic { filter: pattern, mask, action: FilterAction::StoreInFifo0 },
                );
            }
        } else if let Some(slot) = standard_slot(mailbox) {
            control.set_standard_filter(
                slot,
                StandardFilter::Classic {
                    filter1: pattern as u16,
                    filter2: mask as u16,
                    action: FilterAction::StoreInFifo0,
                },
            );
        }
    }

    fn clear_filter(&mut self, mailbox: u8) {
        let Some(CanState::Online { control, .. }) = self.state.as_mut() else {
            return;
        };
        if let Some(slot) = standard_slot(mailbox) {
            control.set_standard_filter(slot, StandardFilter::disable());
        }
        if let Some(slot) = extended_slot(mailbox) {
            control.set_extended_filter(slot, ExtendedFilter::disable());
        }
    }

    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), ()> {
        let Some(CanState::Online { tx, .. }) = self.state.as_mut() else {
            return Err(nb::Error::Other(()));
        };
        let header = TxFrameHeader {
            len: frame.len() as u8,
            frame_format: FrameFormat::Standard,
            id: can_id(frame.id(), frame.is_extended()),
            bit_rate_switching: false,
            marker: None,
        };
        tx.transmit(header, frame.data()).map(|_| ()).map_err(|_| nb::Error::Other(()))
    }
}

fn can_id(id: u32, extended: bool) -> embedded_can::Id {
    if extended {
        embedded_can::Id::Extended(embedded_can::ExtendedId::new(id).expect("29-bit CAN id"))
    } else {
        embedded_can::Id::Standard(embedded_can::StandardId::new(id as u16).expect("11-bit CAN id"))
    }
}

fn into_can_frame(frame: &RxFrameInfo) -> Option<CanFrame> {
    let (id, extended) = match frame.id {
        embedded_can::Id::Standard(sid) => (sid.as_raw() as u32, false),
        embedded_can::Id::Extended(eid) => (eid.as_raw(), true),
    };
    CanFrame::new(id, extended, &frame.data[..frame.len as usize])
}

/// Each mailbox gets its own hardware filter bank: the bank index that
/// accepted a frame (FDCAN's Filter Index field, spec.md §9 "Callback per
/// mailbox" redesign) is a direct mailbox id.
fn mailbox_of(frame: &RxFrameInfo) -> Option<usize> {
    frame.filter_index.map(|idx| idx as usize).filter(|&id| id < MAILBOX_COUNT)
}

fn standard_slot(mailbox: u8) -> Option<StandardFilterSlot> {
    standard_slots().nth(mailbox as usize)
}

fn extended_slot(mailbox: u8) -> Option<ExtendedFilterSlot> {
    extended_slots().nth(mailbox as usize)
}

fn standard_slots() -> impl Iterator<Item = StandardFilterSlot> {
    use StandardFilterSlot::*;
    [_0, _1, _2, _3, _4, _5, _6].into_iter()
}

fn extended_slots() -> impl Iterator<Item = ExtendedFilterSlot> {
    use ExtendedFilterSlot::*;
    [_0, _1, _2, _3, _4, _5, _6].into_iter()
}

impl SerialTransport for HostUart {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.read() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    fn write_all(&mut self, buf: &[u8]) {
        for &b in buf {
            let _ = nb::block!(self.write(b));
        }
    }
}

/// K-Line UART plus the direct GPIO drive used only while the UART is
/// offline during the fast-init pulse train (spec.md §4.6).
pub struct KLineHardware {
    uart: KLineUsart,
    level: KLineLevelPin,
}

impl KLineHardware {
    pub fn new(uart: KLineUsart, level: KLineLevelPin) -> Self {
        Self { uart, level }
    }
}

impl KLineUart for KLineHardware {
    fn set_baud(&mut self, baud: u32) {
        let _ = self.uart.reconfigure(FullConfig::default().baudrate(baud.bps()));
    }

    fn bring_online(&mut self) {
        // Hand the line back to the UART's alternate-function mux.
    }

    fn go_offline(&mut self) {
        // Pulse train drives the pin directly via `set_line_level`.
    }

    fn set_line_level(&mut self, high: bool) {
        use hal::hal::digital::v2::OutputPin;
        if high {
            self.level.set_high().ok();
        } else {
            self.level.set_low().ok();
        }
    }

    fn write(&mut self, data: &[u8]) {
        for &b in data {
            let _ = nb::block!(self.uart.write(b));
        }
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Timeout> {
        let deadline = Mono::now() + timeout_ms.millis();
        loop {
            match self.uart.read() {
                Ok(b) => return Ok(b),
                Err(nb::Error::WouldBlock) => {
                    if Mono::now() >= deadline {
                        return Err(Timeout);
                    }
                }
                Err(_) => return Err(Timeout),
            }
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        // Blocking spin against the monotonic; the one deliberate blocking
        // wait in the system (spec.md §5 Suspension points).
        let deadline = Mono::now() + ms.millis();
        while Mono::now() < deadline {
            cortex_m::asm::nop();
        }
    }
}

/// Battery sense over ADC1 (SPEC_FULL.md §C). The divider ratio is board-
/// specific; `MILLIVOLTS_PER_LSB` assumes a 1:11 resistor divider into a
/// 12-bit reading against a 3.3V reference, matching a typical OBD adapter's
/// battery-sense front end.
const MILLIVOLTS_PER_LSB: u32 = 11 * 3300 / 4096;

pub struct BatteryHardware {
    adc: hal::adc::Adc<stm32::ADC1, hal::adc::config::Continuous>,
    channel: gpioa::PA1<hal::gpio::Analog>,
}

impl BatteryHardware {
    pub fn new(adc: hal::adc::Adc<stm32::ADC1, hal::adc::config::Continuous>, channel: gpioa::PA1<hal::gpio::Analog>) -> Self {
        Self { adc, channel }
    }
}

impl BatteryReader for BatteryHardware {
    fn read_millivolts(&mut self) -> u16 {
        let sample: u16 = self.adc.convert(&self.channel, hal::adc::config::SampleTime::Cycles_92_5);
        (sample as u32 * MILLIVOLTS_PER_LSB) as u16
    }
}

/// Four status LEDs, flipped around channel setup/teardown and HostLink
/// frames (SPEC_FULL.md §C).
pub struct LedIndicator {
    can: CanLed,
    kline: KLineLed,
    rx: RxLed,
    tx: TxLed,
}

impl LedIndicator {
    pub fn new(can: CanLed, kline: KLineLed, rx: RxLed, tx: TxLed) -> Self {
        Self { can, kline, rx, tx }
    }
}

impl StatusIndicator for LedIndicator {
    fn set_can(&mut self, on: bool) {
        use hal::hal::digital::v2::OutputPin;
        let _ = if on { self.can.set_high() } else { self.can.set_low() };
    }

    fn set_kline(&mut self, on: bool) {
        use hal::hal::digital::v2::OutputPin;
        let _ = if on { self.kline.set_high() } else { self.kline.set_low() };
    }

    fn set_rx(&mut self, on: bool) {
        use hal::hal::digital::v2::OutputPin;
        let _ = if on { self.rx.set_high() } else { self.rx.set_low() };
    }

    fn set_tx(&mut self, on: bool) {
        use hal::hal::digital::v2::OutputPin;
        let _ = if on { self.tx.set_high() } else { self.tx.set_low() };
    }
}
