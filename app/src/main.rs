//! Application image: bring everything up, then run the background loop.
//!
//! The high-priority work happens in interrupt handlers owned by the
//! library modules; this binary only sequences initialization and then
//! round-robins the background pollers.

#![no_std]
#![no_main]

// pick a panicking behavior
#[cfg(feature = "panic-halt")]
use panic_halt as _;
#[cfg(feature = "panic-itm")]
use panic_itm as _;

use cortex_m_rt::entry;

use flowsense::cmd::{Image, Session};
use flowsense::device;
use flowsense::flash::{FlashCtrl, FlashDev};
use flowsense::uart::UartTransport;
use flowsense::usbserial::UsbTransport;
use flowsense::{
    adc, clock, display, flash, pressure, scratch, store, tick, timebase, trace,
    uart, ui, usbserial,
};

/// Routes the fixed pin map: SPI1 clock/data on port B, I2C1 on PB6/PB7
/// (open drain), UART on PA9/PA10, USB on PA11/PA12. The pressure module
/// takes over PA0/PA5/PA6 itself.
fn route_pins(gpioa: &device::GPIOA, gpiob: &device::GPIOB) {
    // Port B alternate functions: SPI1 = AF5, I2C1 = AF4.
    gpiob.afrl.modify(|_, w| unsafe {
        w.afrl3().bits(5).afrl5().bits(5).afrl6().bits(4).afrl7().bits(4)
    });
    gpiob.otyper.modify(|_, w| w.ot6().set_bit().ot7().set_bit());
    gpiob.moder.modify(|_, w| unsafe {
        w.moder3()
            .bits(0b10)
            .moder5()
            .bits(0b10)
            .moder6()
            .bits(0b10)
            .moder7()
            .bits(0b10)
    });

    // Port A: UART = AF7, USB = AF10.
    gpioa.afrh.modify(|_, w| unsafe {
        w.afrh9()
            .bits(7)
            .afrh10()
            .bits(7)
            .afrh11()
            .bits(10)
            .afrh12()
            .bits(10)
    });
    gpioa.moder.modify(|_, w| unsafe {
        w.moder9()
            .bits(0b10)
            .moder10()
            .bits(0b10)
            .moder11()
            .bits(0b10)
            .moder12()
            .bits(0b10)
    });
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = device::Peripherals::take().unwrap();

    // Full access to the FPU before any float math runs.
    unsafe { cp.SCB.cpacr.modify(|v| v | (0b1111 << 20)) };

    scratch::clear();

    clock::init(&dp.RCC, &dp.FLASH, &dp.PWR);
    route_pins(&dp.GPIOA, &dp.GPIOB);
    timebase::init(dp.TIM16);

    flash::init_device(FlashDev::Ctrl(FlashCtrl::new(dp.FLASH)));
    let record = store::init_global().unwrap();
    pressure::load_config(&record);

    tick::init(&dp.TIM15, &mut cp.NVIC).unwrap();
    trace::init().unwrap();
    adc::init(dp.ADC1, dp.ADC2, &dp.ADC_COMMON, &dp.GPIOA).unwrap();
    pressure::init(dp.SPI1, dp.GPIOA, &mut cp.NVIC).unwrap();
    uart::init(dp.USART1, &mut cp.NVIC);
    usbserial::init(dp.USB);
    display::refresh::init(dp.I2C1, dp.DMA1, &mut cp.NVIC);

    tick::start(&dp.TIM15);

    let mut uart_session = Session::new(UartTransport, Image::Application);
    let mut usb_session = Session::new(UsbTransport, Image::Application);

    loop {
        usbserial::poll();
        uart_session.poll();
        usb_session.poll();
        pressure::poll();
        ui::poll();
    }
}
