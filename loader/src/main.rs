//! Loader image.
//!
//! Boots first. If the application region carries a valid `{length, crc}`
//! tail and nobody asked us to stay (the RAM swap flag), control jumps
//! straight into the application. Otherwise the loader stays resident and
//! serves the command plane, most usefully the FW_ERASE / FW_WRITE /
//! FW_CRC sequence that installs a fresh application.

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
use flowsense::flash::{Flash, FlashCtrl, FlashDev};
use flowsense::uart::UartTransport;
use flowsense::usbserial::UsbTransport;
use flowsense::{clock, flash, fwupdate, scratch, timebase, uart, usbserial};

/// Flash reads only; safe before any clock or peripheral setup.
struct RomWindow;

impl Flash for RomWindow {
    fn erase_page(&mut self, _: u32) -> Result<(), flowsense::error::Error> {
        Err(flowsense::error::Error::Flash)
    }
    fn program(&mut self, _: u32, _: &[u8]) -> Result<(), flowsense::error::Error> {
        Err(flowsense::error::Error::Flash)
    }
    fn read(&self, addr: u32, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe {
                core::ptr::read_volatile((addr as usize + i) as *const u8)
            };
        }
    }
}

/// Routes the pins the loader actually uses: UART on PA9/PA10, USB on
/// PA11/PA12.
fn route_pins(gpioa: &device::GPIOA) {
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
    // Decide before touching any peripheral, so the application inherits
    // a quiet chip.
    let stay = scratch::swap_requested();
    if !stay && fwupdate::check_main_image(&RomWindow) {
        fwupdate::jump_to_main();
    }
    // Next reset gets a fresh decision.
    scratch::clear_swap_flag();

    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = device::Peripherals::take().unwrap();

    clock::init(&dp.RCC, &dp.FLASH, &dp.PWR);
    route_pins(&dp.GPIOA);
    timebase::init(dp.TIM16);
    flash::init_device(FlashDev::Ctrl(FlashCtrl::new(dp.FLASH)));
    uart::init(dp.USART1, &mut cp.NVIC);
    usbserial::init(dp.USB);

    let mut uart_session = Session::new(UartTransport, Image::Loader);
    let mut usb_session = Session::new(UsbTransport, Image::Loader);

    loop {
        usbserial::poll();
        uart_session.poll();
        usb_session.poll();
    }
}
