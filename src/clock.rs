//! One-time CPU and clock-tree bring-up.
//!
//! The core runs at 80 MHz: MSI at 4 MHz feeds the PLL (×40, /2). HSI48,
//! trimmed against USB SOF by the CRS block, clocks the USB transceiver;
//! HSI16 feeds I2C1 so the display can keep its reference-manual example
//! timing constants.

use crate::device;

pub const CPU_HZ: u32 = 80_000_000;

pub fn init(rcc: &device::RCC, flash: &device::FLASH, pwr: &device::PWR) {
    // Clock every peripheral the firmware touches before anything else pokes
    // at one.
    rcc.ahb1enr.modify(|_, w| w.dma1en().set_bit());
    rcc.ahb2enr.modify(|_, w| {
        w.gpioaen()
            .set_bit()
            .gpioben()
            .set_bit()
            .adcen()
            .set_bit()
    });
    rcc.apb1enr1.modify(|_, w| {
        w.pwren()
            .set_bit()
            .i2c1en()
            .set_bit()
            .usbfsen()
            .set_bit()
            .crsen()
            .set_bit()
    });
    rcc.apb2enr.modify(|_, w| {
        w.syscfgen()
            .set_bit()
            .usart1en()
            .set_bit()
            .spi1en()
            .set_bit()
            .tim15en()
            .set_bit()
            .tim16en()
            .set_bit()
    });

    // Four wait states for 80 MHz at the default core voltage; caches and
    // prefetch on.
    flash.acr.modify(|_, w| {
        let w = unsafe { w.latency().bits(4) };
        w.icen().set_bit().dcen().set_bit().prften().set_bit()
    });

    // HSI48 for the USB block.
    rcc.crrcr.modify(|_, w| w.hsi48on().set_bit());
    while rcc.crrcr.read().hsi48rdy().bit_is_clear() {}

    // Fvco = 4 MHz * N / M = 160 MHz; /2 for the system clock.
    let n: u8 = 40;
    let m: u8 = 1;
    rcc.pllcfgr.write(|w| unsafe {
        w.pllsrc()
            .bits(0b01) // MSI
            .pllm()
            .bits(m - 1)
            .plln()
            .bits(n)
            .pllr()
            .bits(0b00) // /2
            .pllren()
            .set_bit()
    });

    // PLL on, plus HSI16 for the I2C kernel clock.
    rcc.cr.modify(|_, w| w.pllon().set_bit().hsion().set_bit());
    while rcc.cr.read().pllrdy().bit_is_clear() {}

    // Switch the system clock over.
    rcc.cfgr.modify(|_, w| unsafe { w.sw().bits(0b11) });
    while rcc.cfgr.read().sws().bits() != 0b11 {}

    // Kernel clock routing: HSI16 to I2C1, HSI48 (the reset default) to USB.
    rcc.ccipr
        .modify(|_, w| unsafe { w.i2c1sel().bits(0b10).clk48sel().bits(0b00) });

    // Power up the USB transceiver supply.
    pwr.cr2.modify(|_, w| w.usv().set_bit());
}
