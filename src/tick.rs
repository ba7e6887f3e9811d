//! The high-priority loop tick.
//!
//! TIM15 interrupts at [`LOOP_FREQ`](crate::timebase::LOOP_FREQ). The
//! handler runs the real-time work in a fixed order: ADC read, pressure
//! acquisition, drift compensation, display-history accumulation, then the
//! trace sampler last so it can observe everything the tick produced.
//!
//! The interrupt is configured at the lowest hardware priority, so the
//! peripheral completion ISRs (SPI, I2C, UART) preempt it freely.

use crate::device;
use crate::device::interrupt;
use crate::error::Error;
use crate::timebase::LOOP_FREQ;
use crate::vars::{self, Accessors, VarDef, VarFlags};
use crate::{adc, armv7m, autooffset, calc, pressure, timebase, trace};

static VAR_LOOP_FREQ: VarDef = VarDef {
    id: 7,
    name: "loop_freq",
    flags: VarFlags::READ_ONLY,
    access: Accessors::I16 {
        get: get_loop_freq,
        set: vars::deny_i16,
    },
};

fn get_loop_freq() -> i16 {
    LOOP_FREQ as i16
}

/// Sets TIM15 up for a 1 kHz update interrupt at the lowest priority, but
/// does not start it; call [`start`] once every module is initialized.
pub fn init(
    tim15: &device::TIM15,
    nvic: &mut cortex_m::peripheral::NVIC,
) -> Result<(), Error> {
    let us_per_loop = 1_000_000 / LOOP_FREQ;
    tim15
        .psc
        .write(|w| unsafe { w.psc().bits((crate::clock::CPU_HZ / 1_000_000 - 1) as u16) });
    tim15
        .arr
        .write(|w| unsafe { w.arr().bits((us_per_loop - 1) as u16) });

    armv7m::set_irq_priority(nvic, device::Interrupt::TIM1_BRK_TIM15, 15);

    vars::register(&VAR_LOOP_FREQ)
}

pub fn start(tim15: &device::TIM15) {
    tim15.sr.write(|w| unsafe { w.bits(0) });
    tim15.dier.write(|w| w.uie().set_bit());
    armv7m::enable_irq(device::Interrupt::TIM1_BRK_TIM15);
    tim15.cr1.modify(|_, w| w.cen().set_bit());
}

#[interrupt]
fn TIM1_BRK_TIM15() {
    // Safety: acknowledging the update flag on the timer this module owns.
    let tim15 = unsafe { &*device::TIM15::ptr() };
    tim15.sr.write(|w| unsafe { w.bits(0) });

    timebase::advance_tick();

    adc::tick();
    pressure::tick();
    autooffset::tick();
    calc::tick();
    trace::tick();

    // Everything interested in this cycle's sample pair has now seen it.
    pressure::clear_new_reading();
}
