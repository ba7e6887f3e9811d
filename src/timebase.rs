//! Time bases: a free-running microsecond counter and the loop tick count.
//!
//! TIM16 counts microseconds in 16 bits, wrapping every 65.536 ms; it backs
//! short bounded busy-waits and the debug-trace timestamps. The tick count
//! is advanced exactly once per 1 kHz tick interrupt (see [`crate::tick`])
//! and is the clock for everything scheduled in loop periods.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::clock::CPU_HZ;
use crate::device;

/// High-priority loop frequency, Hz.
pub const LOOP_FREQ: u32 = 1000;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Starts TIM16 counting at 1 MHz. The peripheral is owned by this module
/// from here on; only [`now_us`] touches it, read-only.
pub fn init(tim16: device::TIM16) {
    tim16.psc.write(|w| unsafe { w.psc().bits((CPU_HZ / 1_000_000 - 1) as u16) });
    tim16.arr.write(|w| unsafe { w.arr().bits(0xFFFF) });
    tim16.cr1.write(|w| w.cen().set_bit());
}

/// Current microsecond counter. Wraps every 65.536 ms; compare with
/// [`us_since`], never directly.
pub fn now_us() -> u16 {
    // Safety: read-only access to a free-running counter this module set up.
    let tim16 = unsafe { &*device::TIM16::ptr() };
    tim16.cnt.read().bits() as u16
}

/// Wrap-safe microseconds elapsed since `t0`.
pub fn us_since(t0: u16) -> u16 {
    now_us().wrapping_sub(t0)
}

/// Spins for `us` microseconds. Callers keep these short and bounded
/// (3 µs sensor settle, 30 µs ADC regulator, 500 µs display init).
pub fn busy_wait(us: u16) {
    let start = now_us();
    while us_since(start) < us {}
}

pub fn tick_count() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Wrap-safe ticks elapsed since `t0`.
pub fn ticks_since(t0: u32) -> u32 {
    tick_count().wrapping_sub(t0)
}

pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms * LOOP_FREQ / 1000
}

/// Called from the tick ISR, once, before any component tick runs.
pub(crate) fn advance_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion() {
        assert_eq!(ms_to_ticks(6), 6);
        assert_eq!(ms_to_ticks(1000), LOOP_FREQ);
    }

    #[test]
    fn tick_counter_advances_and_wraps() {
        let t0 = tick_count();
        advance_tick();
        assert_eq!(ticks_since(t0), 1);
        // A t0 taken just before the counter wrap still yields a small,
        // positive delta.
        assert!(ticks_since(u32::MAX - 1) >= 2);
    }
}
