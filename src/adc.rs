//! Analog inputs: the auxiliary differential pressure sensor and the
//! battery voltage divider.
//!
//! ADC1 samples the analog differential sensor on IN6 (PA1), ADC2 the
//! battery divider on IN7 (PA2). The tick grabs the previous conversions
//! and retriggers; the values feed the trace sampler table and the `vbat`
//! variable.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::device;
use crate::error::Error;
use crate::timebase::busy_wait;
use crate::util::spin_lock::{acquire_hw, SpinLock};
use crate::vars::{self, Accessors, VarDef, VarFlags};

struct Hw {
    adc1: device::ADC1,
    adc2: device::ADC2,
}

static HW: SpinLock<Option<Hw>> = SpinLock::new(None);

static PRESSURE: AtomicU16 = AtomicU16::new(0);
static BAT_VOLT: AtomicU16 = AtomicU16::new(0);

/// Analog flow calibration: raw counts at 200 mL/sec steps.
static ANALOG_CAL: [u16; 9] = [
    14300, // 0 mL/sec
    15532, // 200
    18878, // 400
    24290, // 600
    32064, // 800
    41230, // 1000
    52639, // 1200
    63640, // 1400
    65535, // 1600
];

/// Power-up and calibration sequence, identical for both converters.
macro_rules! power_up {
    ($adc:expr) => {{
        // Out of deep power-down, regulator on; the datasheet start-up
        // time is 20 µs, wait 30.
        $adc.cr.modify(|_, w| w.deeppwd().clear_bit());
        $adc.cr.modify(|_, w| w.advregen().set_bit());
        busy_wait(30);

        // Single-ended calibration.
        $adc.cr.modify(|_, w| w.adcal().set_bit());
        while $adc.cr.read().adcal().bit_is_set() {}

        $adc.isr.write(|w| unsafe { w.bits(0x3FF) });
        $adc.cr.modify(|_, w| w.aden().set_bit());
        while $adc.isr.read().adrdy().bit_is_clear() {}
    }};
}

pub fn init(
    adc1: device::ADC1,
    adc2: device::ADC2,
    common: &device::ADC_COMMON,
    gpioa: &device::GPIOA,
) -> Result<(), Error> {
    // Synchronous clock, HCLK/4.
    common.ccr.modify(|_, w| unsafe { w.ckmode().bits(0b11) });

    // PA1 is the analog sensor, PA2 the battery divider; analog mode is
    // 0b11.
    gpioa
        .moder
        .modify(|_, w| unsafe { w.moder1().bits(0b11).moder2().bits(0b11) });

    power_up!(adc1);
    power_up!(adc2);

    // ~3 µs sample time; longer makes no measurable difference.
    adc1.smpr1.modify(|_, w| unsafe { w.smp6().bits(0b110) });
    adc2.smpr1.modify(|_, w| unsafe { w.smp7().bits(0b110) });

    // One-conversion sequences: IN6 on ADC1, IN7 on ADC2.
    adc1.sqr1.write(|w| unsafe { w.sq1().bits(6) });
    adc2.sqr1.write(|w| unsafe { w.sq1().bits(7) });

    adc1.cr.modify(|_, w| w.adstart().set_bit());
    adc2.cr.modify(|_, w| w.adstart().set_bit());

    *HW.lock() = Some(Hw { adc1, adc2 });

    vars::register(&VAR_VBAT)
}

/// Tick: collect the completed conversions and start the next pair.
pub fn tick() {
    let hw = match acquire_hw(&HW) {
        Some(hw) => hw,
        None => return,
    };
    PRESSURE.store(hw.adc1.dr.read().bits() as u16, Ordering::Relaxed);
    BAT_VOLT.store(hw.adc2.dr.read().bits() as u16, Ordering::Relaxed);
    hw.adc1.cr.modify(|_, w| w.adstart().set_bit());
    hw.adc2.cr.modify(|_, w| w.adstart().set_bit());
}

/// Raw analog differential pressure counts.
pub fn diff_pressure() -> u16 {
    PRESSURE.load(Ordering::Relaxed)
}

pub fn battery() -> u16 {
    BAT_VOLT.load(Ordering::Relaxed)
}

/// Analog differential run through the 9-point calibration, in mL/sec.
pub fn dpcal() -> u16 {
    calibrated(diff_pressure(), &ANALOG_CAL)
}

fn calibrated(raw: u16, cal: &[u16; 9]) -> u16 {
    if raw < cal[0] {
        return 0;
    }
    for i in 1..cal.len() {
        if raw > cal[i] {
            continue;
        }
        let n = (raw - cal[i - 1]) as u32;
        let d = (cal[i] - cal[i - 1]) as u32;
        return ((i as u32 - 1) * 200 + 200 * n / d) as u16;
    }
    1600
}

fn get_vbat() -> i16 {
    battery() as i16
}

static VAR_VBAT: VarDef = VarDef {
    id: 14,
    name: "vbat",
    flags: VarFlags::READ_ONLY,
    access: Accessors::I16 {
        get: get_vbat,
        set: vars::deny_i16,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_endpoints_and_midpoints() {
        assert_eq!(calibrated(0, &ANALOG_CAL), 0);
        assert_eq!(calibrated(14299, &ANALOG_CAL), 0);
        assert_eq!(calibrated(14300, &ANALOG_CAL), 0);
        // Halfway up the first segment.
        let mid = (14300 + 15532) / 2;
        assert_eq!(calibrated(mid, &ANALOG_CAL), 100);
        assert_eq!(calibrated(65535, &ANALOG_CAL), 1600);
    }

    #[test]
    fn calibration_is_monotone() {
        let mut last = 0;
        for raw in (0..=65535u32).step_by(97) {
            let v = calibrated(raw as u16, &ANALOG_CAL);
            assert!(v >= last);
            last = v;
        }
    }
}
