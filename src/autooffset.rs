//! Sensor drift compensation.
//!
//! The two pressure channels drift slowly and independently. When both
//! look quiet (neither deviates from its own 1 Hz lowpass by more than
//! the motion threshold for a full second), whatever differential remains
//! is presumed to be drift, and a correction term is integrated against
//! it. The term feeds back into [`crate::pressure::differential`].
//!
//! Runs exclusively on the tick; the correction itself is published as an
//! f32 bit pattern so any tier can read it.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::filter::Biquad;
use crate::pressure;
use crate::timebase::LOOP_FREQ;
use crate::util::spin_lock::SpinLock;

/// Deviation (kPa) between a reading and its filtered value that counts as
/// motion.
const MAX_PRES_DIFF: f32 = 0.005;

/// Integrator gain applied to the quiescent differential, per tick.
const GAIN: f32 = 1e-5;

/// 1 Hz 2-pole Butterworth at the 1 kHz tick rate.
pub const COEF_A: [f32; 2] = [-1.99111, 0.99115];
pub const COEF_B: [f32; 3] = [9.8259e-06, 1.9652e-05, 9.8259e-06];

static FILTERS: SpinLock<[Biquad; 2]> = SpinLock::new([
    Biquad::new(COEF_A, COEF_B),
    Biquad::new(COEF_A, COEF_B),
]);

/// Ticks left before the channels are trusted as quiet.
static IGNORE: AtomicU32 = AtomicU32::new(LOOP_FREQ);

/// The correction, as f32 bits.
static OFFSET: AtomicU32 = AtomicU32::new(0);

/// Runs the motion gate and, once armed, nudges the correction. Tick tier
/// only.
pub fn tick() {
    let mut filters = match FILTERS.try_lock() {
        Ok(f) => f,
        // Somebody is resetting; skip this tick.
        Err(_) => return,
    };

    for (ch, filt) in filters.iter_mut().enumerate() {
        let p = pressure::pressure_kpa(ch);
        let f = filt.filter(p);
        if libm::fabsf(p - f) > MAX_PRES_DIFF {
            IGNORE.store(LOOP_FREQ, Ordering::Relaxed);
        }
    }

    let left = IGNORE.load(Ordering::Relaxed);
    if left > 0 {
        IGNORE.store(left - 1, Ordering::Relaxed);
        return;
    }

    // Quiet: the differential (which already includes the current
    // correction) should read zero. Integrate out what's left.
    let pd = pressure::differential();
    let new = offset() - pd * GAIN;
    OFFSET.store(new.to_bits(), Ordering::Relaxed);
}

pub fn offset() -> f32 {
    f32::from_bits(OFFSET.load(Ordering::Relaxed))
}

/// Drops the correction to zero and restarts the quiet timer. Manual
/// recalibration hook.
pub fn clear() {
    OFFSET.store(0, Ordering::Relaxed);
    IGNORE.store(LOOP_FREQ, Ordering::Relaxed);
    if let Ok(mut filters) = FILTERS.try_lock() {
        for f in filters.iter_mut() {
            f.clear();
        }
    }
}
