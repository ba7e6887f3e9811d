//! The trace recorder.
//!
//! A development tool: up to four chosen quantities are sampled at a fixed
//! tick period into the reserved 8 KiB window in SRAM1, for the host to
//! pull back with PEEK and graph. The buffer address is part of the board
//! contract, pinned by the linker script.
//!
//! The control word is bit-mapped: bit 0 runs the trace (it self-clears as
//! the buffer fills), bit 1 switches to debug mode, where the firmware
//! itself stamps `(Δt µs, a, b, c)` quads via [`debug_trace`]. Remaining
//! bits are reserved and refused.
//!
//! The buffer is written only on the tick (or by `debug_trace` callers);
//! the background only reads.

use core::cell::UnsafeCell;

use crate::error::Error;
use crate::timebase;
use crate::util::spin_lock::SpinLock;
use crate::vars::{self, Accessors, VarDef, VarFlags};
use crate::{adc, pressure, scratch};

pub const TRACE_LEN_BYTES: usize = 0x2000;
pub const TRACE_LEN_WORDS: usize = TRACE_LEN_BYTES / 2;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TraceCtrl: u16 {
        const RUNNING = 0x0001;
        const DEBUG = 0x0002;
    }
}

/// The 8 KiB sample area. On target the linker pins it to its contractual
/// address (see `memory.x`); `repr` and the section are the whole layout.
struct TraceRam(UnsafeCell<[u16; TRACE_LEN_WORDS]>);

// Safety: written only from the tick tier (or debug_trace callers, which
// are tick-tier by convention); the background reads via PEEK, accepting
// torn in-progress samples.
unsafe impl Sync for TraceRam {}

#[cfg_attr(target_os = "none", link_section = ".trace")]
static TRACE_RAM: TraceRam = TraceRam(UnsafeCell::new([0; TRACE_LEN_WORDS]));

fn ram_write(ndx: usize, val: u16) {
    if ndx < TRACE_LEN_WORDS {
        // Safety: see TraceRam.
        unsafe {
            (*TRACE_RAM.0.get())[ndx] = val;
        }
    }
}

/// Sampler table. A trace variable id indexes this; id 0 means "slot
/// unused".
static SAMPLERS: [Option<fn() -> u16>; 10] = [
    None,                         // 0: nothing
    Some(dbg0),                   // 1..=4: debug scratch half-words, for
    Some(dbg1),                   //        ad-hoc instrumentation
    Some(dbg2),
    Some(dbg3),
    Some(adc::diff_pressure),     // 5: analog differential pressure
    Some(adc::battery),           // 6: battery voltage
    Some(adc::dpcal),             // 7: calibrated analog differential
    Some(pressure::trace_pressure1), // 8: gauge sensor 1
    Some(pressure::trace_pressure2), // 9: gauge sensor 2
];

fn dbg0() -> u16 {
    scratch::read_u16(0)
}
fn dbg1() -> u16 {
    scratch::read_u16(1)
}
fn dbg2() -> u16 {
    scratch::read_u16(2)
}
fn dbg3() -> u16 {
    scratch::read_u16(3)
}

pub struct TraceState {
    ctrl: TraceCtrl,
    period: u16,
    pct: u16,
    samples: u16,
    var_ids: [u16; 4],
    dbg_stamp: u16,
}

impl TraceState {
    pub const fn new() -> Self {
        TraceState {
            ctrl: TraceCtrl::empty(),
            period: 0,
            pct: 0,
            samples: 0,
            var_ids: [0; 4],
            dbg_stamp: 0,
        }
    }

    /// One tick of normal-mode sampling. `write` lands a 16-bit sample at
    /// a word index; injected so the logic is testable off-target.
    fn step(
        &mut self,
        samplers: &[Option<fn() -> u16>],
        write: &mut dyn FnMut(usize, u16),
    ) {
        if !self.ctrl.contains(TraceCtrl::RUNNING) {
            return;
        }

        self.pct = self.pct.wrapping_add(1);
        if self.pct < self.period {
            return;
        }
        self.pct = 0;

        for &id in self.var_ids.iter() {
            // The first empty slot ends the set.
            if id == 0 || id as usize >= samplers.len() {
                break;
            }
            if let Some(sample) = samplers[id as usize] {
                write(self.samples as usize, sample());
                self.samples = self.samples.wrapping_add(1);
            }
        }

        // Stop while a full sample set still fits.
        if self.samples as usize > TRACE_LEN_WORDS - 8 {
            self.ctrl.remove(TraceCtrl::RUNNING);
        }
    }

    /// One debug-mode record: Δt µs then the three caller words.
    fn debug_step(
        &mut self,
        now_us: u16,
        vals: [u16; 3],
        write: &mut dyn FnMut(usize, u16),
    ) {
        if !self.ctrl.contains(TraceCtrl::DEBUG) {
            return;
        }
        write(self.samples as usize, now_us.wrapping_sub(self.dbg_stamp));
        for (i, &v) in vals.iter().enumerate() {
            write(self.samples as usize + 1 + i, v);
        }
        self.samples = self.samples.wrapping_add(4);
        self.dbg_stamp = now_us;

        if self.samples as usize > TRACE_LEN_WORDS - 4 {
            self.ctrl = TraceCtrl::empty();
        }
    }

    /// Applies a host write of the control word, with its side effects, as
    /// one unit.
    fn apply_ctrl(&mut self, raw: u16, now_us: u16) -> Result<(), Error> {
        let new = TraceCtrl::from_bits(raw).ok_or(Error::Range)?;

        // Debug mode takes the buffer over wholesale.
        if new.contains(TraceCtrl::DEBUG) {
            self.ctrl = TraceCtrl::DEBUG;
            self.samples = 0;
            self.dbg_stamp = now_us;
            return Ok(());
        }

        if !self.ctrl.contains(TraceCtrl::RUNNING) && new.contains(TraceCtrl::RUNNING) {
            self.samples = 0;
            self.pct = 0;
        }
        self.ctrl = new;
        Ok(())
    }
}

static STATE: SpinLock<TraceState> = SpinLock::new(TraceState::new());

/// Tick-tier sampler. Skips the tick if the background is mid-update of
/// the control state.
pub fn tick() {
    let mut state = match STATE.try_lock() {
        Ok(s) => s,
        Err(_) => return,
    };
    state.step(&SAMPLERS, &mut ram_write);
}

/// Timestamp source for debug records; the host builds have no microsecond
/// timer to read.
fn stamp() -> u16 {
    if cfg!(target_os = "none") {
        timebase::now_us()
    } else {
        0
    }
}

/// Writes one `(Δt, a, b, c)` record when debug mode is armed. Call from
/// the tick tier only.
pub fn debug_trace(a: u16, b: u16, c: u16) {
    let mut state = match STATE.try_lock() {
        Ok(s) => s,
        Err(_) => return,
    };
    let now = stamp();
    state.debug_step(now, [a, b, c], &mut ram_write);
}

pub fn init() -> Result<(), Error> {
    vars::register(&VAR_CTRL)?;
    vars::register(&VAR_PERIOD)?;
    vars::register(&VAR_SAMPLES)?;
    vars::register(&VAR_TRACE1)?;
    vars::register(&VAR_TRACE2)?;
    vars::register(&VAR_TRACE3)?;
    vars::register(&VAR_TRACE4)?;
    Ok(())
}

// ---- variables ----

fn get_ctrl() -> i16 {
    STATE.lock().ctrl.bits() as i16
}

fn set_ctrl(v: i16) -> Result<(), Error> {
    let now = stamp();
    STATE.lock().apply_ctrl(v as u16, now)
}

fn get_period() -> i16 {
    STATE.lock().period as i16
}

fn set_period(v: i16) -> Result<(), Error> {
    STATE.lock().period = v as u16;
    Ok(())
}

fn get_samples() -> i16 {
    STATE.lock().samples as i16
}

fn get_var(n: usize) -> i16 {
    STATE.lock().var_ids[n] as i16
}

fn set_var(n: usize, v: i16) -> Result<(), Error> {
    STATE.lock().var_ids[n] = v as u16;
    Ok(())
}

fn get_var1() -> i16 {
    get_var(0)
}
fn get_var2() -> i16 {
    get_var(1)
}
fn get_var3() -> i16 {
    get_var(2)
}
fn get_var4() -> i16 {
    get_var(3)
}
fn set_var1(v: i16) -> Result<(), Error> {
    set_var(0, v)
}
fn set_var2(v: i16) -> Result<(), Error> {
    set_var(1, v)
}
fn set_var3(v: i16) -> Result<(), Error> {
    set_var(2, v)
}
fn set_var4(v: i16) -> Result<(), Error> {
    set_var(3, v)
}

static VAR_CTRL: VarDef = VarDef {
    id: 0,
    name: "trace_ctrl",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_ctrl,
        set: set_ctrl,
    },
};

static VAR_PERIOD: VarDef = VarDef {
    id: 1,
    name: "trace_period",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_period,
        set: set_period,
    },
};

static VAR_SAMPLES: VarDef = VarDef {
    id: 2,
    name: "trace_samples",
    flags: VarFlags::READ_ONLY,
    access: Accessors::I16 {
        get: get_samples,
        set: vars::deny_i16,
    },
};

static VAR_TRACE1: VarDef = VarDef {
    id: 3,
    name: "trace_var1",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_var1,
        set: set_var1,
    },
};

static VAR_TRACE2: VarDef = VarDef {
    id: 4,
    name: "trace_var2",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_var2,
        set: set_var2,
    },
};

static VAR_TRACE3: VarDef = VarDef {
    id: 5,
    name: "trace_var3",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_var3,
        set: set_var3,
    },
};

static VAR_TRACE4: VarDef = VarDef {
    id: 6,
    name: "trace_var4",
    flags: VarFlags::empty(),
    access: Accessors::I16 {
        get: get_var4,
        set: set_var4,
    },
};
